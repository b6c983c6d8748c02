//! Generate an agent credential for the relay
//!
//! Usage:
//!   cargo run -p burrow-auth --example generate_token -- --secret "your-secret-key"
//!   cargo run -p burrow-auth --example generate_token -- --secret "your-secret-key" --agent-id "office-nas"

use burrow_auth::{CredentialIssuer, Duration, JwtVerifier};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "generate_token")]
#[command(about = "Generate an agent credential for the burrow relay", long_about = None)]
struct Args {
    /// JWT secret (must match the relay's secret)
    #[arg(long, env = "BURROW_JWT_SECRET")]
    secret: String,

    /// Agent identity embedded in the credential
    #[arg(long, default_value = "agent")]
    agent_id: String,

    /// Token validity in hours (default: 24)
    #[arg(long, default_value = "24")]
    hours: i64,
}

fn main() {
    let args = Args::parse();

    let issuer = match CredentialIssuer::new(args.secret.as_bytes()) {
        Ok(issuer) => issuer,
        Err(e) => {
            eprintln!("Failed to create issuer: {}", e);
            std::process::exit(1);
        }
    };

    match issuer.issue(&args.agent_id, Duration::hours(args.hours)) {
        Ok(token) => {
            let expires = JwtVerifier::new(args.secret.as_bytes())
                .validate(&token)
                .map(|claims| claims.exp_formatted())
                .unwrap_or_else(|_| "unknown".to_string());

            println!("Agent ID:   {}", args.agent_id);
            println!("Expires:    {}", expires);
            println!("\nToken:");
            println!("{}\n", token);
            println!("Usage:");
            println!("  export BURROW_TOKEN=\"{}\"", token);
            println!("  burrow agent --relay ws://relay.example.com:8080 --local-port 3000\n");
        }
        Err(e) => {
            eprintln!("Failed to generate token: {}", e);
            std::process::exit(1);
        }
    }
}
