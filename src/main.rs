//! Burrow CLI - expose a private HTTP service through a public relay
//!
//! One binary, three roles: the public `relay`, the private-side `agent`, and
//! an offline `token` tool minting agent credentials.

mod config;

use anyhow::{Context, Result};
use burrow_auth::CredentialIssuer;
use burrow_client::{ConnectionController, HttpLocalService};
use burrow_relay::RelayServer;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AgentOverrides, ConfigFile, RelayOverrides};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Burrow - tunnel a private HTTP service through a public relay
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - tunnel a private HTTP service through a public relay")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, global = true, default_value = "info", env = "BURROW_LOG")]
    log_level: String,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. Public HTTP requests on the bind address are tunneled
to the single attached agent; agents connect to /_burrow/connect.

EXAMPLES:
  burrow relay --bind 0.0.0.0:8080 --jwt-secret $SECRET

ENVIRONMENT VARIABLES:
  BURROW_BIND              Address to listen on
  BURROW_JWT_SECRET        Secret agent credentials are signed with
  BURROW_REQUEST_TIMEOUT   Seconds a public caller waits for the agent
"#)]
    Relay(RelayArgs),

    /// Run the agent next to the private service
    #[command(long_about = r#"
Connect to a relay and serve tunneled requests from a local HTTP service.
Reconnects on a fixed interval whenever the connection drops.

EXAMPLES:
  burrow agent --relay wss://relay.example.com --token $TOKEN --local-port 3000

  burrow agent --config burrow.yaml

ENVIRONMENT VARIABLES:
  BURROW_RELAY       Relay URL (ws:// or wss://)
  BURROW_TOKEN       Agent credential
  BURROW_LOCAL_HOST  Local service host
  BURROW_LOCAL_PORT  Local service port
"#)]
    Agent(AgentArgs),

    /// Mint an agent credential
    Token(TokenArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Address to listen on [default: 0.0.0.0:8080]
    #[arg(long, env = "BURROW_BIND")]
    bind: Option<SocketAddr>,

    /// Secret agent credentials are signed with
    #[arg(long, env = "BURROW_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Required credential issuer (any issuer when unset)
    #[arg(long, env = "BURROW_JWT_ISSUER")]
    jwt_issuer: Option<String>,

    /// Seconds a public caller waits for the agent [default: 30]
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Seconds a new agent has to present its credential [default: 10]
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Seconds of agent silence before the session is dropped [default: 90]
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Largest public request body in bytes, at most 15728640 [default: 10485760]
    #[arg(long)]
    max_body_bytes: Option<usize>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Relay URL (e.g., wss://relay.example.com)
    #[arg(long, env = "BURROW_RELAY")]
    relay: Option<String>,

    /// Agent credential
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Local service host [default: 127.0.0.1]
    #[arg(long, env = "BURROW_LOCAL_HOST")]
    local_host: Option<String>,

    /// Local service port [default: 3000]
    #[arg(long, env = "BURROW_LOCAL_PORT")]
    local_port: Option<u16>,

    /// Seconds between keepalives [default: 30]
    #[arg(long)]
    keepalive: Option<u64>,

    /// Seconds without relay traffic before reconnecting [default: 90]
    #[arg(long)]
    liveness_timeout: Option<u64>,

    /// Seconds a local service call may take [default: 30]
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Seconds between reconnection attempts [default: 5]
    #[arg(long)]
    reconnect_interval: Option<u64>,

    /// Seconds allowed for connecting and the handshake [default: 10]
    #[arg(long)]
    connect_timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct TokenArgs {
    /// Secret shared with the relay
    #[arg(long, env = "BURROW_JWT_SECRET", hide_env_values = true)]
    secret: String,

    /// Agent identity embedded in the credential
    #[arg(long)]
    agent_id: String,

    /// Validity in hours
    #[arg(long, default_value = "24")]
    hours: i64,

    /// Issuer claim
    #[arg(long, default_value = burrow_auth::DEFAULT_ISSUER)]
    issuer: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();

    Ok(())
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        token.cancel();
    });
}

async fn run_relay(args: RelayArgs, file: ConfigFile) -> Result<()> {
    let overrides = RelayOverrides {
        bind: args.bind,
        jwt_secret: args.jwt_secret,
        jwt_issuer: args.jwt_issuer,
        request_timeout_secs: args.request_timeout,
        handshake_timeout_secs: args.handshake_timeout,
        idle_timeout_secs: args.idle_timeout,
        max_body_bytes: args.max_body_bytes,
    };
    let config = config::build_relay_config(overrides, file.relay)
        .context("Failed to build relay configuration")?;

    info!("Request timeout: {}s", config.request_timeout.as_secs());
    info!("Idle timeout: {}s", config.idle_timeout.as_secs());

    let server = RelayServer::new(config).context("Failed to create relay")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    server.start(shutdown).await.context("Relay failed")?;

    info!("Relay stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs, file: ConfigFile) -> Result<()> {
    let overrides = AgentOverrides {
        relay: args.relay,
        token: args.token,
        local_host: args.local_host,
        local_port: args.local_port,
        keepalive_secs: args.keepalive,
        liveness_timeout_secs: args.liveness_timeout,
        request_timeout_secs: args.request_timeout,
        reconnect_secs: args.reconnect_interval,
        connect_timeout_secs: args.connect_timeout,
    };
    let config = config::build_agent_config(overrides, file.agent)
        .context("Failed to build agent configuration")?;

    // Log configuration (but not the credential)
    info!("Relay: {}", config.relay_url);
    info!("Local service: {}", config.local_base_url());
    info!(
        "Credential: {}",
        burrow_auth::credential_fingerprint(&config.credential)
    );

    let service = HttpLocalService::new(config.local_base_url())
        .context("Failed to create local service client")?;
    let controller = ConnectionController::new(config, Arc::new(service));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    controller.run(shutdown).await.context("Agent failed")?;

    Ok(())
}

fn run_token(args: TokenArgs) -> Result<()> {
    if args.hours <= 0 {
        anyhow::bail!("--hours must be positive");
    }

    let issuer = CredentialIssuer::new(args.secret.as_bytes())
        .context("Failed to create credential issuer")?
        .with_issuer(args.issuer);

    let token = issuer
        .issue(&args.agent_id, burrow_auth::Duration::hours(args.hours))
        .context("Failed to issue credential")?;

    info!(
        "Issued credential for '{}' valid for {}h",
        args.agent_id, args.hours
    );
    println!("{}", token);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Relay(args) => run_relay(args, file).await,
        Commands::Agent(args) => run_agent(args, file).await,
        Commands::Token(args) => run_token(args),
    }
}
