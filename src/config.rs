//! Configuration file loading and merging with command-line arguments
//!
//! Values given on the command line (or through `BURROW_*` environment
//! variables) take precedence over the YAML file; anything left unset falls
//! back to the library defaults.

use anyhow::{Context, Result};
use burrow_client::AgentConfig;
use burrow_relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelayFileConfig,

    #[serde(default)]
    pub agent: AgentFileConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelayFileConfig {
    pub bind: Option<SocketAddr>,

    /// Environment variable holding the JWT secret
    pub jwt_secret_env: Option<String>,

    /// Inline JWT secret (prefer `jwt_secret_env`)
    pub jwt_secret: Option<String>,

    pub jwt_issuer: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentFileConfig {
    pub relay: Option<String>,

    /// Environment variable holding the agent credential
    pub token_env: Option<String>,

    /// Inline agent credential (prefer `token_env`)
    pub token: Option<String>,

    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub keepalive_secs: Option<u64>,
    pub liveness_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub reconnect_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

/// Relay options as given on the command line
#[derive(Debug, Default)]
pub struct RelayOverrides {
    pub bind: Option<SocketAddr>,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
}

/// Agent options as given on the command line
#[derive(Debug, Default)]
pub struct AgentOverrides {
    pub relay: Option<String>,
    pub token: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub keepalive_secs: Option<u64>,
    pub liveness_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub reconnect_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Resolve a secret given inline or through an environment variable name
fn resolve_secret(inline: Option<String>, env_var: Option<&str>) -> Result<Option<String>> {
    if let Some(env_var) = env_var {
        let value = std::env::var(env_var)
            .with_context(|| format!("Environment variable {} not set", env_var))?;
        return Ok(Some(value));
    }
    Ok(inline)
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

/// Merge CLI args with the config file, giving precedence to CLI args
pub fn build_relay_config(cli: RelayOverrides, file: RelayFileConfig) -> Result<RelayConfig> {
    let defaults = RelayConfig::default();

    let jwt_secret = match cli.jwt_secret {
        Some(secret) => secret,
        None => resolve_secret(file.jwt_secret, file.jwt_secret_env.as_deref())?
            .unwrap_or_default(),
    };

    if jwt_secret.is_empty() {
        anyhow::bail!(
            "JWT secret is required (use --jwt-secret, BURROW_JWT_SECRET, or config file)"
        );
    }

    Ok(RelayConfig {
        bind_addr: cli.bind.or(file.bind).unwrap_or(defaults.bind_addr),
        jwt_secret,
        jwt_issuer: cli.jwt_issuer.or(file.jwt_issuer),
        request_timeout: secs(
            cli.request_timeout_secs.or(file.request_timeout_secs),
            defaults.request_timeout,
        ),
        handshake_timeout: secs(
            cli.handshake_timeout_secs.or(file.handshake_timeout_secs),
            defaults.handshake_timeout,
        ),
        idle_timeout: secs(
            cli.idle_timeout_secs.or(file.idle_timeout_secs),
            defaults.idle_timeout,
        ),
        max_body_bytes: cli
            .max_body_bytes
            .or(file.max_body_bytes)
            .unwrap_or(defaults.max_body_bytes),
    })
}

/// Merge CLI args with the config file, giving precedence to CLI args
pub fn build_agent_config(cli: AgentOverrides, file: AgentFileConfig) -> Result<AgentConfig> {
    let defaults = AgentConfig::default();

    let relay_url = cli.relay.or(file.relay).unwrap_or_default();
    if relay_url.is_empty() {
        anyhow::bail!("Relay address is required (use --relay or config file)");
    }

    let credential = match cli.token {
        Some(token) => token,
        None => resolve_secret(file.token, file.token_env.as_deref())?.unwrap_or_default(),
    };
    if credential.is_empty() {
        anyhow::bail!("Agent token is required (use --token, BURROW_TOKEN, or config file)");
    }

    let config = AgentConfig {
        relay_url,
        credential,
        local_host: cli
            .local_host
            .or(file.local_host)
            .unwrap_or(defaults.local_host),
        local_port: cli
            .local_port
            .or(file.local_port)
            .unwrap_or(defaults.local_port),
        keepalive_interval: secs(
            cli.keepalive_secs.or(file.keepalive_secs),
            defaults.keepalive_interval,
        ),
        liveness_timeout: secs(
            cli.liveness_timeout_secs.or(file.liveness_timeout_secs),
            defaults.liveness_timeout,
        ),
        request_timeout: secs(
            cli.request_timeout_secs.or(file.request_timeout_secs),
            defaults.request_timeout,
        ),
        reconnect_interval: secs(
            cli.reconnect_secs.or(file.reconnect_secs),
            defaults.reconnect_interval,
        ),
        connect_timeout: secs(
            cli.connect_timeout_secs.or(file.connect_timeout_secs),
            defaults.connect_timeout,
        ),
    };

    // Surface URL and interval problems before the first connection attempt
    config
        .control_url()
        .context("Invalid agent configuration")?;

    Ok(config)
}
