use std::{env, net::SocketAddr};

use thiserror::Error;

pub const MESSAGES_PATH: &str = "/messages";
const RESERVED_PATHS: &[&str] = &[MESSAGES_PATH, "/ping", "/health"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub command: String,
    pub args: Vec<String>,
    pub debug: bool,
    pub endpoint: String,
    pub bind_addr: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: mcp-sse-proxy <command> [args...]")]
    MissingCommand,
    #[error("MCP_PROXY_PORT must be a valid u16")]
    InvalidPort,
    #[error("MCP_PROXY_ENDPOINT must start with `/` and not collide with /messages, /ping or /health")]
    InvalidEndpoint,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    /// Reads the upstream command from `args` (program name already skipped)
    /// and everything else from `MCP_PROXY_*` environment variables.
    pub fn from_env_and_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::from_lookup(args, |key| env::var(key).ok())
    }

    pub fn from_lookup(
        args: impl IntoIterator<Item = String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut args = args.into_iter();
        let command = args
            .next()
            .map(|command| command.trim().to_string())
            .filter(|command| !command.is_empty())
            .ok_or(ConfigError::MissingCommand)?;

        let debug = lookup("MCP_PROXY_DEBUG")
            .map(|value| {
                matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);
        let endpoint = lookup("MCP_PROXY_ENDPOINT")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "/sse".to_string());
        if !endpoint.starts_with('/') || RESERVED_PATHS.contains(&endpoint.as_str()) {
            return Err(ConfigError::InvalidEndpoint);
        }

        let bind_addr = lookup("MCP_PROXY_BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = lookup("MCP_PROXY_PORT")
            .map(|value| value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let config = Self {
            command,
            args: args.collect(),
            debug,
            endpoint,
            bind_addr,
            port,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}
