//! Server configuration from command-line flags and environment.

use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, ValueEnum};

use crate::interceptor::{AllowAll, Authenticator, InterceptorConfig, StaticTokens};

/// Rejected configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid log level {0:?}, expected one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),
    #[error("metrics port {0} collides with the gRPC port")]
    PortConflict(u16),
    #[error("auth tokens given but authentication is disabled")]
    TokensWithoutAuth,
    #[error("empty auth token")]
    EmptyToken,
}

/// Log output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Settings for the process-wide log output.
#[derive(Debug, Clone, Args)]
pub struct LogConfig {
    /// Minimum level: trace, debug, info, warn or error. `RUST_LOG` overrides it.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// strftime-style timestamp format; RFC 3339 when unset.
    #[arg(long, env = "LOG_TIME_FORMAT")]
    pub log_time_format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            log_time_format: None,
        }
    }
}

impl LogConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidLogLevel`] for an unknown level name.
    pub fn level(&self) -> Result<tracing::Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "reqlog-server", version, about = "gRPC ToDo service with structured call logging")]
pub struct ServerConfig {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// 0 picks an ephemeral port.
    #[arg(long, env = "GRPC_PORT", default_value_t = 9090)]
    pub grpc_port: u16,

    #[arg(long, env = "AUTH_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub auth_enabled: bool,

    /// Accepted bearer token, as `subject:token` or a bare token. Repeatable.
    /// Without any, authentication accepts every caller.
    #[arg(long = "auth-token", env = "AUTH_TOKENS", value_delimiter = ',')]
    pub auth_tokens: Vec<String>,

    #[arg(long, env = "LOG_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub log_enabled: bool,

    /// Include request content in payload log lines.
    #[arg(long, env = "LOG_PAYLOAD", default_value_t = true, action = ArgAction::Set)]
    pub log_payload: bool,

    /// Promote request fields to `grpc.request.<field>` tags.
    #[arg(long, env = "EXTRACT_FIELDS", default_value_t = true, action = ArgAction::Set)]
    pub extract_fields: bool,

    #[command(flatten)]
    pub log: LogConfig,

    /// How long to wait for in-flight calls after shutdown is requested.
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            grpc_port: 0,
            auth_enabled: true,
            auth_tokens: Vec::new(),
            log_enabled: true,
            log_payload: true,
            extract_fields: true,
            log: LogConfig::default(),
            drain_timeout_secs: 30,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.level()?;
        if let Some(port) = self.metrics_port {
            if port != 0 && port == self.grpc_port {
                return Err(ConfigError::PortConflict(port));
            }
        }
        if !self.auth_enabled && !self.auth_tokens.is_empty() {
            return Err(ConfigError::TokensWithoutAuth);
        }
        if self.auth_tokens.iter().any(|token| token.trim().is_empty()) {
            return Err(ConfigError::EmptyToken);
        }
        Ok(())
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    #[must_use]
    pub fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        if !self.auth_enabled {
            None
        } else if self.auth_tokens.is_empty() {
            Some(Arc::new(AllowAll))
        } else {
            Some(Arc::new(StaticTokens::new(&self.auth_tokens)))
        }
    }

    #[must_use]
    pub fn interceptor_config(&self) -> InterceptorConfig {
        InterceptorConfig {
            extract_fields: self.extract_fields,
            authenticator: self.authenticator(),
            log_enabled: self.log_enabled,
            log_payload: self.log_payload,
            ..InterceptorConfig::default()
        }
    }
}
