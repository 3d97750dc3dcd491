//! Configuration Module
//!
//! TOML configuration for TideMQ:
//! - Logging level
//! - Listener addresses and TLS certificates
//! - Connection limits and timeouts
//! - Subscription policy
//! - Environment variable overrides (TIDEMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::UnsubscribeScope;
use crate::topic::ResubscribePolicy;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = PATTERN.get_or_init(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").ok()) else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub subscriptions: SubscriptionsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// TLS bind address (requires `tls`)
    pub tls_bind: Option<SocketAddr>,
    /// WebSocket bind address
    pub ws_bind: Option<SocketAddr>,
    /// WebSocket over TLS bind address (requires `tls`)
    pub wss_bind: Option<SocketAddr>,
    /// WebSocket request path
    pub ws_path: String,
    /// Disable Nagle's algorithm on accepted sockets
    pub tcp_nodelay: bool,
    /// Idle time before TCP keepalive probes start, e.g. "60s"; "0s" disables
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,
    /// SO_LINGER on accepted sockets, e.g. "5s"; unset keeps the OS default
    #[serde(default, with = "humantime_serde")]
    pub linger: Option<Duration>,
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            tls_bind: None,
            ws_bind: None,
            wss_bind: None,
            ws_path: "/mqtt".to_string(),
            tcp_nodelay: true,
            tcp_keepalive: Duration::from_secs(60),
            linger: None,
            tls: None,
        }
    }
}

/// Certificates for the TLS listeners
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerTlsConfig {
    /// Path to certificate file (PEM format)
    pub cert: String,
    /// Path to private key file (PEM format)
    pub key: String,
    /// CA certificate for client authentication (PEM format)
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub require_client_cert: bool,
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of open sockets (0 = unbounded)
    pub max_connections: usize,
    /// Maximum packet size in bytes
    pub max_packet_size: usize,
    /// Per-connection outbound queue. A subscriber whose queue is full
    /// misses the message instead of slowing the publisher down.
    pub outbound_channel_capacity: usize,
    /// Time allowed between accept and CONNECT, e.g. "30s"
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            outbound_channel_capacity: 1024,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Subscription behaviour
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    /// "replace" keeps one subscription per (connection, topic);
    /// "append" stacks repeated subscriptions
    pub resubscribe: ResubscribePolicy,
    /// "session" removes only the caller's subscription;
    /// "topic" removes every subscription on the topic
    pub unsubscribe_scope: UnsubscribeScope,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `TIDEMQ__` prefix with double underscores for nesting:
    ///    - `TIDEMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `TIDEMQ__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.ws_path", "/mqtt")?
            .set_default("server.tcp_nodelay", true)?
            .set_default("server.tcp_keepalive", "60s")?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.outbound_channel_capacity", 1024)?
            .set_default("limits.connect_timeout", "30s")?
            .set_default("subscriptions.resubscribe", "replace")?
            .set_default("subscriptions.unsubscribe_scope", "session")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys; single underscores stay in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("TIDEMQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "limits.outbound_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_packet_size must be greater than 0".to_string(),
            ));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "server.ws_path must start with '/', got '{}'",
                self.server.ws_path
            )));
        }

        let tls_listeners = [
            ("tls_bind", self.server.tls_bind),
            ("wss_bind", self.server.wss_bind),
        ];
        for (name, addr) in tls_listeners {
            if addr.is_none() {
                continue;
            }
            match &self.server.tls {
                Some(tls) if tls.cert.is_empty() => {
                    return Err(ConfigError::Validation(format!(
                        "tls.cert is required when {} is set",
                        name
                    )));
                }
                Some(tls) if tls.key.is_empty() => {
                    return Err(ConfigError::Validation(format!(
                        "tls.key is required when {} is set",
                        name
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(ConfigError::Validation(format!(
                        "tls configuration is required when {} is set",
                        name
                    )));
                }
            }
        }

        if let Some(tls) = &self.server.tls {
            if tls.require_client_cert && tls.ca_cert.is_none() {
                return Err(ConfigError::Validation(
                    "tls.ca_cert is required when require_client_cert is true".to_string(),
                ));
            }
        }

        Ok(())
    }
}
