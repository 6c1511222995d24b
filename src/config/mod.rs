//! Configuration Module
//!
//! Provides TOML-based configuration for routemq with support for:
//! - Server settings (bind address, workers, socket options)
//! - Connection limits and timeouts
//! - Authentication and ACL
//! - Cluster peers
//! - Management HTTP endpoint
//! - Environment variable overrides (ROUTEMQ__* prefix)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::transport::TransportConfig;

pub use cluster::{ClusterConfig, PeerConfig};
pub use http::HttpConfig;

mod cluster;
mod http;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static env var regex")
    });
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
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
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// ACL configuration
    pub acl: AclConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Management HTTP endpoint
    pub http: HttpConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Number of dispatch workers (0 = one per CPU)
    #[serde(default)]
    pub workers: usize,
    /// Bounded queue length of each dispatch worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Disable Nagle on accepted sockets
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time (unset = OS default)
    #[serde(default, with = "humantime_serde")]
    pub tcp_keepalive: Option<Duration>,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:1883".parse().unwrap()
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: 0,
            queue_capacity: default_queue_capacity(),
            tcp_nodelay: true,
            tcp_keepalive: None,
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of client connections (0 = unbounded)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Time allowed between accept and a complete CONNECT
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound on a single socket write (unset = no bound)
    #[serde(default, with = "humantime_serde")]
    pub write_timeout: Option<Duration>,
    /// Objects kept in each reuse pool
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

fn default_max_connections() -> usize {
    100_000
}
fn default_max_packet_size() -> usize {
    1024 * 1024
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_pool_capacity() -> usize {
    1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_packet_size: default_max_packet_size(),
            connect_timeout: default_connect_timeout(),
            write_timeout: None,
            pool_capacity: default_pool_capacity(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow anonymous connections when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Whether ACL is enabled
    pub enabled: bool,
    /// ACL roles
    #[serde(default)]
    pub roles: Vec<AclRole>,
    /// Default permissions for users without explicit role (including anonymous)
    #[serde(default)]
    pub default: AclPermissions,
    /// Source networks denied every publish and subscribe (CIDR)
    #[serde(default)]
    pub deny_sources: Vec<String>,
}

/// ACL role
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    /// Role name
    pub name: String,
    /// Topic patterns this role can publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// ACL permissions
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    /// Topic patterns that can be published to
    pub publish: Vec<String>,
    /// Topic patterns that can be subscribed to
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `ROUTEMQ__` prefix with double underscores for nesting:
    ///    - `ROUTEMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `ROUTEMQ__CLUSTER__ENABLED=true` overrides `cluster.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.workers", 0)?
            .set_default("server.queue_capacity", 1024)?
            .set_default("server.tcp_nodelay", true)?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.connect_timeout", "10s")?
            .set_default("limits.pool_capacity", 1024)?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?
            .set_default("cluster.enabled", false)?
            .set_default("cluster.bind", "0.0.0.0:1993")?
            .set_default("cluster.reconnect_interval", "3s")?
            .set_default("cluster.keep_alive", 30)?
            .set_default("http.enabled", false)?
            .set_default("http.bind", "0.0.0.0:8080")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("ROUTEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "server.queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                match (&user.password, &user.password_hash) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' must have either 'password' or 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' cannot have both 'password' and 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(pwd), None) if pwd.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has empty password",
                            user.username
                        )));
                    }
                    (None, Some(hash)) if !hash.starts_with("$argon2") => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                            user.username
                        )));
                    }
                    _ => {}
                }
            }
        }

        if self.auth.enabled && self.acl.enabled {
            let role_names: HashSet<_> = self.acl.roles.iter().map(|r| &r.name).collect();

            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        for cidr in &self.acl.deny_sources {
            if cidr.parse::<IpNet>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "acl.deny_sources entry '{}' is not a CIDR",
                    cidr
                )));
            }
        }

        if self.cluster.enabled {
            if self.cluster.node_id.as_deref() == Some("") {
                return Err(ConfigError::Validation(
                    "cluster.node_id must not be empty".to_string(),
                ));
            }
            let mut seen = HashSet::new();
            for peer in &self.cluster.peers {
                if peer.id.is_empty() || peer.addr.is_empty() {
                    return Err(ConfigError::Validation(
                        "cluster peers need both 'id' and 'addr'".to_string(),
                    ));
                }
                if !seen.insert(&peer.id) {
                    return Err(ConfigError::Validation(format!(
                        "duplicate cluster peer id '{}'",
                        peer.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Engine settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        let workers = if self.server.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.server.workers
        };

        BrokerConfig {
            bind_addr: self.server.bind,
            workers,
            queue_capacity: self.server.queue_capacity,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.limits.connect_timeout,
            write_timeout: self.limits.write_timeout,
            pool_capacity: self.limits.pool_capacity,
            transport: TransportConfig {
                tcp_nodelay: self.server.tcp_nodelay,
                tcp_keepalive: self.server.tcp_keepalive,
            },
            node_id: self.cluster.get_node_id(),
            cluster: self.cluster.clone(),
        }
    }
}
