//! Configuration management

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;

pub const DEFAULT_PORT: u16 = 3478;
pub const DEFAULT_REALM: &str = "pion.ly";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("'{0}' is required")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How allocation requests are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStrategy {
    /// Reject every attempt (no credential store wired)
    #[default]
    Reject,
    /// Time-limited credentials derived from the static auth secret
    StaticSecret,
    /// Fixed username/password table
    Table,
}

/// Server configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub public_ip: Option<IpAddr>,
    pub port: u16,
    pub static_auth_secret: Option<String>,
    pub http_upstream: Option<String>,
    pub realm: String,
    pub auth_strategy: AuthStrategy,
    pub users: BTreeMap<String, String>,
    pub classify_timeout_ms: u64,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_ip: None,
            port: DEFAULT_PORT,
            static_auth_secret: None,
            http_upstream: None,
            realm: DEFAULT_REALM.to_string(),
            auth_strategy: AuthStrategy::Reject,
            users: BTreeMap::new(),
            classify_timeout_ms: 1000,
            metrics_addr: None,
        }
    }
}

// Secrets and passwords stay out of logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("public_ip", &self.public_ip)
            .field("port", &self.port)
            .field("static_auth_secret", &self.static_auth_secret.as_ref().map(|_| "<redacted>"))
            .field("http_upstream", &self.http_upstream)
            .field("realm", &self.realm)
            .field("auth_strategy", &self.auth_strategy)
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .field("classify_timeout_ms", &self.classify_timeout_ms)
            .field("metrics_addr", &self.metrics_addr)
            .finish()
    }
}

impl ServerConfig {
    /// Build configuration from defaults, an optional TOML file and the
    /// command line (flags and their `TURN_EDGE_*` environment variables).
    ///
    /// The result is not validated; that is the first step of startup.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_toml(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli)?;
        Ok(config)
    }

    /// Load from TOML config file
    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: Cli) -> Result<(), ConfigError> {
        if let Some(ip) = cli.public_ip {
            self.public_ip = Some(ip);
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(secret) = cli.static_auth_secret {
            self.static_auth_secret = Some(secret);
        }
        if let Some(upstream) = cli.http_server {
            self.http_upstream = Some(upstream);
        }
        if let Some(realm) = cli.realm {
            self.realm = realm;
        }
        if let Some(strategy) = cli.auth {
            self.auth_strategy = strategy;
        }
        if let Some(users) = cli.users {
            self.users.extend(parse_users(&users)?);
        }
        if let Some(timeout) = cli.classify_timeout_ms {
            self.classify_timeout_ms = timeout;
        }
        if let Some(addr) = cli.metrics_addr {
            self.metrics_addr = Some(addr);
        }
        Ok(())
    }

    /// Validate configuration. Nothing is bound until this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.public_ip.is_none() {
            return Err(ConfigError::Missing("public-ip"));
        }

        match &self.static_auth_secret {
            Some(secret) if !secret.is_empty() => {}
            _ => return Err(ConfigError::Missing("static-auth-secret")),
        }

        if self.realm.is_empty() {
            return Err(ConfigError::Invalid("realm must not be empty".to_string()));
        }

        if self.classify_timeout_ms == 0 {
            return Err(ConfigError::Invalid("classify_timeout_ms must be > 0".to_string()));
        }

        if self.auth_strategy == AuthStrategy::Table && self.users.is_empty() {
            return Err(ConfigError::Invalid(
                "auth strategy 'table' requires at least one user".to_string(),
            ));
        }

        self.upstream_url()?;

        Ok(())
    }

    /// Advertised relay address. Only meaningful after `validate`.
    pub fn public_ip(&self) -> Result<IpAddr, ConfigError> {
        self.public_ip.ok_or(ConfigError::Missing("public-ip"))
    }

    pub fn static_auth_secret(&self) -> Result<&str, ConfigError> {
        self.static_auth_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("static-auth-secret"))
    }

    /// Parsed upstream origin, if HTTP splitting is enabled.
    pub fn upstream_url(&self) -> Result<Option<Url>, ConfigError> {
        let Some(raw) = &self.http_upstream else {
            return Ok(None);
        };

        let url = Url::parse(raw)
            .map_err(|e| ConfigError::Invalid(format!("Invalid http-server URL {:?}: {}", raw, e)))?;

        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::Invalid(format!(
                "http-server must be an http(s) URL with a host, got {:?}",
                raw
            )));
        }

        Ok(Some(url))
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }
}

/// Parse a `user=password[,user=password...]` list.
pub fn parse_users(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut users = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (user, pass) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("Invalid user entry {:?}, expected user=password", pair)))?;
        if user.is_empty() || pass.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Invalid user entry {:?}, user and password must be non-empty",
                pair
            )));
        }
        users.insert(user.to_string(), pass.to_string());
    }
    Ok(users)
}
