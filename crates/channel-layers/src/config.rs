//! Channel layer configuration.
//!
//! Channel layers are configured per alias, each naming a backend and its
//! options. Configuration is loaded from the `CHANNEL_LAYERS` environment
//! variable (JSON) with an in-memory `default` layer when it is unset:
//!
//! ```json
//! {
//!     "default": {"backend": "memory"},
//!     "redispubsub": {
//!         "backend": "redis",
//!         "options": {"host": "localhost", "port": 6379, "db": 0}
//!     },
//!     "notify": {
//!         "backend": "postgres",
//!         "options": {"dsn": "postgres://app@localhost/app"},
//!         "exit_max_delay_secs": 10
//!     }
//! }
//! ```

use crate::channel::{ChannelOptions, DEFAULT_EXIT_MAX_DELAY};
use crate::error::{ChannelError, ChannelResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable holding the JSON channel layer configuration.
pub const CHANNEL_LAYERS_ENV: &str = "CHANNEL_LAYERS";

/// Alias used when no configuration is provided.
pub const DEFAULT_ALIAS: &str = "default";

/// Channel layer backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process layer
    Memory,
    /// PostgreSQL LISTEN/NOTIFY (feature `postgres`)
    Postgres,
    /// Redis pub/sub (feature `redis`)
    Redis,
}

impl BackendKind {
    /// Get the backend name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Postgres => "postgres",
            BackendKind::Redis => "redis",
        }
    }
}

fn default_exit_max_delay_secs() -> u64 {
    DEFAULT_EXIT_MAX_DELAY.as_secs()
}

/// Configuration of one channel layer alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLayerConfig {
    /// Backend to use
    pub backend: BackendKind,

    /// Backend-specific options
    #[serde(default)]
    pub options: serde_json::Value,

    /// Grace period for teardown steps, in seconds
    #[serde(default = "default_exit_max_delay_secs")]
    pub exit_max_delay_secs: u64,
}

impl ChannelLayerConfig {
    /// Configuration for an in-memory layer.
    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            options: serde_json::Value::Null,
            exit_max_delay_secs: default_exit_max_delay_secs(),
        }
    }

    /// Configuration for a Redis layer.
    pub fn redis(options: RedisOptions) -> ChannelResult<Self> {
        Ok(Self {
            backend: BackendKind::Redis,
            options: serde_json::to_value(options)?,
            exit_max_delay_secs: default_exit_max_delay_secs(),
        })
    }

    /// Configuration for a PostgreSQL layer.
    pub fn postgres(options: PostgresOptions) -> ChannelResult<Self> {
        Ok(Self {
            backend: BackendKind::Postgres,
            options: serde_json::to_value(options)?,
            exit_max_delay_secs: default_exit_max_delay_secs(),
        })
    }

    /// Channel options derived from this configuration.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            exit_max_delay: Duration::from_secs(self.exit_max_delay_secs),
        }
    }

    /// Parse the backend options; missing options mean defaults.
    pub fn parse_options<T: DeserializeOwned + Default>(&self) -> ChannelResult<T> {
        if self.options.is_null() {
            return Ok(T::default());
        }

        serde_json::from_value(self.options.clone()).map_err(|e| {
            ChannelError::Config(format!("invalid {} options: {e}", self.backend.as_str()))
        })
    }
}

/// Channel layer configuration for all aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelLayersConfig {
    /// Layer configuration by alias
    pub layers: HashMap<String, ChannelLayerConfig>,
}

impl ChannelLayersConfig {
    /// Parse configuration from JSON.
    pub fn from_json(json: &str) -> ChannelResult<Self> {
        serde_json::from_str(json).map_err(|e| ChannelError::Config(e.to_string()))
    }

    /// Load configuration from the environment.
    ///
    /// Reads JSON from `CHANNEL_LAYERS`. When unset, a single in-memory
    /// layer is configured under the `default` alias.
    pub fn from_env() -> ChannelResult<Self> {
        match std::env::var(CHANNEL_LAYERS_ENV) {
            Ok(json) => Self::from_json(&json),
            Err(std::env::VarError::NotPresent) => {
                Ok(Self::default().with_layer(DEFAULT_ALIAS, ChannelLayerConfig::memory()))
            }
            Err(e) => Err(ChannelError::Config(format!("{CHANNEL_LAYERS_ENV}: {e}"))),
        }
    }

    /// Add or replace a layer alias.
    pub fn with_layer(mut self, alias: impl Into<String>, config: ChannelLayerConfig) -> Self {
        self.layers.insert(alias.into(), config);
        self
    }

    /// Get the configuration of an alias.
    pub fn get(&self, alias: &str) -> ChannelResult<&ChannelLayerConfig> {
        self.layers.get(alias).ok_or_else(|| {
            ChannelError::Config(format!("Channel layer {alias} is not configured"))
        })
    }
}

/// Redis connection options.
///
/// Either a full `url` or `host`/`port`/`db`. Defaults come from `REDIS_URL`,
/// `REDIS_HOST`, `REDIS_PORT` and `REDIS_DB`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    /// Connection URL; takes precedence over the other fields
    pub url: Option<String>,
    /// Server host (default: localhost)
    pub host: String,
    /// Server port (default: 6379)
    pub port: u16,
    /// Database number (default: 0)
    pub db: i64,
    /// ACL username
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL").ok(),
            host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(6379),
            db: std::env::var("REDIS_DB")
                .ok()
                .and_then(|db| db.parse().ok())
                .unwrap_or(0),
            username: None,
            password: None,
        }
    }
}

impl RedisOptions {
    /// Options for a connection URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Get the connection URL.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!("{user}:{password}@"),
            (None, Some(password)) => format!(":{password}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };

        format!("redis://{credentials}{}:{}/{}", self.host, self.port, self.db)
    }
}

/// PostgreSQL connection options.
///
/// `dsn` accepts either a `postgres://` URL or a `key=value` string; the
/// other fields override what it sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresOptions {
    /// Connection string
    pub dsn: Option<String>,
    /// Server host
    pub host: Option<String>,
    /// Server port
    pub port: Option<u16>,
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Database name
    pub database: Option<String>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

impl PostgresOptions {
    /// Options for a connection string.
    pub fn from_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    /// Build the driver configuration.
    #[cfg(feature = "postgres")]
    pub(crate) fn to_config(&self) -> ChannelResult<tokio_postgres::Config> {
        let mut config = match &self.dsn {
            Some(dsn) => dsn
                .parse::<tokio_postgres::Config>()
                .map_err(|e| ChannelError::Config(format!("invalid PostgreSQL dsn: {e}")))?,
            None => tokio_postgres::Config::new(),
        };

        if let Some(host) = &self.host {
            config.host(host);
        }
        if let Some(port) = self.port {
            config.port(port);
        }
        if let Some(user) = &self.user {
            config.user(user);
        }
        if let Some(password) = &self.password {
            config.password(password);
        }
        if let Some(database) = &self.database {
            config.dbname(database);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout(Duration::from_secs(secs));
        }

        if config.get_hosts().is_empty() {
            return Err(ChannelError::Config("PostgreSQL host is required".to_string()));
        }

        Ok(config)
    }
}
