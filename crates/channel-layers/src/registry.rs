//! Named channel registry
//!
//! The registry is built once from [`ChannelLayersConfig`] at application
//! start and passed to whatever needs channel access. It creates the
//! [`Channel`] for an alias on first use and hands out the same channel on
//! every later lookup.

use crate::channel::Channel;
use crate::config::{BackendKind, ChannelLayerConfig, ChannelLayersConfig};
use crate::error::{ChannelError, ChannelResult};
use crate::layer::{ChannelLayer, MemoryChannelLayer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Build the layer described by a configuration.
pub fn build_layer(config: &ChannelLayerConfig) -> ChannelResult<Arc<dyn ChannelLayer>> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryChannelLayer::new())),

        #[cfg(feature = "redis")]
        BackendKind::Redis => Ok(Arc::new(crate::redis::RedisChannelLayer::new(
            config.parse_options()?,
        )?)),

        #[cfg(feature = "postgres")]
        BackendKind::Postgres => Ok(Arc::new(crate::postgres::PostgresChannelLayer::new(
            config.parse_options()?,
        )?)),

        #[allow(unreachable_patterns)]
        backend => Err(ChannelError::Config(format!(
            "{} backend is not enabled; build with the `{}` feature",
            backend.as_str(),
            backend.as_str()
        ))),
    }
}

/// Registry of channels by alias.
#[derive(Debug)]
pub struct ChannelRegistry {
    config: ChannelLayersConfig,
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    /// Create a registry for a configuration.
    pub fn new(config: ChannelLayersConfig) -> Self {
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Create a registry from the environment.
    ///
    /// See [`ChannelLayersConfig::from_env`].
    pub fn from_env() -> ChannelResult<Self> {
        Ok(Self::new(ChannelLayersConfig::from_env()?))
    }

    /// Get the configuration.
    pub fn config(&self) -> &ChannelLayersConfig {
        &self.config
    }

    /// Get the channel for an alias, creating it on first use.
    ///
    /// The channel is returned unconnected the first time; connecting and
    /// disconnecting it is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Config`] for an unknown alias or invalid
    /// backend options.
    pub fn get(&self, alias: &str) -> ChannelResult<Channel> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(channel) = channels.get(alias) {
            return Ok(channel.clone());
        }

        let config = self.config.get(alias)?;
        let layer = build_layer(config)?;
        let channel = Channel::with_options(layer, config.channel_options());

        tracing::debug!(alias, backend = config.backend.as_str(), "Created channel");
        channels.insert(alias.to_string(), channel.clone());

        Ok(channel)
    }

    /// Disconnect every channel created so far.
    ///
    /// The channels are evicted, so a later [`get`](Self::get) builds a
    /// fresh one for the alias.
    pub async fn shutdown(&self) {
        let channels = std::mem::take(
            &mut *self.channels.lock().unwrap_or_else(PoisonError::into_inner),
        );

        for (alias, channel) in channels {
            if let Err(e) = channel.disconnect().await {
                tracing::error!(alias = %alias, error = %e, "Channel shutdown failed");
            }
        }
    }
}
