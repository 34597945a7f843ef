//! # Channel Layers
//!
//! This crate provides group publish/subscribe channels for web applications,
//! used for things like websocket chat rooms and live notifications.
//!
//! ## Overview
//!
//! The channel-layers crate handles:
//! - **Channel**: one background listener per process fanning events out to
//!   every local subscriber of a group
//! - **Channel Layers**: the transports underneath a channel
//! - **Subscribers**: per-group event streams that end when released
//! - **Registry**: channels by configured alias
//!
//! ## Features
//!
//! - in-memory layer (always available) for single-process apps and tests
//! - `redis`: Redis pub/sub layer for distributed systems
//! - `postgres`: PostgreSQL LISTEN/NOTIFY layer (string messages up to 8000 bytes)
//! - `full`: both of the above
//!
//! ## Usage
//!
//! ```rust,no_run
//! use channel_layers::{Channel, MemoryChannelLayer};
//! use futures::StreamExt;
//!
//! async fn chat() -> channel_layers::ChannelResult<()> {
//!     let channel = Channel::new(MemoryChannelLayer::new());
//!     channel.connect().await?;
//!
//!     let mut subscriber = channel.subscribe("room:lobby").await?;
//!     channel.publish("room:lobby", "hello").await?;
//!
//!     while let Some(event) = subscriber.next().await {
//!         println!("{}: {}", event.group, event.message);
//!         subscriber.unsubscribe().await?;
//!     }
//!
//!     channel.disconnect().await
//! }
//! ```
//!
//! ## Delivery
//!
//! Every local subscriber of a group receives every event the layer
//! delivers for it, in delivery order. Across processes the guarantees are
//! those of the transport: Redis PUBLISH and PostgreSQL NOTIFY are both
//! best-effort and keep nothing for subscribers that are not connected.

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod layer;
pub mod registry;
pub mod subscriber;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

// Re-export main types
pub use channel::{Channel, ChannelOptions, ChannelState, ChannelStats, DEFAULT_EXIT_MAX_DELAY};
pub use config::{
    BackendKind, ChannelLayerConfig, ChannelLayersConfig, PostgresOptions, RedisOptions,
};
pub use error::{ChannelError, ChannelResult};
pub use event::Event;
pub use layer::{ChannelLayer, MemoryChannelLayer};
pub use registry::{build_layer, ChannelRegistry};
pub use subscriber::Subscriber;

#[cfg(feature = "postgres")]
pub use crate::postgres::{PostgresChannelLayer, MAX_NOTIFY_PAYLOAD_BYTES};

#[cfg(feature = "redis")]
pub use crate::redis::RedisChannelLayer;
