//! Channel layer abstraction
//!
//! A channel layer is the transport underneath a [`Channel`](crate::Channel):
//! it knows how to publish a message to a group and how to wait for the next
//! message published to any group it is subscribed to. This module provides
//! the trait and the in-memory implementation.

use crate::error::{ChannelError, ChannelResult};
use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Channel layer trait for group publish/subscribe transports.
///
/// A layer is driven by exactly one [`Channel`](crate::Channel), which calls
/// [`next_published`](ChannelLayer::next_published) from a single listener
/// task while other tasks subscribe and publish concurrently.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Open connections or allocate queues.
    async fn connect(&self) -> ChannelResult<()>;

    /// Release all resources.
    ///
    /// After this returns, a pending or later call to
    /// [`next_published`](ChannelLayer::next_published) must return
    /// [`ChannelError::ListenerClosed`] rather than hang.
    async fn disconnect(&self) -> ChannelResult<()>;

    /// Register interest in a group at the transport level.
    async fn subscribe(&self, group: &str) -> ChannelResult<()>;

    /// Remove interest in a group. Safe to call when not subscribed.
    async fn unsubscribe(&self, group: &str) -> ChannelResult<()>;

    /// Publish a message to a group.
    async fn publish(&self, group: &str, message: serde_json::Value) -> ChannelResult<()>;

    /// Wait for the next event published to a subscribed group.
    async fn next_published(&self) -> ChannelResult<Event>;
}

/// In-memory channel layer.
///
/// Every published event goes through one unbounded queue to the single
/// reader, which drops events for groups that are not subscribed. State is
/// owned by the instance: two layers never see each other's events.
///
/// This is suitable for single-process applications and testing.
pub struct MemoryChannelLayer {
    /// Groups currently subscribed
    subscribed: RwLock<HashSet<String>>,
    /// Publishing end of the event queue, present while connected
    sender: RwLock<Option<mpsc::UnboundedSender<Event>>>,
    /// Reading end of the event queue
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl std::fmt::Debug for MemoryChannelLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannelLayer").finish_non_exhaustive()
    }
}

impl MemoryChannelLayer {
    /// Create a new in-memory channel layer.
    pub fn new() -> Self {
        Self {
            subscribed: RwLock::new(HashSet::new()),
            sender: RwLock::new(None),
            receiver: Mutex::new(None),
        }
    }

    /// Check whether a group is currently subscribed.
    pub async fn is_subscribed(&self, group: &str) -> bool {
        self.subscribed.read().await.contains(group)
    }
}

impl Default for MemoryChannelLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelLayer for MemoryChannelLayer {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> ChannelResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.write().await = Some(tx);
        *self.receiver.lock().await = Some(rx);
        Ok(())
    }

    async fn disconnect(&self) -> ChannelResult<()> {
        self.subscribed.write().await.clear();

        // Dropping the only sender wakes the reader with `None`. The receiver
        // itself stays in place since the listener may be holding its lock.
        self.sender.write().await.take();
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> ChannelResult<()> {
        self.subscribed.write().await.insert(group.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, group: &str) -> ChannelResult<()> {
        self.subscribed.write().await.remove(group);
        Ok(())
    }

    async fn publish(&self, group: &str, message: serde_json::Value) -> ChannelResult<()> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(ChannelError::NotConnected)?;

        sender
            .send(Event::new(group, message))
            .map_err(|_| ChannelError::ListenerClosed)
    }

    async fn next_published(&self) -> ChannelResult<Event> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or(ChannelError::ListenerClosed)?;

        loop {
            let event = receiver.recv().await.ok_or(ChannelError::ListenerClosed)?;

            if self.subscribed.read().await.contains(&event.group) {
                return Ok(event);
            }

            tracing::trace!(group = %event.group, "Discarding event for unsubscribed group");
        }
    }
}
