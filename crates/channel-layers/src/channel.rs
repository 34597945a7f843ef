//! Channel orchestrator
//!
//! A [`Channel`] owns one [`ChannelLayer`] and runs a background listener
//! that pulls events from it and fans them out to every local subscriber of
//! the event's group. Transport-level subscriptions are reference counted:
//! the layer is subscribed when the first local subscriber for a group
//! arrives and unsubscribed when the last one leaves.

use crate::error::{ChannelError, ChannelResult};
use crate::event::{Delivery, Event};
use crate::layer::ChannelLayer;
use crate::subscriber::{ReleaseGuard, Subscriber};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default grace period for teardown steps.
pub const DEFAULT_EXIT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Channel tuning options.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Upper bound for each best-effort teardown step (layer disconnect,
    /// final unsubscribe of a group, listener shutdown).
    pub exit_max_delay: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            exit_max_delay: DEFAULT_EXIT_MAX_DELAY,
        }
    }
}

/// Lifecycle state of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not yet connected
    Unconnected,
    /// Layer connected and listener running
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Torn down; terminal
    Disconnected,
}

/// Channel statistics.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Messages published through this channel
    pub events_published: u64,
    /// Events pushed into local subscriber queues
    pub events_delivered: u64,
    /// Groups with at least one local subscriber
    pub active_groups: usize,
    /// Local subscribers across all groups
    pub active_subscribers: usize,
}

type Queue = mpsc::UnboundedSender<Delivery>;

/// Local subscriber queues keyed by group, then by subscriber id.
#[derive(Default)]
struct Registrations {
    /// Whether new subscribers are accepted
    open: bool,
    groups: HashMap<String, HashMap<Uuid, Queue>>,
}

pub(crate) struct ChannelInner {
    layer: Arc<dyn ChannelLayer>,
    registrations: Mutex<Registrations>,
    state: Mutex<ChannelState>,
    listener: Mutex<Option<JoinHandle<()>>>,
    options: ChannelOptions,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
}

impl ChannelInner {
    /// Remove one subscriber queue and close it.
    ///
    /// When it was the last queue of its group, the group is dropped and the
    /// layer unsubscribed while the registrations lock is held, bounded by
    /// the exit delay.
    pub(crate) async fn detach(&self, group: &str, id: Uuid) -> ChannelResult<()> {
        let mut registrations = self.registrations.lock().await;

        let Some(queues) = registrations.groups.get_mut(group) else {
            return Ok(());
        };
        let Some(queue) = queues.remove(&id) else {
            return Ok(());
        };

        let mut result = Ok(());
        if queues.is_empty() {
            registrations.groups.remove(group);

            let delay = self.options.exit_max_delay;
            result = match tokio::time::timeout(delay, self.layer.unsubscribe(group)).await {
                Ok(Ok(())) => {
                    tracing::debug!(group, layer = self.layer.name(), "Unsubscribed layer from group");
                    Ok(())
                }
                Ok(Err(e)) => Err(ChannelError::Cleanup(vec![format!(
                    "unsubscribe from {group}: {e}"
                )])),
                Err(_) => Err(ChannelError::Cleanup(vec![format!(
                    "unsubscribe from {group} timed out after {delay:?}"
                )])),
            };
        }
        drop(registrations);

        let _ = queue.send(Delivery::Closed);
        result
    }

    /// Stop accepting subscribers and push `Closed` into every queue.
    ///
    /// With `clear` the registrations are dropped as well; otherwise they
    /// stay so that each subscriber still detaches normally.
    async fn close_queues(&self, clear: bool) -> usize {
        let mut registrations = self.registrations.lock().await;
        registrations.open = false;

        let groups = if clear {
            std::mem::take(&mut registrations.groups)
        } else {
            registrations.groups.clone()
        };
        drop(registrations);

        let mut closed = 0;
        for queue in groups.values().flat_map(|queues| queues.values()) {
            let _ = queue.send(Delivery::Closed);
            closed += 1;
        }
        closed
    }

    async fn teardown(self: Arc<Self>) -> ChannelResult<()> {
        let delay = self.options.exit_max_delay;
        let layer = self.layer.name();
        let mut failures = Vec::new();

        match tokio::time::timeout(delay, self.layer.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(format!("{layer} disconnect: {e}")),
            Err(_) => failures.push(format!("{layer} disconnect timed out after {delay:?}")),
        }

        let closed = self.close_queues(true).await;

        let listener = self.listener.lock().await.take();
        if let Some(mut handle) = listener {
            if tokio::time::timeout(delay, &mut handle).await.is_err() {
                handle.abort();
                failures.push(format!("listener still running after {delay:?}; aborted"));
            }
        }

        *self.state.lock().await = ChannelState::Disconnected;
        tracing::info!(layer, closed_subscribers = closed, "Channel disconnected");

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                tracing::warn!(layer, failure = %failure, "Channel teardown step failed");
            }
            Err(ChannelError::Cleanup(failures))
        }
    }
}

/// Listener loop: one event at a time, broadcast before fetching the next.
async fn listen(inner: Arc<ChannelInner>) {
    let layer = inner.layer.name();

    loop {
        let event: Event = match inner.layer.next_published().await {
            Ok(event) => event,
            Err(ChannelError::ListenerClosed) => {
                tracing::debug!(layer, "Channel layer closed; listener stopping");
                break;
            }
            Err(e) => {
                tracing::error!(layer, error = %e, "Channel listener failed");
                break;
            }
        };

        let queues: Vec<Queue> = {
            let registrations = inner.registrations.lock().await;
            registrations
                .groups
                .get(&event.group)
                .map(|queues| queues.values().cloned().collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for queue in &queues {
            if queue.send(Delivery::Event(event.clone())).is_ok() {
                delivered += 1;
            }
        }
        inner.events_delivered.fetch_add(delivered, Ordering::Relaxed);

        tracing::trace!(group = %event.group, delivered, "Fanned out event");
    }

    // Nothing more will arrive; make sure no consumer waits forever.
    inner.close_queues(false).await;
}

/// Publish/subscribe orchestrator over a [`ChannelLayer`].
///
/// `Channel` is a cheap handle; clones share the same layer, listener and
/// subscriber registrations.
///
/// # Example
///
/// ```rust,no_run
/// use channel_layers::{Channel, MemoryChannelLayer};
/// use futures::StreamExt;
///
/// async fn example() -> channel_layers::ChannelResult<()> {
///     let channel = Channel::new(MemoryChannelLayer::new());
///
///     channel
///         .scoped(|channel| async move {
///             let mut subscriber = channel.subscribe("chat").await?;
///             channel.publish("chat", "hello").await?;
///
///             if let Some(event) = subscriber.next().await {
///                 println!("{}: {}", event.group, event.message);
///             }
///             subscriber.unsubscribe().await
///         })
///         .await??;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("layer", &self.inner.layer.name())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl Channel {
    /// Create a channel over a layer with default options.
    pub fn new(layer: impl ChannelLayer + 'static) -> Self {
        Self::with_options(Arc::new(layer), ChannelOptions::default())
    }

    /// Create a channel over a shared layer.
    pub fn with_options(layer: Arc<dyn ChannelLayer>, options: ChannelOptions) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                layer,
                registrations: Mutex::new(Registrations::default()),
                state: Mutex::new(ChannelState::Unconnected),
                listener: Mutex::new(None),
                options,
                events_published: AtomicU64::new(0),
                events_delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Get the underlying layer.
    pub fn layer(&self) -> &Arc<dyn ChannelLayer> {
        &self.inner.layer
    }

    /// Get the current lifecycle state.
    pub async fn state(&self) -> ChannelState {
        *self.inner.state.lock().await
    }

    /// Connect the layer and start the listener.
    ///
    /// Connecting an already connected channel is a no-op; a channel that
    /// has been disconnected cannot be connected again.
    pub async fn connect(&self) -> ChannelResult<()> {
        let mut state = self.inner.state.lock().await;

        match *state {
            ChannelState::Unconnected => {}
            ChannelState::Connected => return Ok(()),
            ChannelState::Disconnecting | ChannelState::Disconnected => {
                return Err(ChannelError::ListenerClosed)
            }
        }

        self.inner.layer.connect().await?;
        self.inner.registrations.lock().await.open = true;

        let handle = tokio::spawn(listen(self.inner.clone()));
        *self.inner.listener.lock().await = Some(handle);
        *state = ChannelState::Connected;

        tracing::info!(layer = self.inner.layer.name(), "Channel connected");
        Ok(())
    }

    /// Disconnect the layer, close every subscriber and stop the listener.
    ///
    /// Teardown runs in its own task bounded by the exit delay, so it
    /// completes even when the caller is cancelled. Failed steps do not stop
    /// the remaining ones and are reported together as
    /// [`ChannelError::Cleanup`]. Calling this again is a no-op.
    pub async fn disconnect(&self) -> ChannelResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            match *state {
                ChannelState::Connected => *state = ChannelState::Disconnecting,
                ChannelState::Unconnected => {
                    *state = ChannelState::Disconnected;
                    return Ok(());
                }
                ChannelState::Disconnecting | ChannelState::Disconnected => return Ok(()),
            }
        }

        let teardown = tokio::spawn(self.inner.clone().teardown());
        match teardown.await {
            Ok(result) => result,
            Err(e) => Err(ChannelError::Cleanup(vec![format!("teardown task failed: {e}")])),
        }
    }

    /// Disconnect, logging failures instead of returning them.
    ///
    /// For application shutdown hooks that cannot handle an error.
    pub async fn shutdown(&self) {
        if let Err(e) = self.disconnect().await {
            tracing::error!(error = %e, code = e.error_code(), "Channel shutdown failed");
        }
    }

    /// Run `f` with this channel connected, then disconnect.
    ///
    /// The output of `f` is returned even when teardown fails; teardown
    /// failures are logged. If the returned future is dropped early, the
    /// channel is disconnected in the background.
    pub async fn scoped<F, Fut, T>(&self, f: F) -> ChannelResult<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = T>,
    {
        self.connect().await?;

        let guard = DisconnectGuard(Some(self.clone()));
        let output = f(self.clone()).await;
        guard.disarm();

        if let Err(e) = self.disconnect().await {
            tracing::warn!(error = %e, "Channel scope teardown failed");
        }

        Ok(output)
    }

    /// Publish a message to a group.
    pub async fn publish(
        &self,
        group: &str,
        message: impl Into<serde_json::Value>,
    ) -> ChannelResult<()> {
        if *self.inner.state.lock().await != ChannelState::Connected {
            return Err(ChannelError::NotConnected);
        }

        self.inner.layer.publish(group, message.into()).await?;
        self.inner.events_published.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(group, layer = self.inner.layer.name(), "Published message");
        Ok(())
    }

    /// Subscribe to a group.
    ///
    /// The layer is subscribed only for the first local subscriber of the
    /// group. The returned [`Subscriber`] is released by
    /// [`Subscriber::unsubscribe`] or, in the background, when dropped.
    pub async fn subscribe(&self, group: &str) -> ChannelResult<Subscriber> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::now_v7();

        {
            let mut registrations = self.inner.registrations.lock().await;
            if !registrations.open {
                return Err(ChannelError::NotConnected);
            }

            match registrations.groups.get_mut(group) {
                Some(queues) => {
                    queues.insert(id, tx);
                }
                None => {
                    self.inner.layer.subscribe(group).await?;
                    registrations
                        .groups
                        .insert(group.to_string(), HashMap::from([(id, tx)]));

                    tracing::debug!(group, layer = self.inner.layer.name(), "Subscribed layer to group");
                }
            }
        }

        let guard = ReleaseGuard::new(self.inner.clone(), group.to_string(), id);
        Ok(Subscriber::new(id, group.to_string(), rx, guard))
    }

    /// Run `f` with a subscriber of `group`, then release it.
    ///
    /// Release is awaited after `f` completes; its failure is logged and
    /// does not replace the output of `f`.
    pub async fn scoped_subscribe<F, Fut, T>(&self, group: &str, f: F) -> ChannelResult<T>
    where
        F: FnOnce(Subscriber) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut subscriber = self.subscribe(group).await?;
        let guard = subscriber.take_guard();

        let output = f(subscriber).await;

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                tracing::warn!(group, error = %e, "Subscriber release failed");
            }
        }

        Ok(output)
    }

    /// Get channel statistics.
    pub async fn stats(&self) -> ChannelStats {
        let registrations = self.inner.registrations.lock().await;

        ChannelStats {
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            events_delivered: self.inner.events_delivered.load(Ordering::Relaxed),
            active_groups: registrations.groups.len(),
            active_subscribers: registrations.groups.values().map(HashMap::len).sum(),
        }
    }
}

/// Disconnects the channel in the background unless disarmed.
struct DisconnectGuard(Option<Channel>);

impl DisconnectGuard {
    fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some(channel) = self.0.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { channel.shutdown().await });
            }
            Err(_) => {
                tracing::warn!("Channel scope dropped outside a runtime; layer left connected");
            }
        }
    }
}
