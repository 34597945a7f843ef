//! Subscriber handles
//!
//! A [`Subscriber`] reads one group's events from its local queue until the
//! subscription is released, after which it only reports
//! [`ChannelError::Unsubscribed`].

use crate::channel::ChannelInner;
use crate::error::{ChannelError, ChannelResult};
use crate::event::{Delivery, Event};
use futures::stream::{FusedStream, Stream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Releases a subscriber registration exactly once.
///
/// [`release`](ReleaseGuard::release) detaches in a spawned task and waits
/// for it, so the detach finishes even if the caller is cancelled. Dropping
/// an unreleased guard spawns the same detach without waiting.
pub(crate) struct ReleaseGuard {
    target: Option<(Arc<ChannelInner>, String, Uuid)>,
}

impl ReleaseGuard {
    pub(crate) fn new(channel: Arc<ChannelInner>, group: String, id: Uuid) -> Self {
        Self {
            target: Some((channel, group, id)),
        }
    }

    pub(crate) async fn release(mut self) -> ChannelResult<()> {
        let Some((channel, group, id)) = self.target.take() else {
            return Ok(());
        };

        let task = tokio::spawn(async move { channel.detach(&group, id).await });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(ChannelError::Cleanup(vec![format!("release task failed: {e}")])),
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some((channel, group, id)) = self.target.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.detach(&group, id).await {
                        tracing::warn!(group = %group, error = %e, "Background subscriber release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(group = %group, "Subscriber dropped outside a runtime; group left registered");
            }
        }
    }
}

/// Handle for receiving the events of one group.
///
/// Implements [`Stream`], yielding events until the subscription is
/// released and `None` from then on. A finished subscriber cannot be
/// restarted; subscribe again instead.
pub struct Subscriber {
    id: Uuid,
    group: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    guard: Option<ReleaseGuard>,
    finished: bool,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Subscriber {
    pub(crate) fn new(
        id: Uuid,
        group: String,
        receiver: mpsc::UnboundedReceiver<Delivery>,
        guard: ReleaseGuard,
    ) -> Self {
        Self {
            id,
            group,
            receiver,
            guard: Some(guard),
            finished: false,
        }
    }

    /// Subscriber ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Group this subscriber listens to
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Whether the end of the subscription has been reached.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Receive the next event.
    ///
    /// Returns [`ChannelError::Unsubscribed`] once the subscription has been
    /// released, and on every call after that.
    pub async fn recv(&mut self) -> ChannelResult<Event> {
        if self.finished {
            return Err(ChannelError::Unsubscribed);
        }

        match self.receiver.recv().await {
            Some(Delivery::Event(event)) => Ok(event),
            Some(Delivery::Closed) | None => {
                self.finished = true;
                Err(ChannelError::Unsubscribed)
            }
        }
    }

    /// Release the subscription.
    ///
    /// Removes this subscriber from its group, unsubscribes the layer if it
    /// was the last one, and closes the queue. Events already queued can
    /// still be received before the stream ends. Calling this again is a
    /// no-op.
    pub async fn unsubscribe(&mut self) -> ChannelResult<()> {
        match self.guard.take() {
            Some(guard) => guard.release().await,
            None => Ok(()),
        }
    }

    pub(crate) fn take_guard(&mut self) -> Option<ReleaseGuard> {
        self.guard.take()
    }
}

impl Stream for Subscriber {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(Delivery::Event(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(Delivery::Closed)) | Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedStream for Subscriber {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}
