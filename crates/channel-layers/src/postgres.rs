//! PostgreSQL channel layer using LISTEN/NOTIFY
//!
//! Each layer keeps one dedicated connection. Its driver task forwards
//! notifications into a local queue that
//! [`next_published`](ChannelLayer::next_published) drains, so notification
//! delivery never depends on how quickly the listener consumes them.

use crate::config::PostgresOptions;
use crate::error::{ChannelError, ChannelResult};
use crate::event::Event;
use crate::layer::ChannelLayer;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

/// Largest NOTIFY payload PostgreSQL accepts, in bytes.
pub const MAX_NOTIFY_PAYLOAD_BYTES: usize = 8000;

/// Check that a message can be sent as a NOTIFY payload.
///
/// NOTIFY only carries text, limited to 8000 bytes of UTF-8. Checking here
/// gives a clear error instead of a server-side failure.
pub fn validate_payload(message: &serde_json::Value) -> ChannelResult<&str> {
    let text = message
        .as_str()
        .ok_or_else(|| ChannelError::NotSupported("Message must be a string".to_string()))?;

    if text.len() > MAX_NOTIFY_PAYLOAD_BYTES {
        return Err(ChannelError::NotSupported(format!(
            "Message byte-length must be at most {MAX_NOTIFY_PAYLOAD_BYTES} bytes, got {}",
            text.len()
        )));
    }

    Ok(text)
}

/// Quote a group name as a PostgreSQL identifier.
fn quote_ident(group: &str) -> String {
    format!("\"{}\"", group.replace('"', "\"\""))
}

/// PostgreSQL-backed channel layer using LISTEN/NOTIFY.
///
/// Only string messages of at most [`MAX_NOTIFY_PAYLOAD_BYTES`] bytes can be
/// published.
///
/// # Example
///
/// ```rust,no_run
/// use channel_layers::{Channel, PostgresChannelLayer, PostgresOptions};
///
/// async fn example() -> channel_layers::ChannelResult<()> {
///     let layer = PostgresChannelLayer::new(PostgresOptions::from_dsn(
///         "host=localhost user=postgres dbname=app",
///     ))?;
///     let channel = Channel::new(layer);
///     channel.connect().await?;
///     channel.publish("chat", "hello").await?;
///     channel.disconnect().await
/// }
/// ```
pub struct PostgresChannelLayer {
    /// Connection configuration
    config: tokio_postgres::Config,
    /// Client for the dedicated connection, present while connected
    client: RwLock<Option<Client>>,
    /// Task polling the connection for notifications
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Notifications forwarded by the driver
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl std::fmt::Debug for PostgresChannelLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresChannelLayer")
            .field("hosts", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .finish()
    }
}

impl PostgresChannelLayer {
    /// Create a new PostgreSQL channel layer.
    ///
    /// No connection is made until [`connect`](ChannelLayer::connect).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Config`] if the options do not form a valid
    /// connection configuration.
    pub fn new(options: PostgresOptions) -> ChannelResult<Self> {
        Ok(Self {
            config: options.to_config()?,
            client: RwLock::new(None),
            driver: Mutex::new(None),
            receiver: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ChannelLayer for PostgresChannelLayer {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> ChannelResult<()> {
        let (client, mut connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        // The connection only makes progress while it is polled, so the
        // driver owns it for the whole lifecycle.
        let driver = tokio::spawn(async move {
            loop {
                match std::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        tracing::trace!(
                            channel = notification.channel(),
                            process_id = notification.process_id(),
                            "Received notification"
                        );
                        let event = Event::new(notification.channel(), notification.payload());
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Some(Ok(AsyncMessage::Notice(notice))) => {
                        tracing::debug!(notice = %notice, "PostgreSQL notice");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "PostgreSQL listener connection failed");
                        break;
                    }
                    None => break,
                }
            }
            tracing::debug!("PostgreSQL listener connection closed");
        });

        *self.client.write().await = Some(client);
        if let Some(previous) = self.driver.lock().await.replace(driver) {
            // The previous client is gone already; stop its connection too.
            previous.abort();
            tracing::debug!("Replaced existing PostgreSQL listener connection");
        }
        *self.receiver.lock().await = Some(rx);

        tracing::info!("PostgreSQL channel layer connected");
        Ok(())
    }

    async fn disconnect(&self) -> ChannelResult<()> {
        // Dropping the client closes the connection; the driver then ends
        // and drops its sender, which wakes `next_published`.
        self.client.write().await.take();

        if let Some(driver) = self.driver.lock().await.take() {
            driver.abort();
        }

        tracing::info!("PostgreSQL channel layer disconnected");
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> ChannelResult<()> {
        let client = self.client.read().await;
        let client = client.as_ref().ok_or(ChannelError::NotConnected)?;

        client
            .batch_execute(&format!("LISTEN {}", quote_ident(group)))
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, group: &str) -> ChannelResult<()> {
        let client = self.client.read().await;
        let Some(client) = client.as_ref() else {
            // The connection, and with it every LISTEN, is already gone.
            return Ok(());
        };

        client
            .batch_execute(&format!("UNLISTEN {}", quote_ident(group)))
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))
    }

    async fn publish(&self, group: &str, message: serde_json::Value) -> ChannelResult<()> {
        let payload = validate_payload(&message)?;

        let client = self.client.read().await;
        let client = client.as_ref().ok_or(ChannelError::NotConnected)?;

        client
            .execute("SELECT pg_notify($1, $2)", &[&group, &payload])
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn next_published(&self) -> ChannelResult<Event> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or(ChannelError::ListenerClosed)?;

        receiver.recv().await.ok_or(ChannelError::ListenerClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_limit() {
        let exact = "a".repeat(MAX_NOTIFY_PAYLOAD_BYTES);
        assert_eq!(validate_payload(&json!(exact)).unwrap().len(), 8000);

        let over = "a".repeat(MAX_NOTIFY_PAYLOAD_BYTES + 1);
        assert!(matches!(
            validate_payload(&json!(over)),
            Err(ChannelError::NotSupported(_))
        ));
    }

    #[test]
    fn test_payload_limit_counts_utf8_bytes() {
        // 2000 four-byte characters fit exactly, one more does not.
        let exact = "🦀".repeat(2000);
        assert!(validate_payload(&json!(exact)).is_ok());

        let over = format!("{exact}a");
        assert!(matches!(
            validate_payload(&json!(over)),
            Err(ChannelError::NotSupported(_))
        ));
    }

    #[test]
    fn test_payload_must_be_string() {
        for message in [json!(1), json!({"text": "hi"}), json!(["hi"]), json!(null)] {
            assert!(matches!(
                validate_payload(&message),
                Err(ChannelError::NotSupported(_))
            ));
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("chat"), "\"chat\"");
        assert_eq!(quote_ident("room-1.events"), "\"room-1.events\"");
        assert_eq!(quote_ident("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn test_publish_validates_before_connecting() {
        let layer = PostgresChannelLayer::new(PostgresOptions::from_dsn(
            "host=localhost user=postgres",
        ))
        .unwrap();

        let over = "a".repeat(MAX_NOTIFY_PAYLOAD_BYTES + 1);
        assert!(matches!(
            layer.publish("chat", json!(over)).await,
            Err(ChannelError::NotSupported(_))
        ));
        assert!(matches!(
            layer.publish("chat", json!(7)).await,
            Err(ChannelError::NotSupported(_))
        ));
        assert!(matches!(
            layer.publish("chat", json!("fits")).await,
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unconnected_layer_closes_listener() {
        let layer =
            PostgresChannelLayer::new(PostgresOptions::from_dsn("host=localhost")).unwrap();

        assert!(matches!(
            layer.next_published().await,
            Err(ChannelError::ListenerClosed)
        ));
        layer.unsubscribe("chat").await.unwrap();
    }
}
