//! Redis channel layer using PUBLISH/SUBSCRIBE.
//!
//! This module provides a Redis-based implementation of the channel layer,
//! delivering group messages across processes and servers. Delivery is
//! fire-and-forget: subscribers that are not connected when a message is
//! published never see it.

use crate::config::RedisOptions;
use crate::error::{ChannelError, ChannelResult};
use crate::event::Event;
use crate::layer::ChannelLayer;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Wire format of a published message.
///
/// The group travels with the payload so the receiving side can rebuild the
/// event from the frame alone.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    group: String,
    data: serde_json::Value,
}

/// Serialize a message into its envelope.
fn encode(group: &str, message: serde_json::Value) -> ChannelResult<String> {
    let envelope = Envelope {
        group: group.to_string(),
        data: message,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Rebuild an event from a pub/sub frame.
fn decode(payload: &[u8]) -> ChannelResult<Event> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    Ok(Event::new(envelope.group, envelope.data))
}

/// Forward pub/sub messages to the layer until the stream ends.
///
/// The stream stays open for the whole connection, so frames that arrive
/// together are all delivered in order. The task ends when the connection
/// is lost or is aborted on disconnect. Either way the event sender is
/// dropped, which the layer reports as [`ChannelError::ListenerClosed`].
async fn forward_messages(mut messages: PubSubStream, events: mpsc::UnboundedSender<Event>) {
    loop {
        let Some(msg) = messages.next().await else {
            tracing::warn!("Redis pub/sub connection lost");
            break;
        };

        match decode(msg.get_payload_bytes()) {
            Ok(event) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(
                    channel = msg.get_channel_name(),
                    error = %e,
                    "Dropping undecodable pub/sub message"
                );
            }
        }
    }

    tracing::debug!("Redis pub/sub forwarder stopped");
}

/// Redis-backed channel layer.
///
/// Uses one pub/sub connection for every subscribed group and a separate
/// multiplexed connection for publishing. Messages can be any JSON value.
///
/// # Example
///
/// ```rust,no_run
/// use channel_layers::{Channel, RedisChannelLayer, RedisOptions};
///
/// async fn example() -> channel_layers::ChannelResult<()> {
///     let layer = RedisChannelLayer::new(RedisOptions::from_url("redis://localhost:6379/0"))?;
///     let channel = Channel::new(layer);
///     channel.connect().await?;
///     channel.publish("chat", serde_json::json!({"text": "hello"})).await?;
///     channel.disconnect().await
/// }
/// ```
pub struct RedisChannelLayer {
    /// Redis client
    client: Client,

    /// Connection used for PUBLISH
    publisher: RwLock<Option<MultiplexedConnection>>,

    /// SUBSCRIBE/UNSUBSCRIBE half of the pub/sub connection
    subscriptions: RwLock<Option<PubSubSink>>,

    /// Task forwarding pub/sub messages
    forwarder: Mutex<Option<JoinHandle<()>>>,

    /// Events forwarded from the pub/sub connection
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl std::fmt::Debug for RedisChannelLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChannelLayer")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisChannelLayer {
    /// Create a new Redis channel layer.
    ///
    /// No connection is made until [`connect`](ChannelLayer::connect).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Config`] if the options do not form a valid
    /// Redis URL.
    pub fn new(options: RedisOptions) -> ChannelResult<Self> {
        let client = Client::open(options.connection_url())
            .map_err(|e| ChannelError::Config(e.to_string()))?;

        Ok(Self {
            client,
            publisher: RwLock::new(None),
            subscriptions: RwLock::new(None),
            forwarder: Mutex::new(None),
            receiver: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ChannelLayer for RedisChannelLayer {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> ChannelResult<()> {
        let publisher = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let (sink, messages) = pubsub.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_messages(messages, tx));

        *self.publisher.write().await = Some(publisher);
        *self.subscriptions.write().await = Some(sink);
        if let Some(previous) = self.forwarder.lock().await.replace(forwarder) {
            // Dropping its stream closes the previous pub/sub connection and
            // wakes a reader still waiting on the previous queue.
            previous.abort();
            tracing::debug!("Replaced existing Redis pub/sub connection");
        }
        *self.receiver.lock().await = Some(rx);

        tracing::info!("Redis channel layer connected");
        Ok(())
    }

    async fn disconnect(&self) -> ChannelResult<()> {
        self.publisher.write().await.take();
        self.subscriptions.write().await.take();

        // The forwarder owns the message stream; stopping it closes the
        // pub/sub connection and drops the event sender.
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            forwarder.abort();
        }

        tracing::info!("Redis channel layer disconnected");
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> ChannelResult<()> {
        let mut sink = self
            .subscriptions
            .read()
            .await
            .clone()
            .ok_or(ChannelError::NotConnected)?;

        sink.subscribe(group)
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, group: &str) -> ChannelResult<()> {
        let Some(mut sink) = self.subscriptions.read().await.clone() else {
            // No connection means no subscription left to release.
            return Ok(());
        };

        sink.unsubscribe(group)
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))
    }

    async fn publish(&self, group: &str, message: serde_json::Value) -> ChannelResult<()> {
        let payload = encode(group, message)?;

        let mut conn = self
            .publisher
            .read()
            .await
            .clone()
            .ok_or(ChannelError::NotConnected)?;

        conn.publish::<_, _, ()>(group, &payload)
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, timeout};

    /// Minimal RESP2 server.
    ///
    /// Answers every command with `+OK` except SUBSCRIBE, whose
    /// acknowledgement is written together with every `burst` message
    /// published on the subscribed channel, all in one write.
    struct FakeRedis {
        port: u16,
        open_connections: Arc<AtomicUsize>,
    }

    impl FakeRedis {
        async fn start(burst: Vec<serde_json::Value>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let open_connections = Arc::new(AtomicUsize::new(0));

            let open = open_connections.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let burst = burst.clone();
                    let open = open.clone();
                    open.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        serve_connection(socket, burst).await;
                        open.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });

            Self {
                port,
                open_connections,
            }
        }

        fn options(&self) -> RedisOptions {
            RedisOptions::from_url(format!("redis://127.0.0.1:{}/0", self.port))
        }

        async fn wait_for_open_connections(&self, expected: usize) -> usize {
            for _ in 0..100 {
                if self.open_connections.load(Ordering::SeqCst) == expected {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
            self.open_connections.load(Ordering::SeqCst)
        }
    }

    fn push_bulk(out: &mut Vec<u8>, value: &[u8]) {
        out.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<Vec<u8>>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;

            let mut arg = vec![0; len + 2];
            reader.read_exact(&mut arg).await.ok()?;
            arg.truncate(len);
            args.push(arg);
        }
        Some(args)
    }

    async fn serve_connection(socket: TcpStream, burst: Vec<serde_json::Value>) {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);

        while let Some(args) = read_command(&mut reader).await {
            let mut reply = Vec::new();

            if args[0].eq_ignore_ascii_case(b"SUBSCRIBE") {
                for channel in &args[1..] {
                    reply.extend_from_slice(b"*3\r\n");
                    push_bulk(&mut reply, b"subscribe");
                    push_bulk(&mut reply, channel);
                    reply.extend_from_slice(b":1\r\n");

                    let group = String::from_utf8_lossy(channel);
                    for message in &burst {
                        let payload = encode(&group, message.clone()).unwrap();
                        reply.extend_from_slice(b"*3\r\n");
                        push_bulk(&mut reply, b"message");
                        push_bulk(&mut reply, channel);
                        push_bulk(&mut reply, payload.as_bytes());
                    }
                }
            } else {
                reply.extend_from_slice(b"+OK\r\n");
            }

            if write.write_all(&reply).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_frames_arriving_together_are_all_delivered() {
        let burst = vec![
            json!("Message 0"),
            json!("Message 1"),
            json!("Message 2"),
            json!("DONE"),
        ];
        let server = FakeRedis::start(burst.clone()).await;

        let layer = RedisChannelLayer::new(server.options()).unwrap();
        layer.connect().await.unwrap();
        layer.subscribe("g").await.unwrap();

        for message in burst {
            let event = timeout(Duration::from_secs(2), layer.next_published())
                .await
                .expect("message was not delivered")
                .unwrap();
            assert_eq!(event, Event::new("g", message));
        }

        layer.disconnect().await.unwrap();
        assert!(matches!(
            layer.next_published().await,
            Err(ChannelError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_connections() {
        let server = FakeRedis::start(Vec::new()).await;

        let layer = RedisChannelLayer::new(server.options()).unwrap();
        layer.connect().await.unwrap();
        layer.connect().await.unwrap();

        // One publishing and one pub/sub connection remain.
        assert_eq!(server.wait_for_open_connections(2).await, 2);

        layer.disconnect().await.unwrap();
        assert_eq!(server.wait_for_open_connections(0).await, 0);
    }

    #[test]
    fn test_envelope_carries_group() {
        let payload = encode("chat", json!({"text": "hi"})).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value, json!({"group": "chat", "data": {"text": "hi"}}));

        let event = decode(payload.as_bytes()).unwrap();
        assert_eq!(event, Event::new("chat", json!({"text": "hi"})));
    }

    #[test]
    fn test_decode_rejects_foreign_payloads() {
        assert!(matches!(
            decode(b"not json"),
            Err(ChannelError::Serialization(_))
        ));
        assert!(matches!(
            decode(br#"{"data": 1}"#),
            Err(ChannelError::Serialization(_))
        ));
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RedisChannelLayer::new(RedisOptions::from_url("localhost:6379"));
        assert!(matches!(result, Err(ChannelError::Config(_))));

        assert!(RedisChannelLayer::new(RedisOptions::from_url("redis://localhost:6379/0")).is_ok());
    }

    #[tokio::test]
    async fn test_unconnected_layer() {
        let layer = RedisChannelLayer::new(RedisOptions::default()).unwrap();

        assert!(matches!(
            layer.publish("chat", json!("hi")).await,
            Err(ChannelError::NotConnected)
        ));
        assert!(matches!(
            layer.subscribe("chat").await,
            Err(ChannelError::NotConnected)
        ));
        assert!(matches!(
            layer.next_published().await,
            Err(ChannelError::ListenerClosed)
        ));
        layer.unsubscribe("chat").await.unwrap();
    }
}
