//! Channel behaviour over live Redis and PostgreSQL servers.
//!
//! These tests need a running server and are ignored by default:
//!
//! ```text
//! REDIS_URL=redis://localhost:6379/0 cargo test --features redis -- --ignored
//! DATABASE_URL=postgres://postgres@localhost/postgres cargo test --features postgres -- --ignored
//! ```

#![cfg(any(feature = "redis", feature = "postgres"))]

use channel_layers::{Channel, ChannelLayer, Subscriber};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A group name no other test run is using.
fn unique_group(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::now_v7().simple())
}

fn consume(mut subscriber: Subscriber) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut messages = Vec::new();
        while let Some(event) = subscriber.next().await {
            messages.push(event.message_str().unwrap_or_default().to_string());
        }
        messages
    })
}

/// Three local subscribers on one channel receive every message in order.
async fn fan_out(layer: Arc<dyn ChannelLayer>) {
    let group = unique_group("fan_out");
    let channel = Channel::with_options(layer, Default::default());

    let results = channel
        .scoped(|channel| async move {
            let mut consumers = Vec::new();
            for _ in 0..3 {
                consumers.push(consume(channel.subscribe(&group).await.unwrap()));
            }

            for i in 0..5 {
                sleep(Duration::from_millis(10)).await;
                channel.publish(&group, format!("Message {i}")).await.unwrap();
            }
            sleep(Duration::from_millis(500)).await;

            channel.disconnect().await.unwrap();

            let mut results = Vec::new();
            for consumer in consumers {
                results.push(
                    timeout(Duration::from_secs(5), consumer)
                        .await
                        .expect("subscriber did not finish")
                        .unwrap(),
                );
            }
            results
        })
        .await
        .unwrap();

    let expected: Vec<String> = (0..5).map(|i| format!("Message {i}")).collect();
    assert_eq!(results, vec![expected; 3]);
}

/// One publishing process, three subscribing processes, each with its own
/// channel and its own transport connection.
async fn cross_process<F>(make_layer: F)
where
    F: Fn() -> Arc<dyn ChannelLayer>,
{
    let group = unique_group("cross_process");
    let ready = Arc::new(Barrier::new(4));

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let channel = Channel::with_options(make_layer(), Default::default());
        let group = group.clone();
        let ready = ready.clone();

        receivers.push(tokio::spawn(async move {
            channel
                .scoped(|channel| async move {
                    channel
                        .scoped_subscribe(&group, |mut subscriber| async move {
                            ready.wait().await;

                            let mut messages = Vec::new();
                            while let Some(event) = subscriber.next().await {
                                let text = event.message_str().unwrap_or_default().to_string();
                                if text == "DONE" {
                                    break;
                                }
                                messages.push(text);
                            }
                            messages
                        })
                        .await
                })
                .await
        }));
    }

    let publisher = Channel::with_options(make_layer(), Default::default());
    publisher
        .scoped(|channel| async move {
            ready.wait().await;
            // Subscriptions are acknowledged before the barrier, but give the
            // server a moment before the first NOTIFY/PUBLISH.
            sleep(Duration::from_millis(100)).await;

            for message in ["Message 0", "Message 1", "Message 2", "DONE"] {
                channel.publish(&group, message).await.unwrap();
            }
        })
        .await
        .unwrap();

    for receiver in receivers {
        let messages = timeout(Duration::from_secs(10), receiver)
            .await
            .expect("receiver did not finish")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(messages, vec!["Message 0", "Message 1", "Message 2"]);
    }
}

#[cfg(feature = "redis")]
mod redis_transport {
    use super::*;
    use channel_layers::{RedisChannelLayer, RedisOptions};

    fn layer() -> Arc<dyn ChannelLayer> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".into());
        Arc::new(RedisChannelLayer::new(RedisOptions::from_url(url)).unwrap())
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_redis_fan_out() {
        init_tracing();
        fan_out(layer()).await;
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_redis_layer_reconnects() {
        init_tracing();

        let layer = layer();
        for _ in 0..3 {
            fan_out(layer.clone()).await;
        }
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_redis_cross_process() {
        init_tracing();
        cross_process(layer).await;
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_redis_structured_messages() {
        init_tracing();

        let group = unique_group("structured");
        let channel = Channel::with_options(layer(), Default::default());
        channel.connect().await.unwrap();

        let mut subscriber = channel.subscribe(&group).await.unwrap();
        let message = serde_json::json!({"user": "ada", "text": "hi", "tags": [1, 2]});
        channel.publish(&group, message.clone()).await.unwrap();

        let event = timeout(Duration::from_secs(5), subscriber.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.group, group);
        assert_eq!(event.message, message);

        channel.disconnect().await.unwrap();
    }
}

#[cfg(feature = "postgres")]
mod postgres_transport {
    use super::*;
    use channel_layers::{ChannelError, PostgresChannelLayer, PostgresOptions};

    fn layer() -> Arc<dyn ChannelLayer> {
        let dsn = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://postgres@localhost/postgres".into());
        Arc::new(PostgresChannelLayer::new(PostgresOptions::from_dsn(dsn)).unwrap())
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server"]
    async fn test_postgres_fan_out() {
        init_tracing();
        fan_out(layer()).await;
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server"]
    async fn test_postgres_cross_process() {
        init_tracing();
        cross_process(layer).await;
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server"]
    async fn test_postgres_payload_limit() {
        init_tracing();

        let group = unique_group("limit");
        let channel = Channel::with_options(layer(), Default::default());
        channel.connect().await.unwrap();

        let mut subscriber = channel.subscribe(&group).await.unwrap();

        // 8000 bytes passes local validation; whether the server then
        // accepts it depends on its build, so only the local check matters.
        let at_limit = channel.publish(&group, "x".repeat(8000)).await;
        assert!(!matches!(at_limit, Err(ChannelError::NotSupported(_))));

        let largest = "x".repeat(7999);
        channel.publish(&group, largest.as_str()).await.unwrap();

        let event = timeout(Duration::from_secs(5), subscriber.next())
            .await
            .unwrap()
            .unwrap();
        if event.message_str() != Some(largest.as_str()) {
            // The 8000-byte notification arrived first on a server that took it.
            assert_eq!(event.message_str().map(str::len), Some(8000));
            let event = timeout(Duration::from_secs(5), subscriber.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.message_str(), Some(largest.as_str()));
        }

        assert!(matches!(
            channel.publish(&group, "x".repeat(8001)).await,
            Err(ChannelError::NotSupported(_))
        ));
        assert!(matches!(
            channel.publish(&group, serde_json::json!({"a": 1})).await,
            Err(ChannelError::NotSupported(_))
        ));

        channel.disconnect().await.unwrap();
    }
}
