//! Message bus capability
//!
//! The orchestrator talks to the intake side only through [`MessageBus`]:
//! publish a payload on a topic, or subscribe to a topic and receive a stream
//! of payloads. Two transports are provided:
//! - [`LocalBus`]: in-process topics on `tokio::sync::broadcast`
//! - [`RedisBus`]: Redis pub/sub channels

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Stream of payloads received on one topic
pub type Subscription = BoxStream<'static, String>;

/// Shared handle to a bus transport
pub type SharedBus = Arc<dyn MessageBus>;

/// Default buffer per topic for the in-process bus
const LOCAL_TOPIC_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("bus closed: {0}")]
    Closed(String),
}

/// Narrow publish/subscribe capability the orchestrator depends on
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `topic`. Publishing to a topic nobody listens on
    /// is not an error.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;

    /// Subscribe to `topic`. The stream ends when the transport goes away.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// In-process bus backed by one broadcast channel per topic
pub struct LocalBus {
    topics: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(LOCAL_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus buffering up to `capacity` messages per topic
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe while holding the topic entry, so a concurrent publish
    /// cannot drop the channel in between
    fn receiver(&self, topic: &str) -> broadcast::Receiver<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Number of live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let Some(tx) = self.topics.get(topic).map(|tx| tx.clone()) else {
            debug!(topic, "No subscribers, message dropped");
            return Ok(());
        };
        if tx.send(payload).is_err() {
            // Every subscriber is gone, forget the topic
            self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
            debug!(topic, "No subscribers, message dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let rx = self.receiver(topic);
        let topic = topic.to_string();

        let stream = stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic, skipped, "Subscriber lagged, messages skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Redis pub/sub transport
pub struct RedisBus {
    client: redis::Client,
    publisher: tokio::sync::OnceCell<redis::aio::MultiplexedConnection>,
}

impl RedisBus {
    /// Create a bus for the server at `url`. No connection is opened until
    /// the first publish or subscribe.
    pub fn new(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            publisher: tokio::sync::OnceCell::new(),
        })
    }

    async fn publisher(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        self.publisher
            .get_or_try_init(|| async {
                let conn = self.client.get_multiplexed_async_connection().await?;
                info!("Connected to redis for publishing");
                Ok::<_, BusError>(conn)
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut conn = self.publisher().await?;
        let receivers: i64 = conn.publish(topic, payload).await?;
        debug!(topic, receivers, "Published to redis");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        info!(topic, "Subscribed to redis channel");

        let topic = topic.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Dropping non-text redis message");
                    None
                }
            };
            futures::future::ready(payload)
        });

        Ok(stream.boxed())
    }
}
