//! Publish/subscribe seam for cache invalidation.
//!
//! Delivery is at-least-once at best and may drop messages; callers rely on
//! cache TTLs to bound staleness.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;

    /// Yields payloads published to `channel`. The stream ends when the
    /// underlying subscription drops; callers resubscribe.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, String>>;
}

/// Redis pub/sub. Publishing goes through a shared `ConnectionManager`;
/// each subscription opens its own dedicated connection.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping non-utf8 invalidation payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// In-process bus for single-instance deployments and tests.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<(String, String)>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvalidationBus for LocalBus {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        // No subscribers is not an error for pub/sub.
        let _ = self.tx.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, String>> {
        let rx = self.tx.subscribe();
        let channel = channel.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((ch, payload)) if ch == channel => return Some((payload, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "invalidation subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
