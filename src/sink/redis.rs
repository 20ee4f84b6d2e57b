use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{RedisSinkConfig, SINK_REDIS};
use crate::error::Result;
use crate::sink::Sink;
use crate::types::DomainEvent;

/// `PUBLISH <channel> <event json>` on a lazily opened multiplexed connection.
///
/// A publish error drops the cached connection so the next event reconnects.
pub struct RedisSink {
    client: Client,
    channel: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisSink {
    pub fn new(cfg: &RedisSinkConfig) -> Result<Self> {
        Ok(Self {
            client: Client::open(cfg.url.as_str())?,
            channel: cfg.channel.clone(),
            conn: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        info!(channel = %self.channel, "[REDIS] connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }
}

#[async_trait]
impl Sink for RedisSink {
    fn name(&self) -> &str {
        SINK_REDIS
    }

    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.connection().await?;
        match conn.publish::<_, _, i64>(&self.channel, payload).await {
            Ok(receivers) => {
                debug!(channel = %self.channel, receivers, event_id = %event.event_id, "published");
                Ok(())
            }
            Err(e) => {
                warn!(channel = %self.channel, "[REDIS] publish failed, dropping connection: {e}");
                self.reset().await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        let cfg = RedisSinkConfig { url: "not a url".into(), ..RedisSinkConfig::default() };
        assert!(RedisSink::new(&cfg).is_err());
    }

    #[test]
    fn opening_the_client_does_not_connect() {
        let cfg = RedisSinkConfig { url: "redis://127.0.0.1:1/0".into(), ..RedisSinkConfig::default() };
        let sink = RedisSink::new(&cfg).unwrap();
        assert_eq!(sink.channel(), "polymarket.events");
        assert_eq!(sink.name(), "redis");
    }

    #[tokio::test]
    async fn unreachable_server_surfaces_as_error() {
        let cfg = RedisSinkConfig { url: "redis://127.0.0.1:1/0".into(), ..RedisSinkConfig::default() };
        let sink = RedisSink::new(&cfg).unwrap();
        let event = DomainEvent::new(crate::types::EventType::HealthEvent, 1);
        assert!(sink.publish(&event).await.is_err());
        assert!(sink.conn.lock().await.is_none());
    }
}
