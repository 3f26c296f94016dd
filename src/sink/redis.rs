use super::Sink;
use crate::errors::{StreamerError, StreamerResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;

/// Publishes onto the Redis Stream named by `topic` (`XADD topic * key payload`),
/// giving each event a durable, ordered position a consumer group can
/// replay, unlike a plain pub/sub channel.
pub struct RedisSink {
    url: String,
    manager: OnceCell<ConnectionManager>,
}

impl RedisSink {
    pub fn new(endpoint: Option<String>) -> StreamerResult<Self> {
        let url = endpoint.ok_or_else(|| StreamerError::config("sink.endpoint is required for sink.type=redis"))?;
        Ok(RedisSink { url, manager: OnceCell::new() })
    }

    async fn manager(&self) -> StreamerResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.clone()).map_err(|err| StreamerError::sink(err.to_string(), "redis"))?;
                client.get_connection_manager().await.map_err(|err| StreamerError::sink(err.to_string(), "redis"))
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl Sink for RedisSink {
    async fn start(&self) -> StreamerResult<()> {
        self.manager().await?;
        Ok(())
    }

    async fn stop(&self) -> StreamerResult<()> {
        Ok(())
    }

    async fn emit(&self, topic: &str, key: &str, payload: &[u8]) -> StreamerResult<()> {
        let mut manager = self.manager().await?;
        let _: String = manager
            .xadd(topic, "*", &[(key, payload)])
            .await
            .map_err(|err| StreamerError::sink(err.to_string(), "redis"))?;
        Ok(())
    }
}
