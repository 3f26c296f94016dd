use super::Sink;
use crate::errors::{StreamerError, StreamerResult};
use async_trait::async_trait;
use async_nats::Client;
use tokio::sync::OnceCell;

/// Lazily connects on first `start()`, since `async_nats::connect` is
/// itself async and the sink is constructed synchronously.
pub struct NatsSink {
    url: String,
    client: OnceCell<Client>,
}

impl NatsSink {
    pub fn new(endpoint: Option<String>) -> StreamerResult<Self> {
        let url = endpoint.ok_or_else(|| StreamerError::config("sink.endpoint is required for sink.type=nats"))?;
        Ok(NatsSink { url, client: OnceCell::new() })
    }

    async fn client(&self) -> StreamerResult<&Client> {
        self.client
            .get_or_try_init(|| async { async_nats::connect(&self.url).await.map_err(|err| StreamerError::sink(err.to_string(), "nats")) })
            .await
    }
}

#[async_trait]
impl Sink for NatsSink {
    async fn start(&self) -> StreamerResult<()> {
        self.client().await?;
        Ok(())
    }

    async fn stop(&self) -> StreamerResult<()> {
        if let Some(client) = self.client.get() {
            client.flush().await.map_err(|err| StreamerError::sink(err.to_string(), "nats"))?;
        }
        Ok(())
    }

    async fn emit(&self, topic: &str, _key: &str, payload: &[u8]) -> StreamerResult<()> {
        let client = self.client().await?;
        client
            .publish(topic.to_string(), payload.to_vec().into())
            .await
            .map_err(|err| StreamerError::sink(err.to_string(), "nats"))?;
        client.flush().await.map_err(|err| StreamerError::sink(err.to_string(), "nats"))
    }
}
