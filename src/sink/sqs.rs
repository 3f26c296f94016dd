use super::Sink;
use crate::errors::{StreamerError, StreamerResult};
use async_trait::async_trait;
use aws_sdk_sqs::Client;

/// `sink.endpoint` names the destination queue URL. `topic` becomes the
/// FIFO message-group id so per-relation ordering survives a standard or
/// FIFO queue alike.
pub struct SqsSink {
    client: Client,
    queue_url: String,
}

impl SqsSink {
    pub async fn new(endpoint: Option<String>) -> StreamerResult<Self> {
        let queue_url = endpoint.ok_or_else(|| StreamerError::config("sink.endpoint is required for sink.type=sqs"))?;
        let shared_config = aws_config::load_from_env().await;
        Ok(SqsSink { client: Client::new(&shared_config), queue_url })
    }
}

#[async_trait]
impl Sink for SqsSink {
    async fn start(&self) -> StreamerResult<()> {
        Ok(())
    }

    async fn stop(&self) -> StreamerResult<()> {
        Ok(())
    }

    async fn emit(&self, topic: &str, key: &str, payload: &[u8]) -> StreamerResult<()> {
        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(String::from_utf8_lossy(payload).into_owned());
        if self.queue_url.ends_with(".fifo") {
            request = request.message_group_id(topic).message_deduplication_id(key);
        }
        request.send().await.map_err(|err| StreamerError::sink(err.to_string(), "sqs"))?;
        Ok(())
    }
}
