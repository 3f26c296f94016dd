use super::Sink;
use crate::errors::StreamerError;
use crate::errors::StreamerResult;
use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::Client;

pub struct KinesisSink {
    client: Client,
}

impl KinesisSink {
    pub async fn new() -> StreamerResult<Self> {
        let shared_config = aws_config::load_from_env().await;
        Ok(KinesisSink { client: Client::new(&shared_config) })
    }
}

#[async_trait]
impl Sink for KinesisSink {
    async fn start(&self) -> StreamerResult<()> {
        Ok(())
    }

    async fn stop(&self) -> StreamerResult<()> {
        Ok(())
    }

    async fn emit(&self, topic: &str, key: &str, payload: &[u8]) -> StreamerResult<()> {
        self.client
            .put_record()
            .stream_name(topic)
            .partition_key(key)
            .data(Blob::new(payload))
            .send()
            .await
            .map_err(|err| StreamerError::sink(err.to_string(), "kinesis"))?;
        Ok(())
    }
}
