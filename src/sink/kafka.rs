use super::Sink;
use crate::errors::{StreamerError, StreamerResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;

pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(endpoint: Option<String>) -> StreamerResult<Self> {
        let brokers = endpoint.ok_or_else(|| StreamerError::config("sink.endpoint is required for sink.type=kafka"))?;
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|err| StreamerError::sink(err.to_string(), "kafka"))?;
        Ok(KafkaSink { producer })
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn start(&self) -> StreamerResult<()> {
        Ok(())
    }

    async fn stop(&self) -> StreamerResult<()> {
        self.producer.flush(Duration::from_secs(10)).map_err(|err| StreamerError::sink(err.to_string(), "kafka"))
    }

    async fn emit(&self, topic: &str, key: &str, payload: &[u8]) -> StreamerResult<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(err, _)| StreamerError::sink(err.to_string(), "kafka"))?;
        Ok(())
    }
}
