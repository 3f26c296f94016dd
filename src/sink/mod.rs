//! The sink contract and its concrete implementations, plus the
//! `EventHandler` adapter that lets a sink sit on the dispatcher.
//!
//! Every implementation here stands in for the corresponding
//! `event_sink::*` producer the teacher wired into its `SinkRegistry`: same
//! `start`/`stop`/`emit` shape, same library for the wire protocol, scoped
//! down to one topic/key/payload call per event.

mod kafka;
mod kinesis;
mod nats;
mod redis;
mod sqs;
mod stdout;

pub use kafka::KafkaSink;
pub use kinesis::KinesisSink;
pub use nats::NatsSink;
pub use redis::RedisSink;
pub use sqs::SqsSink;
pub use stdout::StdoutSink;

use crate::config::{Config, SinkType};
use crate::dispatcher::{EventHandler, HandlerKind};
use crate::errors::StreamerResult;
use crate::event::Event;
use async_trait::async_trait;

/// A destination for canonical events. `start`/`stop` bracket the sink's
/// connection lifecycle; `emit` blocks until the sink has acknowledged
/// the message (or failed), so the caller knows exactly when it's safe to
/// advance the durable offset.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn start(&self) -> StreamerResult<()>;
    async fn stop(&self) -> StreamerResult<()>;
    async fn emit(&self, topic: &str, key: &str, payload: &[u8]) -> StreamerResult<()>;
}

/// Builds the sink selected by configuration, already prefixed with
/// `topic_prefix` for topic naming.
pub async fn build(config: &Config) -> StreamerResult<Box<dyn Sink>> {
    let sink: Box<dyn Sink> = match config.sink_type {
        SinkType::Stdout => Box::new(StdoutSink::new()),
        SinkType::Kafka => Box::new(KafkaSink::new(config.sink_endpoint.clone())?),
        SinkType::Kinesis => Box::new(KinesisSink::new().await?),
        SinkType::Sqs => Box::new(SqsSink::new(config.sink_endpoint.clone()).await?),
        SinkType::Nats => Box::new(NatsSink::new(config.sink_endpoint.clone())?),
        SinkType::Redis => Box::new(RedisSink::new(config.sink_endpoint.clone())?),
    };
    sink.start().await?;
    Ok(sink)
}

/// Routes an event to a `Sink`, rendering topic/key/payload from its
/// canonical shape. Registered on the dispatcher under
/// `HandlerKind::LogicalReplication` so it fires for every DML/Read event
/// alongside any diagnostics handlers.
///
/// A failing `emit` blocks this partition and retries with the same
/// capped-exponential-backoff schedule `ConnectError` reconnection uses,
/// rather than dropping the event: `SinkError` must never lose data.
pub struct SinkHandler {
    sink: Box<dyn Sink>,
    topic_prefix: String,
    shutdown: tokio_util::sync::CancellationToken,
}

impl SinkHandler {
    pub fn new(sink: Box<dyn Sink>, topic_prefix: impl Into<String>, shutdown: tokio_util::sync::CancellationToken) -> Self {
        SinkHandler { sink, topic_prefix: topic_prefix.into(), shutdown }
    }

    fn topic_for(&self, relation: &str) -> String {
        format!("{}.{}", self.topic_prefix, relation)
    }

    /// Retries `emit` until it succeeds or shutdown is signaled, in which
    /// case a `Canceled` error is returned so the caller does not advance
    /// the durable offset for an event that was never delivered.
    async fn emit_with_retry(&self, topic: &str, key: &str, payload: &[u8]) -> StreamerResult<()> {
        let mut backoff = crate::backoff::Backoff::new();
        loop {
            match self.sink.emit(topic, key, payload).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if self.shutdown.is_cancelled() {
                        return Err(crate::errors::StreamerError::Canceled);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(topic, error = %err, delay_ms = delay.as_millis() as u64, "sink emit failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(crate::errors::StreamerError::Canceled),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for SinkHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::LogicalReplication
    }

    async fn handle(&self, event: &Event) -> StreamerResult<()> {
        match event {
            Event::Read { hypertable, row, .. } => {
                let payload = serde_json::to_vec(row).map_err(|err| crate::errors::StreamerError::Other(err.into()))?;
                self.emit_with_retry(&self.topic_for(hypertable), hypertable, &payload).await
            }
            Event::Insert { hypertable, row, .. } => {
                let payload = serde_json::to_vec(row).map_err(|err| crate::errors::StreamerError::Other(err.into()))?;
                self.emit_with_retry(&self.topic_for(hypertable), hypertable, &payload).await
            }
            Event::Update { hypertable, new, .. } => {
                let payload = serde_json::to_vec(new).map_err(|err| crate::errors::StreamerError::Other(err.into()))?;
                self.emit_with_retry(&self.topic_for(hypertable), hypertable, &payload).await
            }
            Event::Delete { hypertable, old, .. } => {
                let payload = serde_json::to_vec(old).map_err(|err| crate::errors::StreamerError::Other(err.into()))?;
                self.emit_with_retry(&self.topic_for(hypertable), hypertable, &payload).await
            }
            Event::Truncate { hypertables, .. } => {
                for hypertable in hypertables {
                    self.emit_with_retry(&self.topic_for(hypertable), hypertable, b"{\"truncate\":true}").await?;
                }
                Ok(())
            }
            // Begin/Commit/Relation/Origin/Type carry no row payload and aren't forwarded.
            Event::Begin { .. } | Event::Commit { .. } | Event::Relation { .. } | Event::Origin { .. } | Event::Type { .. } => Ok(()),
        }
    }
}
