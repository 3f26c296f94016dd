//! Partitioned worker pool that bootstraps chunks/hypertables under the
//! slot's exported snapshot, turning each row into a `Read` event on the
//! dispatcher while the live WAL stream keeps decoding concurrently.
//!
//! Generalizes `replication::server::replication_loop`'s `tokio::select!`
//! shape (poll queue / check shutdown / periodic tick) to `P` independent
//! partitions, each serializing every snapshot task for the hypertables
//! that hash to it.

use crate::dispatcher::Dispatcher;
use crate::errors::{StreamerError, StreamerResult};
use crate::event::Event;
use crate::lsn::Lsn;
use crate::model::{Chunk, SnapshotTask};
use crate::side_channel::SideChannel;
use crate::utils::partition_for;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const QUEUE_CAPACITY: usize = 128;
const IDLE_TICK: std::time::Duration = std::time::Duration::from_secs(5);

/// Notified synchronously before a chunk snapshot begins and after it
/// finishes, so the live decode path can buffer/release rows for that
/// chunk and avoid double-delivery at the snapshot boundary.
#[async_trait]
pub trait ChunkSnapshotEventHandler: Send + Sync {
    async fn snapshot_started(&self, chunk: &Chunk);
    async fn snapshot_finished(&self, chunk: &Chunk, consistent_point: Lsn);
}

pub struct Snapshotter {
    senders: Vec<mpsc::Sender<SnapshotTask>>,
    shutdown: CancellationToken,
}

impl Snapshotter {
    /// `exported_snapshot_name` is the snapshot the replication slot
    /// exported at creation (`§4.6` step 3) — every chunk scan binds to it
    /// via `SET TRANSACTION SNAPSHOT` so the bootstrap reads are consistent
    /// with the exact LSN the live stream resumes from. `None` when the
    /// slot already existed (no fresh snapshot to bind to); the scan then
    /// just runs under its own repeatable-read transaction.
    pub fn start(
        partition_count: u8,
        side_channel: Arc<SideChannel>,
        dispatcher: Arc<Dispatcher>,
        publication_name: String,
        exported_snapshot_name: Option<String>,
        handlers: Vec<Arc<dyn ChunkSnapshotEventHandler>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        assert!((1..=255).contains(&partition_count), "partition count must be 1..=255");
        let handlers = Arc::new(handlers);
        let exported_snapshot_name = Arc::new(exported_snapshot_name);
        let mut senders = Vec::with_capacity(partition_count as usize);

        for index in 0..partition_count {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            senders.push(tx);
            tokio::spawn(run_partition(
                index,
                rx,
                side_channel.clone(),
                dispatcher.clone(),
                publication_name.clone(),
                exported_snapshot_name.clone(),
                handlers.clone(),
                shutdown.clone(),
            ));
        }

        Arc::new(Snapshotter { senders, shutdown })
    }

    /// Enqueues a snapshot task, routed to the partition its hypertable
    /// hashes to so every task for a given hypertable serializes through
    /// one worker.
    pub async fn enqueue(&self, task: SnapshotTask) -> StreamerResult<()> {
        let index = partition_for(&task.hypertable.canonical_name(), self.senders.len() as u8);
        self.senders[index].send(task).await.map_err(|_| StreamerError::snapshot("snapshotter partition closed"))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn partition_count(&self) -> usize {
        self.senders.len()
    }
}

async fn run_partition(
    index: u8,
    mut receiver: mpsc::Receiver<SnapshotTask>,
    side_channel: Arc<SideChannel>,
    dispatcher: Arc<Dispatcher>,
    publication_name: String,
    exported_snapshot_name: Arc<Option<String>>,
    handlers: Arc<Vec<Arc<dyn ChunkSnapshotEventHandler>>>,
    shutdown: CancellationToken,
) {
    let mut poisoned = false;
    let mut ticker = tokio::time::interval(IDLE_TICK);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                receiver.close();
                break;
            }
            _ = ticker.tick() => continue,
            task = receiver.recv() => {
                let Some(task) = task else { break };
                if poisoned {
                    warn!(partition = index, hypertable = %task.hypertable.canonical_name(), "partition poisoned by a prior snapshot failure, skipping task");
                    continue;
                }
                if let Err(err) = run_task(&side_channel, &dispatcher, &publication_name, exported_snapshot_name.as_deref(), &handlers, &task).await {
                    error!(partition = index, hypertable = %task.hypertable.canonical_name(), error = %err, "snapshot task failed, poisoning partition");
                    poisoned = true;
                }
            }
        }
    }
}

async fn run_task(
    side_channel: &Arc<SideChannel>,
    dispatcher: &Arc<Dispatcher>,
    publication_name: &str,
    exported_snapshot_name: Option<&str>,
    handlers: &Arc<Vec<Arc<dyn ChunkSnapshotEventHandler>>>,
    task: &SnapshotTask,
) -> StreamerResult<()> {
    match &task.chunk {
        Some(chunk) => snapshot_chunk(side_channel, dispatcher, publication_name, exported_snapshot_name, handlers, &task.hypertable.canonical_name(), chunk).await,
        None => {
            info!(hypertable = %task.hypertable.canonical_name(), "whole-hypertable bootstrap starting");
            // Whole-hypertable bootstrap: catalog order is what discover_hypertables
            // already returns (ascending range_start/OID), so chunks are iterated
            // sequentially in that order within this partition.
            let hypertables = side_channel.discover_hypertables()?;
            let Some((_, chunks)) = hypertables.into_iter().find(|(h, _)| h.canonical_name() == task.hypertable.canonical_name()) else {
                return Err(StreamerError::snapshot(format!("hypertable {} no longer present in catalog", task.hypertable.canonical_name())));
            };
            for chunk in &chunks {
                snapshot_chunk(side_channel, dispatcher, publication_name, exported_snapshot_name, handlers, &task.hypertable.canonical_name(), chunk).await?;
            }
            Ok(())
        }
    }
}

async fn snapshot_chunk(
    side_channel: &Arc<SideChannel>,
    dispatcher: &Arc<Dispatcher>,
    publication_name: &str,
    exported_snapshot_name: Option<&str>,
    handlers: &Arc<Vec<Arc<dyn ChunkSnapshotEventHandler>>>,
    hypertable_name: &str,
    chunk: &Chunk,
) -> StreamerResult<()> {
    for handler in handlers.iter() {
        handler.snapshot_started(chunk).await;
    }

    side_channel.attach_chunk(publication_name, chunk)?;

    let hypertable_name = hypertable_name.to_string();
    let chunk_name = chunk.canonical_name();
    let table_name = format!("\"{}\".\"{}\"", chunk.schema, chunk.name);
    let columns = side_channel.table_columns(&chunk.schema, &chunk.name)?;
    let dispatcher = dispatcher.clone();
    let exported_snapshot_name = exported_snapshot_name.map(|s| s.to_string());

    let consistent_point = tokio::task::spawn_blocking({
        let side_channel = side_channel.clone();
        let hypertable_name = hypertable_name.clone();
        let chunk_name = chunk_name.clone();
        move || -> StreamerResult<Lsn> {
            side_channel.snapshot_table(
                &table_name,
                exported_snapshot_name.as_deref(),
                Box::new(move |values| {
                    let row = values_to_row(&columns, values)?;
                    let event = Event::Read { lsn: Lsn::ZERO, hypertable: hypertable_name.clone(), chunk: chunk_name.clone(), row };
                    dispatcher_blocking_enqueue(&dispatcher, event);
                    Ok(())
                }),
            )
        }
    })
    .await
    .map_err(StreamerError::from)??;

    for handler in handlers.iter() {
        handler.snapshot_finished(chunk, consistent_point).await;
    }

    Ok(())
}

/// Snapshot rows are produced from a blocking thread (libpq is
/// synchronous); hand them to the dispatcher via a handle clone and a
/// blocking send so ordering within the chunk is preserved without
/// re-entering the async runtime from inside `spawn_blocking`.
fn dispatcher_blocking_enqueue(dispatcher: &Arc<Dispatcher>, event: Event) {
    let dispatcher = dispatcher.clone();
    if let Err(err) = tokio::runtime::Handle::current().block_on(dispatcher.enqueue_task(event)) {
        warn!(error = %err, "failed to enqueue snapshot read event");
    }
}

/// Builds a `Read` row keyed by real column name, running every non-null
/// value through the same Type Adapter the live DML decode path uses, so a
/// column looks identical whether it arrived via snapshot or WAL.
fn values_to_row(columns: &[(String, u32)], values: Vec<Option<String>>) -> StreamerResult<crate::event::Row> {
    let mut row = crate::event::Row::new();
    for (i, value) in values.into_iter().enumerate() {
        let Some((name, oid)) = columns.get(i) else {
            warn!(index = i, "snapshot row has more columns than the catalog reported");
            continue;
        };
        let json = match value {
            Some(text) => crate::event::decode_text_value(*oid, &text)?,
            None => serde_json::Value::Null,
        };
        row.insert(name.clone(), json);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_routes_by_hypertable_name() {
        // Smoke-tests that partition routing doesn't panic across a range
        // of hypertable names and partition counts; the routing function
        // itself is covered by `utils::partition_for`'s tests.
        for count in [1u8, 4, 16, 255] {
            for name in ["public.metrics", "public.events", "sensors.readings"] {
                let p = partition_for(name, count);
                assert!(p < count as usize);
            }
        }
    }

    #[test]
    fn values_to_row_keys_by_column_name_and_converts_types() {
        let columns = vec![("id".to_string(), crate::pgtypes::INT4_OID), ("active".to_string(), crate::pgtypes::BOOL_OID)];
        let row = values_to_row(&columns, vec![Some("7".to_string()), Some("t".to_string())]).unwrap();
        assert_eq!(row.get("id"), Some(&serde_json::Value::Number(7.into())));
        assert_eq!(row.get("active"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn values_to_row_passes_through_null() {
        let columns = vec![("id".to_string(), crate::pgtypes::INT4_OID)];
        let row = values_to_row(&columns, vec![None]).unwrap();
        assert_eq!(row.get("id"), Some(&serde_json::Value::Null));
    }
}
