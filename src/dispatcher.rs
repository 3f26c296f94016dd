//! The partitioned event bus: routes canonical events to registered
//! handlers while preserving per-hypertable FIFO ordering.
//!
//! Generalizes the teacher's `SinkRegistry` (a name -> handler map invoked
//! over every registered entry) into a partitioned, task-based design: each
//! partition owns an `mpsc` channel and a worker task, so hypertables
//! hashed to the same partition serialize through one queue while
//! different hypertables run fully in parallel.

use crate::errors::{StreamerError, StreamerResult};
use crate::event::Event;
use crate::utils::partition_for;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// The handler kinds a dispatcher task can be addressed to, mirroring the
/// distinct event-sink roles a hypertable streamer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    HypertableReplication,
    ChunkSnapshot,
    SystemCatalog,
    LogicalReplication,
}

/// Implemented by anything that wants to receive dispatched events. A
/// handler returning an error is logged; it does not halt the partition.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;
    async fn handle(&self, event: &Event) -> StreamerResult<()>;
}

enum Task {
    Notify { event: Event, ack: Option<oneshot::Sender<StreamerResult<()>>> },
    /// Drains to the front of its partition's queue without invoking any
    /// handler — used to wait for every DML enqueued ahead of a Commit on
    /// that partition to finish processing before the durable offset moves.
    Barrier { ack: oneshot::Sender<StreamerResult<()>> },
}

struct Partition {
    sender: mpsc::Sender<Task>,
}

/// A fixed-cardinality partitioned event bus. Handlers are registered
/// before `start()`; registration after start is not supported.
pub struct Dispatcher {
    partitions: Vec<Partition>,
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// `partition_count` must be in `1..=255` per the partitioning
    /// contract shared with the Snapshotter.
    pub fn new(partition_count: u8, handlers: Vec<Arc<dyn EventHandler>>, shutdown: CancellationToken) -> Arc<Self> {
        assert!((1..=255).contains(&partition_count), "partition count must be 1..=255");
        let handlers = Arc::new(handlers);
        let mut partitions = Vec::with_capacity(partition_count as usize);

        for index in 0..partition_count {
            let (sender, receiver) = mpsc::channel(256);
            partitions.push(Partition { sender });
            tokio::spawn(run_partition(index, receiver, handlers.clone(), shutdown.clone()));
        }

        Arc::new(Dispatcher { partitions, handlers, shutdown })
    }

    fn partition_index(&self, routing_key: Option<&str>) -> usize {
        match routing_key {
            Some(key) => partition_for(key, self.partitions.len() as u8),
            // Events with no hypertable affinity (Begin/Commit/Relation)
            // still need a deterministic home; partition 0 keeps them
            // ordered relative to each other.
            None => 0,
        }
    }

    /// Fire-and-forget delivery: returns once the event is queued, not
    /// once it's processed.
    pub async fn enqueue_task(&self, event: Event) -> StreamerResult<()> {
        let index = self.partition_index(event.routing_key());
        self.partitions[index]
            .sender
            .send(Task::Notify { event, ack: None })
            .await
            .map_err(|_| StreamerError::catalog("dispatcher partition closed"))
    }

    /// Blocks until the event has been processed by its owning partition.
    /// Must never be called from inside a handler running on the same
    /// partition — that would deadlock.
    pub async fn enqueue_task_and_wait(&self, event: Event) -> StreamerResult<()> {
        let index = self.partition_index(event.routing_key());
        let (tx, rx) = oneshot::channel();
        self.partitions[index]
            .sender
            .send(Task::Notify { event, ack: Some(tx) })
            .await
            .map_err(|_| StreamerError::catalog("dispatcher partition closed"))?;
        rx.await.map_err(|_| StreamerError::catalog("dispatcher partition dropped without acknowledging"))?
    }

    /// Blocks until every task already enqueued on the partition that
    /// `routing_key` hashes to (or partition 0, for `None`) has been
    /// processed. Used to synchronize a Commit with the DML partitions its
    /// transaction actually dispatched to, since the Commit event itself
    /// only ever lands on partition 0.
    pub async fn barrier(&self, routing_key: Option<&str>) -> StreamerResult<()> {
        let index = self.partition_index(routing_key);
        let (tx, rx) = oneshot::channel();
        self.partitions[index]
            .sender
            .send(Task::Barrier { ack: tx })
            .await
            .map_err(|_| StreamerError::catalog("dispatcher partition closed"))?;
        rx.await.map_err(|_| StreamerError::catalog("dispatcher partition dropped without acknowledging"))?
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_partition(
    index: u8,
    mut receiver: mpsc::Receiver<Task>,
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                receiver.close();
                while let Ok(task) = receiver.try_recv() {
                    match task {
                        Task::Notify { ack: Some(ack), .. } => { let _ = ack.send(Err(StreamerError::Canceled)); }
                        Task::Notify { ack: None, .. } => {}
                        Task::Barrier { ack } => { let _ = ack.send(Err(StreamerError::Canceled)); }
                    }
                }
                break;
            }
            task = receiver.recv() => {
                match task {
                    Some(Task::Notify { event, ack }) => {
                        let result = deliver(index, &event, &handlers).await;
                        if let Some(ack) = ack {
                            let _ = ack.send(result);
                        }
                    }
                    Some(Task::Barrier { ack }) => {
                        let _ = ack.send(Ok(()));
                    }
                    None => break,
                }
            }
        }
    }
}

async fn deliver(partition: u8, event: &Event, handlers: &[Arc<dyn EventHandler>]) -> StreamerResult<()> {
    for handler in handlers {
        if let Err(err) = handler.handle(event).await {
            warn!(partition, handler = ?handler.kind(), error = %err, "event handler failed, continuing");
        }
    }
    Ok(())
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("partitions", &self.partitions.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        kind: HandlerKind,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn kind(&self) -> HandlerKind {
            self.kind
        }

        async fn handle(&self, _event: &Event) -> StreamerResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_task_and_wait_blocks_until_processed() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { kind: HandlerKind::HypertableReplication, count: count.clone() });
        let dispatcher = Dispatcher::new(4, vec![handler], CancellationToken::new());

        dispatcher
            .enqueue_task_and_wait(Event::Insert { lsn: Default::default(), hypertable: "public.metrics".into(), row: Default::default() })
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_hypertable_always_hits_the_same_partition() {
        let dispatcher = Dispatcher::new(16, vec![], CancellationToken::new());
        let a = dispatcher.partition_index(Some("public.metrics"));
        let b = dispatcher.partition_index(Some("public.metrics"));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn barrier_waits_for_prior_notify_on_the_same_partition() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { kind: HandlerKind::HypertableReplication, count: count.clone() });
        let dispatcher = Dispatcher::new(1, vec![handler], CancellationToken::new());

        dispatcher.enqueue_task(Event::Insert { lsn: Default::default(), hypertable: "public.metrics".into(), row: Default::default() }).await.unwrap();
        dispatcher.barrier(Some("public.metrics")).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_and_stops_accepting() {
        let dispatcher = Dispatcher::new(2, vec![], CancellationToken::new());
        dispatcher.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(dispatcher.partition_count(), 2);
    }
}
