//! Top-level lifecycle controller: wires every component together and
//! runs the receive loop that turns WAL bytes into dispatched events and
//! durable offsets.
//!
//! Generalizes `replication::server::ReplicationServer::run` (connect,
//! loop on `get_copy_data`, periodic status update, graceful stop on a
//! cancellation signal) to the multi-hypertable, snapshot-then-stream
//! shape this system adds on top.

use crate::config::Config;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::errors::{StreamerError, StreamerResult};
use crate::event::{Event, EventBuilder};
use crate::lsn::Lsn;
use crate::model::SnapshotTask;
use crate::offset::Offset;
use crate::replication_connection::ReplicationConnection;
use crate::side_channel::SideChannel;
use crate::sink::{self, SinkHandler};
use crate::snapshotter::{ChunkSnapshotEventHandler, Snapshotter};
use crate::state_storage::{FileStateStorage, StateStorage};
use crate::tracing_context::TracingContext;
use crate::wal::{MessageParser, ReplicationState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Everything `construct()` assembles before the receive loop starts.
struct Bootstrap {
    replication: ReplicationConnection,
    dispatcher: Arc<Dispatcher>,
    snapshotter: Arc<Snapshotter>,
    storage: Arc<dyn StateStorage>,
    restart_lsn: Lsn,
    chunk_hypertables: std::collections::HashMap<u32, String>,
}

/// Runs the streamer end to end for the lifetime of one process.
pub struct Replicator {
    config: Config,
    shutdown: CancellationToken,
    tracing_context: TracingContext,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Replicator { config, shutdown: CancellationToken::new(), tracing_context: TracingContext::new() }
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until `stop()`/cancellation or a fatal error. Returns `Ok(())`
    /// only on a clean, requested shutdown.
    ///
    /// Everything through `START_REPLICATION` is "construction": any
    /// failure there is remapped to `ReplicatorInit` (exit 21), except a
    /// sink that fails to start, which keeps its own `Sink` identity (exit
    /// 50, "plugin load failure"). Once the receive loop is running,
    /// errors propagate as whatever kind they actually are.
    #[instrument(skip(self), fields(correlation_id = %self.tracing_context.correlation_id))]
    pub async fn run(&self) -> StreamerResult<()> {
        let bootstrap = self.construct().await.map_err(|err| match err {
            StreamerError::Sink { .. } => err,
            other => StreamerError::replicator_init(other.to_string()),
        })?;

        let Bootstrap { mut replication, dispatcher, snapshotter, storage, restart_lsn, chunk_hypertables } = bootstrap;

        let result = self.receive_loop(&mut replication, &dispatcher, storage.clone(), restart_lsn, chunk_hypertables).await;

        self.stop_internal(&snapshotter, &mut replication, storage.as_ref()).await;

        result
    }

    #[instrument(skip(self), fields(correlation_id = %self.tracing_context.correlation_id))]
    async fn construct(&self) -> StreamerResult<Bootstrap> {
        let storage: Arc<dyn StateStorage> = Arc::new(FileStateStorage::new(self.config.state_storage_file_path.clone()));
        storage.load().await?;

        let conninfo = self.config.connection_string();
        let side_channel = Arc::new(SideChannel::connect(&conninfo)?);
        side_channel.ensure_publication(&self.config.publication_name)?;
        let catalog = side_channel.discover_hypertables()?;
        info!(hypertables = catalog.len(), "discovered hypertable catalog");

        // WAL Relation messages only ever describe the physical chunk a
        // statement landed on. Seed the chunk -> parent hypertable lookup
        // now so DML decodes keyed on the hypertable, matching how the
        // snapshot path already keys Read events.
        let mut chunk_hypertables = std::collections::HashMap::new();
        for (hypertable, chunks) in &catalog {
            for chunk in chunks {
                chunk_hypertables.insert(chunk.oid, hypertable.canonical_name());
            }
        }

        let mut replication = ReplicationConnection::new(conninfo.clone());
        replication.connect()?;
        let _identification = replication.identify_system()?;

        let existing_slot = side_channel.read_replication_slot(&self.config.replication_slot_name)?;
        if let Some(slot) = &existing_slot {
            slot.validate()?;
        }
        let (exported_snapshot_name, _created) = replication.create_replication_slot(
            &self.config.replication_slot_name,
            self.config.replication_slot_create,
            existing_slot.is_some(),
        )?;

        let sink_impl = sink::build(&self.config).await.map_err(|err| {
            error!(error = %err, "failed to start the configured sink");
            err
        })?;
        let sink_handler: Arc<dyn EventHandler> = Arc::new(SinkHandler::new(sink_impl, self.config.topic_prefix.clone(), self.shutdown.clone()));
        let dispatcher = Dispatcher::new(self.config.partition_count, vec![sink_handler], self.shutdown.clone());

        let chunk_handlers: Vec<Arc<dyn ChunkSnapshotEventHandler>> = vec![Arc::new(OffsetTrackingSnapshotHandler { storage: storage.clone() })];
        let snapshotter = Snapshotter::start(
            self.config.partition_count,
            side_channel.clone(),
            dispatcher.clone(),
            self.config.publication_name.clone(),
            exported_snapshot_name,
            chunk_handlers,
            self.shutdown.clone(),
        );

        for (hypertable, chunks) in &catalog {
            let canonical = hypertable.canonical_name();
            let offset = storage.get(&canonical);
            let needs_snapshot = match &offset {
                None => true,
                Some(o) => o.is_snapshot_in_progress(),
            };
            if !needs_snapshot {
                continue;
            }
            if chunks.is_empty() {
                snapshotter.enqueue(SnapshotTask { hypertable: hypertable.clone(), chunk: None }).await?;
                continue;
            }
            for chunk in chunks {
                snapshotter.enqueue(SnapshotTask { hypertable: hypertable.clone(), chunk: Some(chunk.clone()) }).await?;
            }
        }

        let confirmed_flush = existing_slot.map(|s| s.confirmed_flush_lsn).unwrap_or(Lsn::ZERO);
        let durable_offset = storage.entries().values().max_by_key(|o| o.lsn).cloned();
        let restart_lsn = replication.locate_restart_lsn(confirmed_flush, durable_offset.as_ref());

        replication.start_replication(&self.config.replication_slot_name, &self.config.publication_name, restart_lsn)?;

        Ok(Bootstrap { replication, dispatcher, snapshotter, storage, restart_lsn, chunk_hypertables })
    }

    #[instrument(skip(self, replication, dispatcher, storage), fields(correlation_id = %self.tracing_context.correlation_id, restart_lsn = %restart_lsn))]
    async fn receive_loop(
        &self,
        replication: &mut ReplicationConnection,
        dispatcher: &Arc<Dispatcher>,
        storage: Arc<dyn StateStorage>,
        restart_lsn: Lsn,
        chunk_hypertables: std::collections::HashMap<u32, String>,
    ) -> StreamerResult<()> {
        let mut state = ReplicationState::new();
        state.update_received_lsn(restart_lsn);
        state.update_applied_lsn(restart_lsn);
        state.set_chunk_hypertables(chunk_hypertables);

        let mut pending_lsn = restart_lsn;
        let mut last_feedback = Instant::now();
        let mut backoff = crate::backoff::Backoff::new();

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let deadline = Instant::now() + self.config.heartbeat_interval;
            let message = match replication.receive_message(deadline) {
                Ok(message) => {
                    backoff.reset();
                    message
                }
                Err(StreamerError::Connect { message }) => {
                    warn!(error = %message, "replication connection lost, reconnecting with backoff");
                    if self.reconnect_with_backoff(replication, state.applied_lsn, &mut backoff).await.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "error receiving replication message");
                    return Err(err);
                }
            };

            if let Some(raw) = message {
                if let Err(err) = self.handle_copy_message(&raw, &mut state, dispatcher, &storage, &mut pending_lsn).await {
                    warn!(error = %err, "failed to handle replication message");
                }
            }

            if last_feedback.elapsed() >= self.config.heartbeat_interval {
                if let Err(err) = replication.send_status_update(state.received_lsn, state.flushed_lsn, state.applied_lsn) {
                    warn!(error = %err, "failed to send standby status update");
                }
                last_feedback = Instant::now();
            }
        }
    }

    /// Retries `ReplicationConnection::reconnect` on a capped exponential
    /// backoff until it succeeds or shutdown is signaled. Resumes from
    /// `applied_lsn` rather than `received_lsn`, since only applied
    /// transactions are known to have reached the dispatcher.
    async fn reconnect_with_backoff(&self, replication: &mut ReplicationConnection, resume_lsn: Lsn, backoff: &mut crate::backoff::Backoff) -> StreamerResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(StreamerError::Canceled);
            }
            match replication.reconnect(&self.config.replication_slot_name, &self.config.publication_name, resume_lsn) {
                Ok(()) => {
                    info!("replication connection reestablished");
                    return Ok(());
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "reconnect attempt failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(StreamerError::Canceled),
                    }
                }
            }
        }
    }

    #[instrument(skip(self, raw, state, dispatcher, storage, pending_lsn), fields(correlation_id = %self.tracing_context.correlation_id))]
    async fn handle_copy_message(
        &self,
        raw: &[u8],
        state: &mut ReplicationState,
        dispatcher: &Arc<Dispatcher>,
        storage: &Arc<dyn StateStorage>,
        pending_lsn: &mut Lsn,
    ) -> StreamerResult<()> {
        if raw.is_empty() {
            return Ok(());
        }
        match raw[0] {
            b'w' => {
                if raw.len() < 25 {
                    return Err(StreamerError::protocol("XLogData header truncated"));
                }
                let payload = &raw[25..];
                let message = MessageParser::parse(payload)?;
                state.update_received_lsn(message.commit_end_lsn().unwrap_or(*pending_lsn));

                if let crate::wal::ReplicationMessage::Relation { relation } = &message {
                    state.add_relation(relation.clone());
                }

                let events = EventBuilder::build(&message, &state.relations, &state.chunk_hypertables)?;
                for event in events {
                    let event = EventBuilder::with_lsn(event, *pending_lsn);
                    match &event {
                        Event::Begin { commit_lsn, .. } => {
                            *pending_lsn = *commit_lsn;
                            state.touched_hypertables.clear();
                        }
                        Event::Commit { end_lsn, .. } => {
                            dispatcher.enqueue_task_and_wait(event.clone()).await?;
                            // The Commit itself only synchronizes partition 0
                            // (it has no routing key). Wait for every
                            // partition this transaction actually dispatched
                            // DML to before the offset can be trusted to
                            // reflect emitted rows rather than just queued
                            // ones.
                            for key in state.touched_hypertables.drain() {
                                dispatcher.barrier(Some(&key)).await?;
                            }
                            self.advance_offset(storage, &event, *end_lsn).await?;
                            state.update_applied_lsn(*end_lsn);
                            continue;
                        }
                        _ => {
                            if let Some(key) = event.routing_key() {
                                state.touched_hypertables.insert(key.to_string());
                            }
                        }
                    }
                    dispatcher.enqueue_task(event).await?;
                }
                Ok(())
            }
            b'k' => {
                if raw.len() < 18 {
                    return Err(StreamerError::protocol("keepalive message truncated"));
                }
                let reply_requested = raw[17] != 0;
                if reply_requested {
                    debug!("server requested an immediate standby status update");
                }
                Ok(())
            }
            other => Err(StreamerError::protocol_with_context("unknown CopyData tag", (other as char).to_string())),
        }
    }

    async fn advance_offset(&self, storage: &Arc<dyn StateStorage>, event: &Event, end_lsn: Lsn) -> StreamerResult<()> {
        let Event::Commit { .. } = event else { return Ok(()) };
        // A commit doesn't carry a relation; every hypertable touched by
        // this transaction advances to the same end LSN. Entries already
        // known to storage are the only ones we can address without
        // re-deriving per-statement relation membership here.
        let mut entries = storage.entries();
        for (key, offset) in entries.iter_mut() {
            if offset.lsn < end_lsn {
                offset.lsn = end_lsn;
                offset.snapshot_name = None;
                storage.set(key, offset.clone());
            }
        }
        storage.save().await
    }

    /// Stops the snapshotter, sends CopyDone, flushes offsets, drops the
    /// slot if owned, all best-effort: every step runs even if an earlier
    /// one failed, and the first error (if any) is what gets logged.
    async fn stop_internal(&self, snapshotter: &Arc<Snapshotter>, replication: &mut ReplicationConnection, storage: &dyn StateStorage) {
        snapshotter.shutdown();

        if let Err(err) = replication.stop_replication() {
            warn!(error = %err, "error stopping replication connection");
        }

        if let Err(err) = storage.save().await {
            warn!(error = %err, "error flushing offset storage during shutdown");
        }

        if let Err(err) = replication.drop_replication_slot(&self.config.replication_slot_name, self.config.replication_slot_autodrop) {
            warn!(error = %err, "error dropping replication slot during shutdown");
        }
    }

    /// Signals shutdown and blocks until `run()` would return, bounded by
    /// a 30-second deadline; a worker wedged past that point is abandoned
    /// rather than awaited forever.
    pub async fn stop(&self, handle: JoinHandle<StreamerResult<()>>) -> StreamerResult<()> {
        self.shutdown.cancel();
        match tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StreamerError::from(join_err)),
            Err(_) => {
                error!("shutdown exceeded the 30-second deadline, abandoning the run loop");
                Err(StreamerError::Canceled)
            }
        }
    }
}

/// Persists the consistent-point LSN as soon as a chunk snapshot
/// finishes, so a restart mid-bootstrap resumes from the last chunk that
/// fully completed rather than redoing the whole hypertable.
struct OffsetTrackingSnapshotHandler {
    storage: Arc<dyn StateStorage>,
}

#[async_trait]
impl ChunkSnapshotEventHandler for OffsetTrackingSnapshotHandler {
    async fn snapshot_started(&self, chunk: &crate::model::Chunk) {
        let key = chunk.hypertable.canonical_name();
        let mut offset = self.storage.get(&key).unwrap_or_else(|| Offset::new(Lsn::ZERO));
        offset.snapshot_name = Some(chunk.canonical_name());
        self.storage.set(&key, offset);
    }

    async fn snapshot_finished(&self, chunk: &crate::model::Chunk, consistent_point: Lsn) {
        let key = chunk.hypertable.canonical_name();
        let mut offset = self.storage.get(&key).unwrap_or_else(|| Offset::new(consistent_point));
        offset.snapshot_name = None;
        offset.lsn = offset.lsn.max(consistent_point);
        self.storage.set(&key, offset);
        if let Err(err) = self.storage.save().await {
            warn!(chunk = %chunk.canonical_name(), error = %err, "failed to persist offset after chunk snapshot");
        }
    }
}
