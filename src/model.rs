//! Catalog-level data model: hypertables, chunks, and replication slot
//! state as discovered over the side channel.

use crate::errors::{StreamerError, StreamerResult};
use crate::lsn::Lsn;
use serde::Serialize;

/// A TimescaleDB hypertable, identified by its canonical `schema.name`.
/// Immutable once discovered — a schema change produces a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hypertable {
    pub schema: String,
    pub name: String,
}

impl Hypertable {
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// A physical child partition of a hypertable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub hypertable: Hypertable,
    pub attached_to_publication: bool,
}

impl Chunk {
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// A unit of snapshot work. `chunk == None` means "whole-hypertable
/// bootstrap": iterate every chunk of the hypertable sequentially.
#[derive(Debug, Clone)]
pub struct SnapshotTask {
    pub hypertable: Hypertable,
    pub chunk: Option<Chunk>,
}

/// Upstream replication slot state as read from `pg_replication_slots`.
#[derive(Debug, Clone)]
pub struct ReplicationSlotInfo {
    pub name: String,
    pub plugin: String,
    pub slot_type: String,
    pub confirmed_flush_lsn: Lsn,
}

impl ReplicationSlotInfo {
    /// Validates the plugin/type invariant: a usable slot is always
    /// logical and always `pgoutput`.
    pub fn validate(&self) -> StreamerResult<()> {
        if self.plugin != "pgoutput" {
            return Err(StreamerError::slot_state(format!(
                "replication slot '{}' uses plugin '{}', expected pgoutput",
                self.name, self.plugin
            )));
        }
        if self.slot_type != "logical" {
            return Err(StreamerError::slot_state(format!(
                "replication slot '{}' has type '{}', expected logical",
                self.name, self.slot_type
            )));
        }
        Ok(())
    }
}

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone)]
pub struct SystemIdentification {
    pub system_id: String,
    pub timeline: i32,
    pub x_log_pos: Lsn,
    pub db_name: Option<String>,
}
