//! Decoded pgoutput logical replication messages and the relation/tuple
//! schema metadata they carry.

use crate::lsn::Lsn;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub type Oid = u32;
pub type Xid = u32;

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    /// 1 when this column is part of the replica identity key, 0 otherwise.
    pub key_flag: i8,
    pub column_name: String,
    pub column_type: Oid,
    pub atttypmod: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationInfo {
    pub oid: Oid,
    pub namespace: String,
    pub relation_name: String,
    pub replica_identity: char,
    pub column_count: i16,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.namespace, self.relation_name)
    }
}

/// A single column's wire-encoded value: 'n' (null), 'u' (unchanged TOAST,
/// not sent), or 't' (text-encoded, `data` holds the raw text).
#[derive(Debug, Clone, Serialize)]
pub struct ColumnData {
    pub data_type: char,
    pub length: i32,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TupleData {
    pub column_count: i16,
    pub columns: Vec<ColumnData>,
    /// Bytes consumed decoding this tuple, so the caller can skip past it.
    pub processed_length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub enum ReplicationMessage {
    Begin { final_lsn: Lsn, timestamp: i64, xid: Xid },
    Commit { flags: u8, commit_lsn: Lsn, end_lsn: Lsn, timestamp: i64 },
    Relation { relation: RelationInfo },
    Insert { relation_id: Oid, tuple_data: TupleData, is_stream: bool, xid: Option<Xid> },
    Update {
        relation_id: Oid,
        key_type: Option<char>,
        old_tuple_data: Option<TupleData>,
        new_tuple_data: TupleData,
        is_stream: bool,
        xid: Option<Xid>,
    },
    Delete { relation_id: Oid, key_type: char, tuple_data: TupleData, is_stream: bool, xid: Option<Xid> },
    Truncate { relation_ids: Vec<Oid>, flags: i8, is_stream: bool, xid: Option<Xid> },
    StreamStart { xid: Xid, first_segment: bool },
    StreamStop,
    StreamCommit { xid: Xid, flags: u8, commit_lsn: Lsn, end_lsn: Lsn, timestamp: i64 },
    StreamAbort { xid: Xid, subtransaction_xid: Xid },
    Origin { commit_lsn: Lsn, name: String },
    Type { oid: Oid, namespace: String, name: String },
}

impl ReplicationMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Begin { .. } => "Begin",
            Self::Commit { .. } => "Commit",
            Self::Relation { .. } => "Relation",
            Self::Insert { .. } => "Insert",
            Self::Update { .. } => "Update",
            Self::Delete { .. } => "Delete",
            Self::Truncate { .. } => "Truncate",
            Self::StreamStart { .. } => "StreamStart",
            Self::StreamStop => "StreamStop",
            Self::StreamCommit { .. } => "StreamCommit",
            Self::StreamAbort { .. } => "StreamAbort",
            Self::Origin { .. } => "Origin",
            Self::Type { .. } => "Type",
        }
    }

    /// The end LSN this message advances replication past, for messages
    /// that close out a transaction. `None` for messages within a
    /// transaction, which don't move the durable restart position.
    pub fn commit_end_lsn(&self) -> Option<Lsn> {
        match self {
            Self::Commit { end_lsn, .. } | Self::StreamCommit { end_lsn, .. } => Some(*end_lsn),
            _ => None,
        }
    }
}

/// Per-connection decoding state: the relation cache populated by `Relation`
/// messages, the chunk -> parent hypertable lookup the catalog seeded at
/// startup, the high-water LSNs needed for standby status updates, and the
/// set of hypertable partitions touched by the transaction currently being
/// decoded (reset on every `Begin`, drained on the matching `Commit`).
#[derive(Debug)]
pub struct ReplicationState {
    pub relations: HashMap<Oid, RelationInfo>,
    pub chunk_hypertables: HashMap<Oid, String>,
    pub received_lsn: Lsn,
    pub flushed_lsn: Lsn,
    pub applied_lsn: Lsn,
    pub last_feedback_time: std::time::Instant,
    pub touched_hypertables: HashSet<String>,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
            chunk_hypertables: HashMap::new(),
            received_lsn: Lsn::ZERO,
            flushed_lsn: Lsn::ZERO,
            applied_lsn: Lsn::ZERO,
            last_feedback_time: std::time::Instant::now(),
            touched_hypertables: HashSet::new(),
        }
    }

    pub fn add_relation(&mut self, relation: RelationInfo) {
        self.relations.insert(relation.oid, relation);
    }

    pub fn get_relation(&self, oid: Oid) -> Option<&RelationInfo> {
        self.relations.get(&oid)
    }

    /// Seeds the chunk -> parent hypertable lookup from the catalog
    /// discovered at startup, so DML events decode keyed on the hypertable
    /// rather than the physical chunk relation the WAL message names.
    pub fn set_chunk_hypertables(&mut self, map: HashMap<Oid, String>) {
        self.chunk_hypertables = map;
    }

    pub fn update_received_lsn(&mut self, lsn: Lsn) {
        self.received_lsn = self.received_lsn.max(lsn);
    }

    pub fn update_applied_lsn(&mut self, lsn: Lsn) {
        self.applied_lsn = self.applied_lsn.max(lsn);
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}
