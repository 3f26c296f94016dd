//! The canonical event model dispatched to sinks, and the decoder that
//! turns WAL messages plus the relation cache into these events.

use crate::errors::{StreamerError, StreamerResult};
use crate::lsn::Lsn;
use crate::pgtypes;
use crate::wal::{ColumnData, RelationInfo, ReplicationMessage, TupleData};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;

/// A decoded row, keyed by column name, with values already run through
/// the Type Adapter.
pub type Row = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Begin { xid: u32, commit_lsn: Lsn },
    Commit { lsn: Lsn, end_lsn: Lsn, ts: i64 },
    Read { lsn: Lsn, hypertable: String, chunk: String, row: Row },
    Insert { lsn: Lsn, hypertable: String, row: Row },
    Update { lsn: Lsn, hypertable: String, old: Option<Row>, new: Row },
    Delete { lsn: Lsn, hypertable: String, old: Row },
    Truncate { lsn: Lsn, hypertables: Vec<String> },
    Relation { oid: u32, schema: String, table: String },
    Origin { commit_lsn: Lsn, name: String },
    Type { oid: u32, schema: String, name: String },
}

impl Event {
    /// The LSN each event carries, used to enforce per-hypertable
    /// monotonic delivery order.
    pub fn lsn(&self) -> Lsn {
        match self {
            Event::Begin { commit_lsn, .. } => *commit_lsn,
            Event::Commit { end_lsn, .. } => *end_lsn,
            Event::Read { lsn, .. }
            | Event::Insert { lsn, .. }
            | Event::Update { lsn, .. }
            | Event::Delete { lsn, .. }
            | Event::Truncate { lsn, .. } => *lsn,
            Event::Origin { commit_lsn, .. } => *commit_lsn,
            Event::Relation { .. } | Event::Type { .. } => Lsn::ZERO,
        }
    }

    /// The parent hypertable's canonical name this event is keyed on for
    /// dispatcher partitioning, if any.
    pub fn routing_key(&self) -> Option<&str> {
        match self {
            Event::Read { hypertable, .. } => Some(hypertable),
            Event::Insert { hypertable, .. } | Event::Update { hypertable, .. } | Event::Delete { hypertable, .. } => Some(hypertable),
            _ => None,
        }
    }
}

/// Builds canonical events from decoded WAL messages, resolving relations
/// from the caller-supplied cache and converting tuple columns through the
/// Type Adapter.
pub struct EventBuilder;

impl EventBuilder {
    /// Builds the event(s) a single WAL message produces. Begin/Commit/
    /// Relation/Truncate always produce exactly one event; StreamStart/
    /// StreamStop/StreamAbort carry no row data relevant to the canonical
    /// event model and produce none.
    ///
    /// `chunk_hypertables` maps a chunk's physical relation OID (what the
    /// WAL message actually names) to its parent hypertable's canonical
    /// name, so DML is keyed the same way a `Read` event from the
    /// snapshotter is: on the hypertable, never the chunk.
    pub fn build(
        message: &ReplicationMessage,
        relations: &std::collections::HashMap<u32, RelationInfo>,
        chunk_hypertables: &std::collections::HashMap<u32, String>,
    ) -> StreamerResult<Vec<Event>> {
        match message {
            ReplicationMessage::Begin { final_lsn, xid, .. } => {
                Ok(vec![Event::Begin { xid: *xid, commit_lsn: *final_lsn }])
            }
            ReplicationMessage::Commit { end_lsn, commit_lsn, timestamp, .. } => {
                Ok(vec![Event::Commit { lsn: *commit_lsn, end_lsn: *end_lsn, ts: *timestamp }])
            }
            ReplicationMessage::Relation { relation } => {
                Ok(vec![Event::Relation { oid: relation.oid, schema: relation.namespace.clone(), table: relation.relation_name.clone() }])
            }
            ReplicationMessage::Insert { relation_id, tuple_data, .. } => {
                let relation = resolve_relation(relations, *relation_id)?;
                let row = decode_tuple(tuple_data, relation)?;
                let hypertable = hypertable_name(chunk_hypertables, *relation_id, relation);
                Ok(vec![Event::Insert { lsn: Lsn::ZERO, hypertable, row }])
            }
            ReplicationMessage::Update { relation_id, old_tuple_data, new_tuple_data, .. } => {
                let relation = resolve_relation(relations, *relation_id)?;
                let old = old_tuple_data.as_ref().map(|t| decode_tuple(t, relation)).transpose()?;
                let new = decode_tuple(new_tuple_data, relation)?;
                let hypertable = hypertable_name(chunk_hypertables, *relation_id, relation);
                Ok(vec![Event::Update { lsn: Lsn::ZERO, hypertable, old, new }])
            }
            ReplicationMessage::Delete { relation_id, tuple_data, .. } => {
                let relation = resolve_relation(relations, *relation_id)?;
                let old = decode_tuple(tuple_data, relation)?;
                let hypertable = hypertable_name(chunk_hypertables, *relation_id, relation);
                Ok(vec![Event::Delete { lsn: Lsn::ZERO, hypertable, old }])
            }
            ReplicationMessage::Truncate { relation_ids, .. } => {
                let names = relation_ids
                    .iter()
                    .filter_map(|id| relations.get(id).map(|relation| hypertable_name(chunk_hypertables, *id, relation)))
                    .collect();
                Ok(vec![Event::Truncate { lsn: Lsn::ZERO, hypertables: names }])
            }
            ReplicationMessage::StreamStart { .. } | ReplicationMessage::StreamStop | ReplicationMessage::StreamAbort { .. } => {
                Ok(vec![])
            }
            ReplicationMessage::StreamCommit { end_lsn, commit_lsn, timestamp, .. } => {
                Ok(vec![Event::Commit { lsn: *commit_lsn, end_lsn: *end_lsn, ts: *timestamp }])
            }
            ReplicationMessage::Origin { commit_lsn, name } => {
                Ok(vec![Event::Origin { commit_lsn: *commit_lsn, name: name.clone() }])
            }
            ReplicationMessage::Type { oid, namespace, name } => {
                Ok(vec![Event::Type { oid: *oid, schema: namespace.clone(), name: name.clone() }])
            }
        }
    }

    /// Stamps the LSN a Begin..Commit window resolved to onto every DML
    /// event built from messages within that window. Called by the
    /// decoder after the transaction's Commit LSN is known, satisfying the
    /// invariant that every DML event's LSN lies in `(lastBegin, lastCommit]`.
    pub fn with_lsn(mut event: Event, lsn: Lsn) -> Event {
        match &mut event {
            Event::Read { lsn: l, .. }
            | Event::Insert { lsn: l, .. }
            | Event::Update { lsn: l, .. }
            | Event::Delete { lsn: l, .. }
            | Event::Truncate { lsn: l, .. } => *l = lsn,
            _ => {}
        }
        event
    }
}

fn resolve_relation(relations: &std::collections::HashMap<u32, RelationInfo>, id: u32) -> StreamerResult<&RelationInfo> {
    relations.get(&id).ok_or_else(|| StreamerError::protocol_with_context("unknown relation id in DML message", id.to_string()))
}

/// Resolves a chunk's parent hypertable canonical name. Falls back to the
/// chunk's own canonical name (with a warning) for a relation id the
/// startup catalog scan never saw — e.g. a chunk created after the
/// snapshot-seed catalog query ran — rather than dropping the DML.
fn hypertable_name(chunk_hypertables: &std::collections::HashMap<u32, String>, relation_id: u32, relation: &RelationInfo) -> String {
    chunk_hypertables.get(&relation_id).cloned().unwrap_or_else(|| {
        warn!(relation_id, relation = %relation.canonical_name(), "no known parent hypertable for this chunk, keying on its own name");
        relation.canonical_name()
    })
}

/// Decodes a wire tuple into a JSON row, running every column through the
/// Type Adapter. A malformed column (unsupported OID, illegal value) is
/// fatal — DML must never be silently dropped.
fn decode_tuple(tuple: &TupleData, relation: &RelationInfo) -> StreamerResult<Row> {
    let mut row = JsonMap::new();
    for (i, column) in tuple.columns.iter().enumerate() {
        let Some(info) = relation.columns.get(i) else {
            warn!(index = i, relation = %relation.canonical_name(), "tuple column index exceeds relation column count");
            continue;
        };
        let value = decode_column(column, info.column_type)?;
        row.insert(info.column_name.clone(), value);
    }
    Ok(row)
}

fn decode_column(column: &ColumnData, oid: u32) -> StreamerResult<JsonValue> {
    match column.data_type {
        'n' => Ok(JsonValue::Null),
        'u' => Ok(JsonValue::String("<unchanged-toast>".to_string())),
        't' => decode_text_value(oid, &column.data),
        other => Err(StreamerError::protocol_with_context("unknown column wire tag", other.to_string())),
    }
}

/// Runs a single textual column value through the Type Adapter. Shared by
/// the WAL tuple decoder above and the snapshotter, which reads the same
/// textual representation back from a plain `SELECT`.
pub fn decode_text_value(oid: u32, value: &str) -> StreamerResult<JsonValue> {
    let converter = pgtypes::converter_by_oid(oid)?;
    let converted = converter(oid, value)?;
    Ok(pgvalue_to_json(converted))
}

fn pgvalue_to_json(value: pgtypes::Value) -> JsonValue {
    match value {
        pgtypes::Value::Null => JsonValue::Null,
        pgtypes::Value::Bool(b) => JsonValue::Bool(b),
        pgtypes::Value::Int64(i) => JsonValue::Number(i.into()),
        pgtypes::Value::Float64(f) => serde_json::Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        pgtypes::Value::String(s) => JsonValue::String(s),
        pgtypes::Value::Bytes(b) => JsonValue::String(hex_encode(&b)),
        pgtypes::Value::Json(v) => v,
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::ColumnInfo;
    use std::collections::HashMap;

    fn sample_relation() -> RelationInfo {
        RelationInfo {
            oid: 1,
            namespace: "public".to_string(),
            relation_name: "metrics".to_string(),
            replica_identity: 'd',
            column_count: 1,
            columns: vec![ColumnInfo { key_flag: 1, column_name: "id".to_string(), column_type: pgtypes::INT4_OID, atttypmod: -1 }],
        }
    }

    #[test]
    fn insert_decodes_into_a_row_keyed_by_column_name() {
        let mut relations = HashMap::new();
        relations.insert(1, sample_relation());
        let msg = ReplicationMessage::Insert {
            relation_id: 1,
            tuple_data: TupleData {
                column_count: 1,
                columns: vec![ColumnData { data_type: 't', length: 1, data: "7".to_string() }],
                processed_length: 0,
            },
            is_stream: false,
            xid: None,
        };
        let events = EventBuilder::build(&msg, &relations, &HashMap::new()).unwrap();
        match &events[0] {
            Event::Insert { hypertable, row, .. } => {
                assert_eq!(hypertable, "public.metrics");
                assert_eq!(row.get("id"), Some(&JsonValue::Number(7.into())));
            }
            _ => panic!("expected Insert"),
        }
    }

    #[test]
    fn insert_on_a_chunk_is_keyed_on_its_parent_hypertable() {
        let mut relations = HashMap::new();
        relations.insert(1, sample_relation());
        let mut chunk_hypertables = HashMap::new();
        chunk_hypertables.insert(1, "public.metrics_ht".to_string());
        let msg = ReplicationMessage::Insert {
            relation_id: 1,
            tuple_data: TupleData {
                column_count: 1,
                columns: vec![ColumnData { data_type: 't', length: 1, data: "7".to_string() }],
                processed_length: 0,
            },
            is_stream: false,
            xid: None,
        };
        let events = EventBuilder::build(&msg, &relations, &chunk_hypertables).unwrap();
        match &events[0] {
            Event::Insert { hypertable, .. } => assert_eq!(hypertable, "public.metrics_ht"),
            _ => panic!("expected Insert"),
        }
    }

    #[test]
    fn unknown_relation_id_is_an_error() {
        let msg = ReplicationMessage::Insert {
            relation_id: 999,
            tuple_data: TupleData { column_count: 0, columns: vec![], processed_length: 0 },
            is_stream: false,
            xid: None,
        };
        assert!(EventBuilder::build(&msg, &HashMap::new(), &HashMap::new()).is_err());
    }

    #[test]
    fn with_lsn_stamps_dml_events_only() {
        let event = Event::Insert { lsn: Lsn::ZERO, hypertable: "public.metrics".to_string(), row: JsonMap::new() };
        let stamped = EventBuilder::with_lsn(event, Lsn(42));
        assert_eq!(stamped.lsn(), Lsn(42));
    }
}
