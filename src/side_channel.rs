//! The short-lived catalog connection: hypertable/chunk discovery,
//! publication management, replication-slot introspection, and the
//! snapshot-table scan the Snapshotter drives.
//!
//! Built the same way the teacher's `replication::server` builds
//! `check_wal_level`/`check_publication` — plain SQL over
//! `PgConnection::exec`, reading fields back with `PgResult::getvalue`.

use crate::connection::PgConnection;
use crate::errors::{StreamerError, StreamerResult};
use crate::lsn::Lsn;
use crate::model::{Chunk, Hypertable, ReplicationSlotInfo};
use tracing::{debug, info, warn};

/// A row callback invoked once per row streamed by `snapshot_table`. An
/// `Err` return aborts the scan and rolls back the snapshot transaction.
pub type RowCallback<'a> = dyn FnMut(Vec<Option<String>>) -> StreamerResult<()> + Send + 'a;

pub struct SideChannel {
    connection: PgConnection,
}

impl SideChannel {
    pub fn connect(conninfo: &str) -> StreamerResult<Self> {
        Ok(SideChannel { connection: PgConnection::connect(conninfo)? })
    }

    /// Ensures the publication exists, creating an empty `FOR TABLES` set
    /// if necessary; chunks are attached one at a time as they're
    /// snapshotted.
    pub fn ensure_publication(&self, name: &str) -> StreamerResult<()> {
        let check = self.connection.exec(&format!("SELECT 1 FROM pg_publication WHERE pubname = '{}'", escape(name)))?;
        if check.ntuples() > 0 {
            debug!(publication = name, "publication already exists");
            return Ok(());
        }
        info!(publication = name, "creating publication");
        let result = self.connection.exec(&format!("CREATE PUBLICATION \"{}\"", name))?;
        if !result.is_ok() {
            return Err(StreamerError::catalog(format!("failed to create publication '{name}'")));
        }
        Ok(())
    }

    /// Adds a chunk to the publication if it isn't already a member.
    /// Idempotent — safe to call every time a chunk is (re-)snapshotted.
    pub fn attach_chunk(&self, publication: &str, chunk: &Chunk) -> StreamerResult<()> {
        let already = self.connection.exec(&format!(
            "SELECT 1 FROM pg_publication_tables WHERE pubname = '{}' AND schemaname = '{}' AND tablename = '{}'",
            escape(publication),
            escape(&chunk.schema),
            escape(&chunk.name)
        ))?;
        if already.ntuples() > 0 {
            return Ok(());
        }
        let result = self
            .connection
            .exec(&format!("ALTER PUBLICATION \"{}\" ADD TABLE \"{}\".\"{}\"", publication, chunk.schema, chunk.name))?;
        if !result.is_ok() {
            return Err(StreamerError::catalog(format!("failed to attach chunk {} to publication '{publication}'", chunk.canonical_name())));
        }
        Ok(())
    }

    /// Removes a chunk from the publication, used when a chunk is dropped
    /// upstream.
    pub fn detach_chunk(&self, publication: &str, chunk: &Chunk) -> StreamerResult<()> {
        let result = self
            .connection
            .exec(&format!("ALTER PUBLICATION \"{}\" DROP TABLE \"{}\".\"{}\"", publication, chunk.schema, chunk.name))?;
        if !result.is_ok() {
            warn!(chunk = %chunk.canonical_name(), "failed to detach chunk from publication (may already be gone)");
        }
        Ok(())
    }

    /// Enumerates hypertables and their chunks from
    /// `timescaledb_information.hypertables`/`chunks`.
    pub fn discover_hypertables(&self) -> StreamerResult<Vec<(Hypertable, Vec<Chunk>)>> {
        let result = self.connection.exec(
            "SELECT hypertable_schema, hypertable_name FROM timescaledb_information.hypertables ORDER BY hypertable_schema, hypertable_name",
        )?;
        if !result.is_ok() {
            return Err(StreamerError::catalog("failed to enumerate hypertables"));
        }

        let mut out = Vec::with_capacity(result.ntuples() as usize);
        for row in 0..result.ntuples() {
            let schema = field(&result, row, 0)?;
            let name = field(&result, row, 1)?;
            let hypertable = Hypertable { schema, name };
            let chunks = self.discover_chunks(&hypertable)?;
            out.push((hypertable, chunks));
        }
        Ok(out)
    }

    fn discover_chunks(&self, hypertable: &Hypertable) -> StreamerResult<Vec<Chunk>> {
        let result = self.connection.exec(&format!(
            "SELECT c.oid, ch.chunk_schema, ch.chunk_name \
             FROM timescaledb_information.chunks ch \
             JOIN pg_class c ON c.relname = ch.chunk_name \
             JOIN pg_namespace n ON n.oid = c.relnamespace AND n.nspname = ch.chunk_schema \
             WHERE ch.hypertable_schema = '{}' AND ch.hypertable_name = '{}' \
             ORDER BY ch.range_start, c.oid",
            escape(&hypertable.schema),
            escape(&hypertable.name)
        ))?;
        if !result.is_ok() {
            return Err(StreamerError::catalog(format!("failed to enumerate chunks for {}", hypertable.canonical_name())));
        }

        let mut chunks = Vec::with_capacity(result.ntuples() as usize);
        for row in 0..result.ntuples() {
            let oid: u32 = field(&result, row, 0)?.parse().map_err(|_| StreamerError::catalog("non-numeric chunk oid"))?;
            let schema = field(&result, row, 1)?;
            let name = field(&result, row, 2)?;
            chunks.push(Chunk { oid, schema, name, hypertable: hypertable.clone(), attached_to_publication: false });
        }
        Ok(chunks)
    }

    /// Reads a replication slot's state from `pg_replication_slots`.
    /// Returns `Ok(None)` when no slot with that name exists.
    pub fn read_replication_slot(&self, name: &str) -> StreamerResult<Option<ReplicationSlotInfo>> {
        let result = self.connection.exec(&format!(
            "SELECT plugin, slot_type, confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = '{}'",
            escape(name)
        ))?;
        if !result.is_ok() {
            return Err(StreamerError::catalog("failed to read pg_replication_slots"));
        }
        if result.ntuples() == 0 {
            return Ok(None);
        }
        let plugin = field(&result, 0, 0)?;
        let slot_type = field(&result, 0, 1)?;
        let confirmed_flush_lsn = result.getvalue(0, 2).map(parse_lsn_text).transpose()?.unwrap_or(Lsn::ZERO);
        Ok(Some(ReplicationSlotInfo { name: name.to_string(), plugin, slot_type, confirmed_flush_lsn }))
    }

    /// Looks up a table's columns in declared order, `(name, type OID)`
    /// pairs, via `pg_attribute`/`pg_type`. Used by the snapshotter to run
    /// scanned rows through the same Type Adapter the live decode path uses.
    pub fn table_columns(&self, schema: &str, name: &str) -> StreamerResult<Vec<(String, u32)>> {
        let result = self.connection.exec(&format!(
            "SELECT a.attname, a.atttypid \
             FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = '{}' AND c.relname = '{}' AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
            escape(schema),
            escape(name)
        ))?;
        if !result.is_ok() {
            return Err(StreamerError::catalog(format!("failed to read columns for \"{schema}\".\"{name}\"")));
        }
        let mut columns = Vec::with_capacity(result.ntuples() as usize);
        for row in 0..result.ntuples() {
            let attname = field(&result, row, 0)?;
            let atttypid: u32 = field(&result, row, 1)?.parse().map_err(|_| StreamerError::catalog("non-numeric atttypid"))?;
            columns.push((attname, atttypid));
        }
        Ok(columns)
    }

    /// Opens a repeatable-read transaction (bound to `snapshot_name` when
    /// given), streams every row of `table_name` through `on_row` via
    /// index-ordered keyset pagination, and returns the transaction's
    /// consistent-point LSN. Aborts and rolls back on the first callback
    /// error.
    pub fn snapshot_table(&self, table_name: &str, snapshot_name: Option<&str>, mut on_row: Box<RowCallback<'_>>) -> StreamerResult<Lsn> {
        self.exec_ok("BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY")?;
        if let Some(name) = snapshot_name {
            if let Err(err) = self.exec_ok(&format!("SET TRANSACTION SNAPSHOT '{}'", escape(name))) {
                self.exec_ok("ROLLBACK").ok();
                return Err(err);
            }
        }

        let lsn_result = self.connection.exec("SELECT pg_current_wal_lsn()");
        let lsn = match lsn_result.and_then(|r| field(&r, 0, 0)) {
            Ok(text) => match parse_lsn_text(text) {
                Ok(lsn) => lsn,
                Err(err) => {
                    self.exec_ok("ROLLBACK").ok();
                    return Err(err);
                }
            },
            Err(err) => {
                self.exec_ok("ROLLBACK").ok();
                return Err(err);
            }
        };

        // `ctid` is selected as an extra leading column purely to drive
        // keyset pagination; it's stripped back off before rows reach the
        // callback so column indices line up with the catalog's column list.
        const PAGE_SIZE: i32 = 512;
        let mut last_key: Option<String> = None;
        loop {
            let query = match &last_key {
                Some(key) => format!("SELECT ctid, * FROM {table_name} WHERE ctid > '{key}'::tid ORDER BY ctid LIMIT {PAGE_SIZE}"),
                None => format!("SELECT ctid, * FROM {table_name} ORDER BY ctid LIMIT {PAGE_SIZE}"),
            };
            let page = match self.connection.exec(&query) {
                Ok(page) => page,
                Err(err) => {
                    self.exec_ok("ROLLBACK").ok();
                    return Err(err);
                }
            };
            if !page.is_ok() {
                self.exec_ok("ROLLBACK").ok();
                return Err(StreamerError::snapshot(format!("failed to scan {table_name}")));
            }

            let rows = page.ntuples();
            for row in 0..rows {
                let values = (1..page.nfields()).map(|col| page.getvalue(row, col)).collect();
                if let Err(err) = on_row(values) {
                    self.exec_ok("ROLLBACK").ok();
                    return Err(err);
                }
            }

            if rows < PAGE_SIZE {
                break;
            }
            last_key = page.getvalue(rows - 1, 0);
        }

        self.exec_ok("COMMIT")?;
        Ok(lsn)
    }

    fn exec_ok(&self, query: &str) -> StreamerResult<()> {
        let result = self.connection.exec(query)?;
        if !result.is_ok() {
            return Err(StreamerError::catalog(format!("query failed: {query}")));
        }
        Ok(())
    }
}

fn field(result: &crate::connection::PgResult, row: i32, col: i32) -> StreamerResult<String> {
    result.getvalue(row, col).ok_or_else(|| StreamerError::catalog("expected non-null catalog field"))
}

/// Parses PostgreSQL's `X/Y` hex-pair LSN text representation.
fn parse_lsn_text(text: String) -> StreamerResult<Lsn> {
    let (hi, lo) = text.split_once('/').ok_or_else(|| StreamerError::catalog(format!("malformed LSN '{text}'")))?;
    let hi = u64::from_str_radix(hi, 16).map_err(|_| StreamerError::catalog(format!("malformed LSN '{text}'")))?;
    let lo = u64::from_str_radix(lo, 16).map_err(|_| StreamerError::catalog(format!("malformed LSN '{text}'")))?;
    Ok(Lsn((hi << 32) | lo))
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsn_hex_pair() {
        assert_eq!(parse_lsn_text("16A0/F0".to_string()).unwrap(), Lsn(0x16A0_00F0));
    }

    #[test]
    fn rejects_malformed_lsn_text() {
        assert!(parse_lsn_text("not-an-lsn".to_string()).is_err());
    }

    #[test]
    fn escapes_single_quotes() {
        assert_eq!(escape("O'Brien"), "O''Brien");
    }
}
