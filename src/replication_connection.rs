//! The long-lived replication connection: `Disconnected -> Connected ->
//! Identified -> Streaming -> Stopped`, plus the `IDENTIFY_SYSTEM`/
//! `CREATE_REPLICATION_SLOT`/`START_REPLICATION` exchanges and the
//! restart-LSN recovery rule.
//!
//! Grounded on `replication::server::ReplicationServer`: the same
//! `PgConnection::exec`/`get_copy_data`/`put_copy_data` calls, generalized
//! into an explicit state machine with a deadline-bounded receive and the
//! three-branch restart-LSN computation this spec adds.

use crate::connection::PgConnection;
use crate::errors::{StreamerError, StreamerResult};
use crate::lsn::Lsn;
use crate::model::SystemIdentification;
use crate::offset::Offset;
use crate::utils::utc_to_pg_timestamp;
use crate::wal::buffer::BufferWriter;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Identified,
    Streaming,
    Stopped,
}

pub struct ReplicationConnection {
    conninfo: String,
    connection: Option<PgConnection>,
    state: ConnectionState,
    identification: Option<SystemIdentification>,
    slot_created_by_us: bool,
}

impl ReplicationConnection {
    pub fn new(conninfo: impl Into<String>) -> Self {
        ReplicationConnection {
            conninfo: conninfo.into(),
            connection: None,
            state: ConnectionState::Disconnected,
            identification: None,
            slot_created_by_us: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Dials the upstream with `replication=database` appended so the
    /// connection speaks the replication protocol rather than ordinary SQL.
    pub fn connect(&mut self) -> StreamerResult<()> {
        let conninfo = format!("{} replication=database", self.conninfo);
        self.connection = Some(PgConnection::connect(&conninfo)?);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    pub fn identify_system(&mut self) -> StreamerResult<SystemIdentification> {
        let conn = self.require_connection()?;
        let result = conn.exec("IDENTIFY_SYSTEM")?;
        if !result.is_ok() || result.ntuples() == 0 {
            return Err(StreamerError::connect("IDENTIFY_SYSTEM failed"));
        }
        let system_id = result.getvalue(0, 0).unwrap_or_default();
        let timeline = result.getvalue(0, 1).and_then(|v| v.parse().ok()).unwrap_or(0);
        let x_log_pos = result.getvalue(0, 2).map(parse_lsn_text).transpose()?.unwrap_or(Lsn::ZERO);
        let db_name = result.getvalue(0, 3);

        let identification = SystemIdentification { system_id, timeline, x_log_pos, db_name };
        info!(system_id = %identification.system_id, timeline = identification.timeline, xlogpos = %identification.x_log_pos, "identified system");
        self.identification = Some(identification.clone());
        self.state = ConnectionState::Identified;
        Ok(identification)
    }

    /// Creates the logical replication slot on `pgoutput` with
    /// `EXPORT_SNAPSHOT` if `create` is set and the slot doesn't already
    /// exist. Returns `(snapshot_name, created)`.
    pub fn create_replication_slot(&mut self, slot_name: &str, create: bool, already_exists: bool) -> StreamerResult<(Option<String>, bool)> {
        if already_exists || !create {
            return Ok((None, false));
        }
        let conn = self.require_connection()?;
        let result = conn.exec(&format!("CREATE_REPLICATION_SLOT \"{slot_name}\" LOGICAL pgoutput EXPORT_SNAPSHOT"))?;
        if !result.is_ok() || result.ntuples() == 0 {
            return Err(StreamerError::connect(format!("CREATE_REPLICATION_SLOT failed for '{slot_name}'")));
        }
        // slot_name, consistent_point, snapshot_name, output_plugin
        let snapshot_name = result.getvalue(0, 2);
        info!(slot = slot_name, snapshot = ?snapshot_name, "created replication slot");
        self.slot_created_by_us = true;
        Ok((snapshot_name, true))
    }

    /// Computes the LSN at which to resume, per the three-branch rule:
    /// the slot's confirmed-flush LSN, overridden by a higher durable
    /// offset LSN, overridden by the server's current position if both are
    /// still zero.
    pub fn locate_restart_lsn(&self, confirmed_flush: Lsn, durable_offset: Option<&Offset>) -> Lsn {
        let candidate = confirmed_flush;
        if let Some(offset) = durable_offset {
            if offset.lsn > candidate {
                info!(lsn = %offset.lsn, "resuming from last LSN in offset storage");
                return offset.lsn;
            }
        }
        if candidate.is_unset() {
            let current = self.identification.as_ref().map(|i| i.x_log_pos).unwrap_or(Lsn::ZERO);
            info!(lsn = %current, "resuming from current LSN");
            return current;
        }
        info!(lsn = %candidate, "resuming from slot confirmed_flush_lsn");
        candidate
    }

    /// Issues `START_REPLICATION SLOT ... LOGICAL <lsn> (...)`. Reconnects
    /// exactly once and retries if the first attempt fails.
    pub fn start_replication(&mut self, slot_name: &str, publication_name: &str, start_lsn: Lsn) -> StreamerResult<()> {
        match self.try_start_replication(slot_name, publication_name, start_lsn) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "START_REPLICATION failed, reconnecting once and retrying");
                self.connect()?;
                self.try_start_replication(slot_name, publication_name, start_lsn)
            }
        }
    }

    fn try_start_replication(&mut self, slot_name: &str, publication_name: &str, start_lsn: Lsn) -> StreamerResult<()> {
        let conn = self.require_connection()?;
        let sql = format!(
            "START_REPLICATION SLOT \"{slot_name}\" LOGICAL {start_lsn} (proto_version '2', publication_names '{publication_name}', streaming 'on')"
        );
        let result = conn.exec(&sql)?;
        if !result.is_copy_both() {
            return Err(StreamerError::connect(format!("START_REPLICATION failed: {:?}", result.status())));
        }
        self.state = ConnectionState::Streaming;
        Ok(())
    }

    /// Tears down the current socket (if any) and re-runs the full
    /// handshake: connect, `IDENTIFY_SYSTEM`, `START_REPLICATION` from
    /// `resume_lsn`. Used by the steady-state reconnect loop after a
    /// `ConnectError`; the slot must already exist, so creation is not
    /// repeated here.
    pub fn reconnect(&mut self, slot_name: &str, publication_name: &str, resume_lsn: Lsn) -> StreamerResult<()> {
        self.connection = None;
        self.state = ConnectionState::Disconnected;
        self.connect()?;
        self.identify_system()?;
        self.try_start_replication(slot_name, publication_name, resume_lsn)
    }

    /// Sends a standby status update frame, the `'r'`-tagged feedback
    /// message carrying write/flush/apply positions and a timestamp.
    pub fn send_status_update(&self, write_lsn: Lsn, flush_lsn: Lsn, apply_lsn: Lsn) -> StreamerResult<()> {
        let conn = self.connection.as_ref().ok_or_else(|| StreamerError::connect("not connected"))?;
        let mut writer = BufferWriter::new();
        writer.write_char('r');
        writer.write_u64(write_lsn.into());
        writer.write_u64(flush_lsn.into());
        writer.write_u64(apply_lsn.into());
        writer.write_i64(utc_to_pg_timestamp(chrono::Utc::now()));
        writer.write_u8(0);
        conn.put_copy_data(&writer.into_bytes())?;
        conn.flush()?;
        debug!(write = %write_lsn, flush = %flush_lsn, apply = %apply_lsn, "sent standby status update");
        Ok(())
    }

    /// Returns the next COPY message, or `None` once `deadline` elapses.
    /// Deadline expiry is not an error; other errors propagate.
    pub fn receive_message(&self, deadline: Instant) -> StreamerResult<Option<Vec<u8>>> {
        let conn = self.connection.as_ref().ok_or_else(|| StreamerError::connect("not connected"))?;
        loop {
            match conn.get_copy_data()? {
                Some(data) => return Ok(Some(data)),
                None => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Sends CopyDone. The upstream's "internal error" immediately after is
    /// an expected shutdown race and is swallowed, not propagated.
    pub fn stop_replication(&mut self) -> StreamerResult<()> {
        if let Some(conn) = &self.connection {
            if let Err(err) = conn.send_copy_done() {
                warn!(error = %err, "error sending CopyDone, treating as expected shutdown race");
            }
        }
        self.state = ConnectionState::Stopped;
        Ok(())
    }

    /// Drops the slot only if this process created it and auto-drop is
    /// enabled.
    pub fn drop_replication_slot(&self, slot_name: &str, autodrop: bool) -> StreamerResult<()> {
        if !self.slot_created_by_us || !autodrop {
            return Ok(());
        }
        let conn = self.connection.as_ref().ok_or_else(|| StreamerError::connect("not connected"))?;
        let result = conn.exec(&format!("DROP_REPLICATION_SLOT \"{slot_name}\""))?;
        if !result.is_ok() {
            warn!(slot = slot_name, "failed to drop replication slot we created");
        }
        Ok(())
    }

    fn require_connection(&mut self) -> StreamerResult<&PgConnection> {
        self.connection.as_ref().ok_or_else(|| StreamerError::connect("replication connection not established"))
    }
}

fn parse_lsn_text(text: String) -> StreamerResult<Lsn> {
    let (hi, lo) = text.split_once('/').ok_or_else(|| StreamerError::connect(format!("malformed LSN '{text}'")))?;
    let hi = u64::from_str_radix(hi, 16).map_err(|_| StreamerError::connect(format!("malformed LSN '{text}'")))?;
    let lo = u64::from_str_radix(lo, 16).map_err(|_| StreamerError::connect(format!("malformed LSN '{text}'")))?;
    Ok(Lsn((hi << 32) | lo))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ReplicationConnection {
        ReplicationConnection::new("host=localhost dbname=test")
    }

    #[test]
    fn restart_lsn_prefers_durable_offset_when_higher() {
        let c = conn();
        let offset = Offset::new(Lsn(200));
        assert_eq!(c.locate_restart_lsn(Lsn(100), Some(&offset)), Lsn(200));
    }

    #[test]
    fn restart_lsn_falls_back_to_confirmed_flush() {
        let c = conn();
        let offset = Offset::new(Lsn(50));
        assert_eq!(c.locate_restart_lsn(Lsn(100), Some(&offset)), Lsn(100));
    }

    #[test]
    fn restart_lsn_falls_back_to_identification_when_all_zero() {
        let mut c = conn();
        c.identification = Some(SystemIdentification {
            system_id: "1".to_string(),
            timeline: 1,
            x_log_pos: Lsn(0x10_00),
            db_name: None,
        });
        assert_eq!(c.locate_restart_lsn(Lsn::ZERO, None), Lsn(0x10_00));
    }

    #[test]
    fn new_connection_starts_disconnected() {
        assert_eq!(conn().state(), ConnectionState::Disconnected);
    }
}
