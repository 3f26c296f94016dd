//! The durable per-hypertable replication offset: how far a hypertable's
//! snapshot and streaming progress has gotten, in a form that survives a
//! restart.
//!
//! The binary layout is a fixed 21-byte prefix (timestamp nanos, a
//! snapshot-in-progress flag, the snapshot's row offset, and the LSN the
//! entry is valid as of) followed by an optional snapshot-name suffix. This
//! mirrors the original offset storage's record shape field-for-field so a
//! store built by an older version remains readable.

use crate::errors::{StreamerError, StreamerResult};
use crate::lsn::Lsn;
use chrono::{DateTime, Utc};

/// Nanoseconds-since-Unix-epoch timestamp plus the progress markers needed
/// to resume a hypertable's snapshot or streaming position.
#[derive(Debug, Clone, PartialEq)]
pub struct Offset {
    pub timestamp: DateTime<Utc>,
    /// `Some(name)` while a chunk snapshot for this hypertable is in flight;
    /// `None` once the snapshot has completed or was never started.
    pub snapshot_name: Option<String>,
    /// Row offset reached within the in-progress snapshot. Meaningless when
    /// `snapshot_name` is `None`.
    pub snapshot_offset: u32,
    /// The LSN this offset is valid as of: the position streaming should
    /// resume from for this hypertable.
    pub lsn: Lsn,
}

const FIXED_PREFIX_LEN: usize = 21;

impl Offset {
    pub fn new(lsn: Lsn) -> Self {
        Offset { timestamp: Utc::now(), snapshot_name: None, snapshot_offset: 0, lsn }
    }

    pub fn is_snapshot_in_progress(&self) -> bool {
        self.snapshot_name.is_some()
    }

    /// Serializes to the fixed-prefix-plus-suffix wire format.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_PREFIX_LEN);
        buf.extend_from_slice(&self.timestamp.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        buf.push(self.snapshot_name.is_some() as u8);
        buf.extend_from_slice(&self.snapshot_offset.to_be_bytes());
        buf.extend_from_slice(&u64::from(self.lsn).to_be_bytes());
        if let Some(name) = &self.snapshot_name {
            let name_bytes = name.as_bytes();
            buf.push(name_bytes.len() as u8);
            buf.extend_from_slice(name_bytes);
        }
        buf
    }

    /// Parses the fixed-prefix-plus-suffix wire format produced by `marshal`.
    pub fn unmarshal(bytes: &[u8]) -> StreamerResult<Self> {
        if bytes.len() < FIXED_PREFIX_LEN {
            return Err(StreamerError::storage(format!(
                "offset record too short: got {} bytes, need at least {FIXED_PREFIX_LEN}",
                bytes.len()
            )));
        }
        let nanos = i64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let has_snapshot = bytes[8] != 0;
        let snapshot_offset = u32::from_be_bytes(bytes[9..13].try_into().unwrap());
        let lsn = Lsn(u64::from_be_bytes(bytes[13..21].try_into().unwrap()));
        let timestamp = DateTime::from_timestamp_nanos(nanos);

        let snapshot_name = if has_snapshot {
            if bytes.len() < FIXED_PREFIX_LEN + 1 {
                return Err(StreamerError::storage("offset record missing snapshot-name length byte"));
            }
            let name_len = bytes[FIXED_PREFIX_LEN] as usize;
            let start = FIXED_PREFIX_LEN + 1;
            let end = start + name_len;
            if bytes.len() < end {
                return Err(StreamerError::storage(format!(
                    "offset record truncated: snapshot name needs {name_len} bytes, have {}",
                    bytes.len() - start
                )));
            }
            Some(String::from_utf8(bytes[start..end].to_vec())?)
        } else {
            None
        };

        Ok(Offset { timestamp, snapshot_name, snapshot_offset, lsn })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_without_snapshot_name() {
        let offset = Offset::new(Lsn(0x1234_5678));
        let bytes = offset.marshal();
        assert_eq!(bytes.len(), FIXED_PREFIX_LEN);
        let decoded = Offset::unmarshal(&bytes).unwrap();
        assert_eq!(decoded.lsn, offset.lsn);
        assert!(!decoded.is_snapshot_in_progress());
    }

    #[test]
    fn round_trips_with_snapshot_name() {
        let offset = Offset {
            timestamp: Utc::now(),
            snapshot_name: Some("exp_snap_01".to_string()),
            snapshot_offset: 4096,
            lsn: Lsn(42),
        };
        let bytes = offset.marshal();
        assert_eq!(bytes.len(), FIXED_PREFIX_LEN + 1 + "exp_snap_01".len());
        let decoded = Offset::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, offset);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(Offset::unmarshal(&[0u8; 5]).is_err());
    }

    #[test]
    fn rejects_truncated_snapshot_name() {
        let mut bytes = Offset::new(Lsn(1)).marshal();
        bytes[8] = 1; // claim a snapshot name is present
        bytes.push(5); // but declare 5 bytes and supply none
        assert!(Offset::unmarshal(&bytes).is_err());
    }
}
