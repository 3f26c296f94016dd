//! Small stateless helpers shared across the replication pipeline:
//! PostgreSQL epoch timestamp conversion and the partition-assignment hash.

use chrono::{DateTime, Utc};

const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Converts a PostgreSQL `timestamp`/`timestamptz` wire value (microseconds
/// since 2000-01-01) into a UTC `DateTime`.
pub fn pg_timestamp_to_utc(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros + PG_EPOCH_OFFSET_SECS * 1_000_000;
    DateTime::from_timestamp(unix_micros / 1_000_000, ((unix_micros % 1_000_000) * 1_000) as u32)
        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}

/// Converts a UTC `DateTime` into the PostgreSQL wire format (microseconds
/// since 2000-01-01), the inverse of `pg_timestamp_to_utc`.
pub fn utc_to_pg_timestamp(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a 64-bit hash, used exclusively to assign a hypertable's canonical
/// name to a dispatcher/snapshotter partition.
pub fn fnv1a_64(data: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Assigns a canonical hypertable name to one of `partition_count` shards.
/// `partition_count` must be in `1..=255` per the partitioning contract.
pub fn partition_for(canonical_name: &str, partition_count: u8) -> usize {
    (fnv1a_64(canonical_name) % partition_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_assignment_is_deterministic() {
        let a = partition_for("public.metrics", 16);
        let b = partition_for("public.metrics", 16);
        assert_eq!(a, b);
        assert!(a < 16);
    }

    #[test]
    fn different_names_can_land_on_different_partitions() {
        let partitions: std::collections::HashSet<usize> =
            (0..50).map(|i| partition_for(&format!("public.table_{i}"), 8)).collect();
        assert!(partitions.len() > 1);
    }

    #[test]
    fn timestamp_round_trips_through_pg_epoch() {
        let now = Utc::now();
        let micros = utc_to_pg_timestamp(now);
        let back = pg_timestamp_to_utc(micros);
        assert!((now.timestamp_micros() - back.timestamp_micros()).abs() < 2);
    }
}
