//! The Type Adapter: maps PostgreSQL OIDs to the stream's canonical type
//! system and converts decoded tuple values accordingly.
//!
//! The OID table is the same well-known set enumerated by the teacher's
//! `PgType` enum; the canonical `DataType` classification follows the
//! upstream `pgtypes` mapping one-for-one (bool/bit -> boolean, int2 ->
//! int16, timestamp family -> int64 millis, json/jsonb -> string, uuid ->
//! string, bytea/varbit -> bytes, ...). Both functions are pure and
//! stateless, so they're safe to call concurrently from every decoder task.

use crate::errors::{StreamerError, StreamerResult};
use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// The canonical data type a decoded column value is classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    String,
    Bytes,
    Array,
    Map,
    Struct,
}

/// A decoded scalar value, already converted by a `Converter`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

// Well-known OIDs, the same set the teacher's `PgType` enum lists.
pub const BOOL_OID: u32 = 16;
pub const BYTEA_OID: u32 = 17;
pub const CHAR_OID: u32 = 18;
pub const NAME_OID: u32 = 19;
pub const INT8_OID: u32 = 20;
pub const INT2_OID: u32 = 21;
pub const INT4_OID: u32 = 23;
pub const TEXT_OID: u32 = 25;
pub const OID_OID: u32 = 26;
pub const JSON_OID: u32 = 114;
pub const FLOAT4_OID: u32 = 700;
pub const FLOAT8_OID: u32 = 701;
pub const BPCHAR_OID: u32 = 1042;
pub const VARCHAR_OID: u32 = 1043;
pub const DATE_OID: u32 = 1082;
pub const TIMESTAMP_OID: u32 = 1114;
pub const TIMESTAMPTZ_OID: u32 = 1184;
pub const VARBIT_OID: u32 = 1562;
pub const NUMERIC_OID: u32 = 1700;
pub const UUID_OID: u32 = 2950;
pub const JSONB_OID: u32 = 3802;

/// Returns the canonical `DataType` for a PostgreSQL OID, or `UnsupportedOid`
/// when the OID has no mapping. Unknown OIDs fail closed per the invariant
/// that every supported OID has both a `DataType` and a `Converter`.
pub fn data_type_by_oid(oid: u32) -> StreamerResult<DataType> {
    use DataType::*;
    Ok(match oid {
        BOOL_OID => Boolean,
        BYTEA_OID => Bytes,
        CHAR_OID | NAME_OID | TEXT_OID | BPCHAR_OID | VARCHAR_OID => String,
        INT2_OID => Int16,
        INT4_OID | OID_OID => Int32,
        INT8_OID => Int64,
        FLOAT4_OID => Float32,
        FLOAT8_OID => Float64,
        TIMESTAMP_OID | TIMESTAMPTZ_OID | DATE_OID => Int64,
        JSON_OID | JSONB_OID => String,
        UUID_OID => String,
        VARBIT_OID => Bytes,
        NUMERIC_OID => Bytes,
        _ => return Err(StreamerError::UnsupportedOid(oid)),
    })
}

/// A conversion function from a decoded, still-textual tuple value to its
/// canonical representation. `None` means "pass the text through unchanged",
/// matching the teacher's `converters` table where most entries are `nil`.
pub type Converter = fn(u32, &str) -> StreamerResult<Value>;

/// Returns the converter for a PostgreSQL OID, or `UnsupportedOid` if none is
/// registered. Per the type-adapter invariant, this succeeds exactly when
/// `data_type_by_oid` succeeds for the same OID.
pub fn converter_by_oid(oid: u32) -> StreamerResult<Converter> {
    data_type_by_oid(oid)?;
    Ok(match oid {
        TIMESTAMP_OID | TIMESTAMPTZ_OID => timestamp_to_millis,
        JSON_OID | JSONB_OID => json_to_compact_text,
        UUID_OID => uuid_to_canonical_text,
        VARBIT_OID => bits_to_bytes,
        BOOL_OID => bool_passthrough,
        INT2_OID | INT4_OID | OID_OID | INT8_OID => int_passthrough,
        FLOAT4_OID | FLOAT8_OID => float_passthrough,
        _ => text_passthrough,
    })
}

fn text_passthrough(_oid: u32, value: &str) -> StreamerResult<Value> {
    Ok(Value::String(value.to_string()))
}

fn bool_passthrough(oid: u32, value: &str) -> StreamerResult<Value> {
    match value {
        "t" => Ok(Value::Bool(true)),
        "f" => Ok(Value::Bool(false)),
        _ => Err(StreamerError::IllegalValue { oid }),
    }
}

fn int_passthrough(oid: u32, value: &str) -> StreamerResult<Value> {
    value
        .parse::<i64>()
        .map(Value::Int64)
        .map_err(|_| StreamerError::IllegalValue { oid })
}

fn float_passthrough(oid: u32, value: &str) -> StreamerResult<Value> {
    value
        .parse::<f64>()
        .map(Value::Float64)
        .map_err(|_| StreamerError::IllegalValue { oid })
}

/// Timestamp-family -> milliseconds since the Unix epoch (int64).
fn timestamp_to_millis(oid: u32, value: &str) -> StreamerResult<Value> {
    // pgoutput sends timestamps as `YYYY-MM-DD HH:MM:SS[.ffffff][+TZ]`.
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| {
            chrono::DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|dt| dt.naive_utc())
        })
        .map_err(|_| StreamerError::IllegalValue { oid })?;
    Ok(Value::Int64(naive.and_utc().timestamp_millis()))
}

/// JSON/JSONB -> compact JSON text.
fn json_to_compact_text(oid: u32, value: &str) -> StreamerResult<Value> {
    let parsed: JsonValue = serde_json::from_str(value).map_err(|_| StreamerError::IllegalValue { oid })?;
    Ok(Value::String(parsed.to_string()))
}

/// UUID -> canonical 8-4-4-4-12 string.
fn uuid_to_canonical_text(oid: u32, value: &str) -> StreamerResult<Value> {
    let parsed = Uuid::parse_str(value).map_err(|_| StreamerError::IllegalValue { oid })?;
    Ok(Value::String(parsed.hyphenated().to_string()))
}

/// bit-array -> raw bytes (the textual `0`/`1` bitstring packed MSB-first).
fn bits_to_bytes(oid: u32, value: &str) -> StreamerResult<Value> {
    if !value.bytes().all(|b| b == b'0' || b == b'1') {
        return Err(StreamerError::IllegalValue { oid });
    }
    let mut bytes = Vec::with_capacity(value.len().div_ceil(8));
    let mut cur = 0u8;
    let mut bits_in_cur = 0u8;
    for bit in value.bytes() {
        cur = (cur << 1) | (bit - b'0');
        bits_in_cur += 1;
        if bits_in_cur == 8 {
            bytes.push(cur);
            cur = 0;
            bits_in_cur = 0;
        }
    }
    if bits_in_cur > 0 {
        bytes.push(cur << (8 - bits_in_cur));
    }
    Ok(Value::Bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_oids_succeed_together() {
        for oid in [BOOL_OID, INT2_OID, INT4_OID, INT8_OID, TIMESTAMP_OID, JSONB_OID, UUID_OID, VARBIT_OID] {
            assert!(data_type_by_oid(oid).is_ok());
            assert!(converter_by_oid(oid).is_ok());
        }
    }

    #[test]
    fn unknown_oid_fails_both() {
        let oid = 999_999;
        assert!(matches!(data_type_by_oid(oid), Err(StreamerError::UnsupportedOid(o)) if o == oid));
        assert!(matches!(converter_by_oid(oid), Err(StreamerError::UnsupportedOid(o)) if o == oid));
    }

    #[test]
    fn timestamp_converts_to_millis() {
        let conv = converter_by_oid(TIMESTAMP_OID).unwrap();
        let value = conv(TIMESTAMP_OID, "2024-01-01 00:00:00").unwrap();
        assert_eq!(value, Value::Int64(1_704_067_200_000));
    }

    #[test]
    fn uuid_round_trips_to_canonical_form() {
        let conv = converter_by_oid(UUID_OID).unwrap();
        let value = conv(UUID_OID, "550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(value, Value::String("550e8400-e29b-41d4-a716-446655440000".to_string()));
    }

    #[test]
    fn illegal_value_for_supported_oid() {
        let conv = converter_by_oid(UUID_OID).unwrap();
        assert!(matches!(conv(UUID_OID, "not-a-uuid"), Err(StreamerError::IllegalValue { .. })));
    }

    #[test]
    fn bits_pack_msb_first() {
        let conv = converter_by_oid(VARBIT_OID).unwrap();
        let value = conv(VARBIT_OID, "10110000").unwrap();
        assert_eq!(value, Value::Bytes(vec![0b1011_0000]));
    }
}
