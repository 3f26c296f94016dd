//! Decodes a single pgoutput logical replication message from its raw wire
//! bytes into a `ReplicationMessage`.

use crate::errors::{StreamerError, StreamerResult};
use crate::lsn::Lsn;
use crate::wal::messages::*;
use tracing::{debug, error, warn};

pub struct MessageParser;

impl MessageParser {
    pub fn parse(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.is_empty() {
            return Err(StreamerError::protocol("empty message buffer"));
        }

        let message_type = buffer[0] as char;
        debug!(message_type, "decoding logical replication message");

        match message_type {
            'B' => Self::parse_begin(buffer),
            'C' => Self::parse_commit(buffer),
            'R' => Self::parse_relation(buffer),
            'I' => Self::parse_insert(buffer),
            'U' => Self::parse_update(buffer),
            'D' => Self::parse_delete(buffer),
            'T' => Self::parse_truncate(buffer),
            'S' => Self::parse_stream_start(buffer),
            'E' => Ok(ReplicationMessage::StreamStop),
            'c' => Self::parse_stream_commit(buffer),
            'A' => Self::parse_stream_abort(buffer),
            'O' => Self::parse_origin(buffer),
            'Y' => Self::parse_type(buffer),
            other => {
                warn!(message_type = %other, "unrecognized logical replication message type");
                Err(StreamerError::protocol_with_context("unknown message type", other.to_string()))
            }
        }
    }

    fn parse_begin(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 21 {
            return Err(StreamerError::protocol("Begin message too short"));
        }
        let mut offset = 1;
        let final_lsn = Lsn(be_u64(buffer, offset));
        offset += 8;
        let timestamp = be_i64(buffer, offset);
        offset += 8;
        let xid = be_u32(buffer, offset);
        Ok(ReplicationMessage::Begin { final_lsn, timestamp, xid })
    }

    fn parse_commit(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 26 {
            return Err(StreamerError::protocol("Commit message too short"));
        }
        let mut offset = 1;
        let flags = buffer[offset];
        offset += 1;
        let commit_lsn = Lsn(be_u64(buffer, offset));
        offset += 8;
        let end_lsn = Lsn(be_u64(buffer, offset));
        offset += 8;
        let timestamp = be_i64(buffer, offset);
        Ok(ReplicationMessage::Commit { flags, commit_lsn, end_lsn, timestamp })
    }

    fn parse_relation(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 7 {
            return Err(StreamerError::protocol("Relation message too short"));
        }
        let mut offset = 1;
        let oid = be_u32(buffer, offset);
        offset += 4;

        let namespace = read_cstr(buffer, &mut offset)?;
        let relation_name = read_cstr(buffer, &mut offset)?;

        if offset >= buffer.len() {
            return Err(StreamerError::protocol("Relation message truncated before replica identity"));
        }
        let replica_identity = buffer[offset] as char;
        offset += 1;

        if offset + 2 > buffer.len() {
            return Err(StreamerError::protocol("Relation message truncated before column count"));
        }
        let column_count = be_i16(buffer, offset);
        offset += 2;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            if offset >= buffer.len() {
                return Err(StreamerError::protocol("column data truncated"));
            }
            let key_flag = buffer[offset] as i8;
            offset += 1;
            let column_name = read_cstr(buffer, &mut offset)?;
            if offset + 8 > buffer.len() {
                return Err(StreamerError::protocol("column type/atttypmod truncated"));
            }
            let column_type = be_u32(buffer, offset);
            offset += 4;
            let atttypmod = be_i32(buffer, offset);
            offset += 4;
            columns.push(ColumnInfo { key_flag, column_name, column_type, atttypmod });
        }

        Ok(ReplicationMessage::Relation {
            relation: RelationInfo { oid, namespace, relation_name, replica_identity, column_count, columns },
        })
    }

    fn parse_insert(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(StreamerError::protocol("Insert message too short"));
        }
        let mut offset = 1;
        let transaction_id_or_oid = be_u32(buffer, offset);
        offset += 4;

        let (relation_id, is_stream, xid) = if offset < buffer.len() && buffer[offset] == b'N' {
            (transaction_id_or_oid, false, None)
        } else {
            let relation_id = be_u32(buffer, offset);
            offset += 4;
            (relation_id, true, Some(transaction_id_or_oid))
        };

        if offset >= buffer.len() || buffer[offset] != b'N' {
            return Err(StreamerError::protocol("expected 'N' marker in Insert message"));
        }
        offset += 1;

        let tuple_data = Self::parse_tuple_data(&buffer[offset..])?;
        Ok(ReplicationMessage::Insert { relation_id, tuple_data, is_stream, xid })
    }

    fn parse_update(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(StreamerError::protocol("Update message too short"));
        }
        let mut offset = 1;
        let transaction_id_or_oid = be_u32(buffer, offset);
        offset += 4;

        let (relation_id, is_stream, xid) = if offset < buffer.len()
            && matches!(buffer[offset], b'K' | b'O' | b'N')
        {
            (transaction_id_or_oid, false, None)
        } else {
            let relation_id = be_u32(buffer, offset);
            offset += 4;
            (relation_id, true, Some(transaction_id_or_oid))
        };

        if offset >= buffer.len() {
            return Err(StreamerError::protocol("Update message truncated before marker"));
        }
        let marker = buffer[offset] as char;
        offset += 1;

        let (key_type, old_tuple_data) = match marker {
            'K' | 'O' => {
                let tuple_data = Self::parse_tuple_data(&buffer[offset..])?;
                offset += tuple_data.processed_length;
                if offset >= buffer.len() || buffer[offset] != b'N' {
                    return Err(StreamerError::protocol("expected 'N' marker after old tuple data"));
                }
                offset += 1;
                (Some(marker), Some(tuple_data))
            }
            'N' => (None, None),
            other => return Err(StreamerError::protocol_with_context("invalid marker in Update message", other.to_string())),
        };

        let new_tuple_data = Self::parse_tuple_data(&buffer[offset..])?;
        Ok(ReplicationMessage::Update { relation_id, key_type, old_tuple_data, new_tuple_data, is_stream, xid })
    }

    fn parse_delete(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(StreamerError::protocol("Delete message too short"));
        }
        let mut offset = 1;
        let transaction_id_or_oid = be_u32(buffer, offset);
        offset += 4;

        let (relation_id, is_stream, xid, key_type) = if offset < buffer.len() && matches!(buffer[offset], b'K' | b'O') {
            let key_type = buffer[offset] as char;
            offset += 1;
            (transaction_id_or_oid, false, None, key_type)
        } else {
            let relation_id = be_u32(buffer, offset);
            offset += 4;
            if offset >= buffer.len() {
                return Err(StreamerError::protocol("Delete message truncated before key type"));
            }
            let key_type = buffer[offset] as char;
            offset += 1;
            (relation_id, true, Some(transaction_id_or_oid), key_type)
        };

        let tuple_data = Self::parse_tuple_data(&buffer[offset..])?;
        Ok(ReplicationMessage::Delete { relation_id, key_type, tuple_data, is_stream, xid })
    }

    fn parse_truncate(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 10 {
            return Err(StreamerError::protocol("Truncate message too short"));
        }
        let mut offset = 1;
        let xid_or_num_relations = be_u32(buffer, offset);
        offset += 4;
        let possible_relation_num = be_u32(buffer, offset);
        offset += 4;

        let remaining = buffer.len() - offset;
        let expected_streamed_size = 1 + (possible_relation_num as usize * 4);

        let (is_stream, xid, num_relations) = if remaining == expected_streamed_size {
            (true, Some(xid_or_num_relations), possible_relation_num)
        } else {
            offset -= 4;
            (false, None, xid_or_num_relations)
        };

        if offset >= buffer.len() {
            return Err(StreamerError::protocol("Truncate message truncated before flags"));
        }
        let flags = buffer[offset] as i8;
        offset += 1;

        let mut relation_ids = Vec::with_capacity(num_relations as usize);
        for _ in 0..num_relations {
            if offset + 4 > buffer.len() {
                return Err(StreamerError::protocol("Truncate relation id list truncated"));
            }
            relation_ids.push(be_u32(buffer, offset));
            offset += 4;
        }

        Ok(ReplicationMessage::Truncate { relation_ids, flags, is_stream, xid })
    }

    fn parse_stream_start(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(StreamerError::protocol("StreamStart message too short"));
        }
        let mut offset = 1;
        let xid = be_u32(buffer, offset);
        offset += 4;
        let first_segment = offset < buffer.len() && buffer[offset] == 1;
        Ok(ReplicationMessage::StreamStart { xid, first_segment })
    }

    fn parse_stream_commit(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 26 {
            return Err(StreamerError::protocol("StreamCommit message too short"));
        }
        let mut offset = 1;
        let xid = be_u32(buffer, offset);
        offset += 4;
        let flags = buffer[offset];
        offset += 1;
        let commit_lsn = Lsn(be_u64(buffer, offset));
        offset += 8;
        let end_lsn = Lsn(be_u64(buffer, offset));
        offset += 8;
        let timestamp = be_i64(buffer, offset);
        Ok(ReplicationMessage::StreamCommit { xid, flags, commit_lsn, end_lsn, timestamp })
    }

    fn parse_stream_abort(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 9 {
            return Err(StreamerError::protocol("StreamAbort message too short"));
        }
        let mut offset = 1;
        let xid = be_u32(buffer, offset);
        offset += 4;
        let subtransaction_xid = be_u32(buffer, offset);
        Ok(ReplicationMessage::StreamAbort { xid, subtransaction_xid })
    }

    /// Origin message: the commit LSN plus the replication origin name that
    /// produced it. Only present when the publication forwards origins.
    fn parse_origin(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 9 {
            return Err(StreamerError::protocol("Origin message too short"));
        }
        let mut offset = 1;
        let commit_lsn = Lsn(be_u64(buffer, offset));
        offset += 8;
        let name = read_cstr(buffer, &mut offset)?;
        Ok(ReplicationMessage::Origin { commit_lsn, name })
    }

    /// Type message: announces a composite/enum/range column type not
    /// already known to the subscriber, by OID and qualified name.
    fn parse_type(buffer: &[u8]) -> StreamerResult<ReplicationMessage> {
        if buffer.len() < 5 {
            return Err(StreamerError::protocol("Type message too short"));
        }
        let mut offset = 1;
        let oid = be_u32(buffer, offset);
        offset += 4;
        let namespace = read_cstr(buffer, &mut offset)?;
        let name = read_cstr(buffer, &mut offset)?;
        Ok(ReplicationMessage::Type { oid, namespace, name })
    }

    fn parse_tuple_data(buffer: &[u8]) -> StreamerResult<TupleData> {
        if buffer.len() < 2 {
            return Err(StreamerError::protocol("tuple data too short"));
        }
        let mut offset = 0;
        let column_count = be_i16(buffer, offset);
        offset += 2;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            if offset >= buffer.len() {
                return Err(StreamerError::protocol("tuple data truncated"));
            }
            let data_type = buffer[offset] as char;
            offset += 1;

            let column_data = match data_type {
                'n' => ColumnData { data_type: 'n', length: 0, data: String::new() },
                'u' => ColumnData { data_type: 'u', length: 0, data: String::new() },
                't' => {
                    if offset + 4 > buffer.len() {
                        return Err(StreamerError::protocol("text length truncated"));
                    }
                    let text_len = be_i32(buffer, offset);
                    offset += 4;
                    if text_len < 0 || offset + text_len as usize > buffer.len() {
                        return Err(StreamerError::protocol("text data truncated"));
                    }
                    let text_data = String::from_utf8_lossy(&buffer[offset..offset + text_len as usize]).into_owned();
                    offset += text_len as usize;
                    ColumnData { data_type: 't', length: text_len, data: text_data }
                }
                other => {
                    error!(data_type = %other, "unknown tuple column data type");
                    return Err(StreamerError::protocol_with_context("unknown tuple data type", other.to_string()));
                }
            };
            columns.push(column_data);
        }

        Ok(TupleData { column_count, columns, processed_length: offset })
    }
}

fn be_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buffer[offset..offset + 4].try_into().unwrap())
}

fn be_i32(buffer: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes(buffer[offset..offset + 4].try_into().unwrap())
}

fn be_u64(buffer: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buffer[offset..offset + 8].try_into().unwrap())
}

fn be_i64(buffer: &[u8], offset: usize) -> i64 {
    i64::from_be_bytes(buffer[offset..offset + 8].try_into().unwrap())
}

fn be_i16(buffer: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes(buffer[offset..offset + 2].try_into().unwrap())
}

fn read_cstr(buffer: &[u8], offset: &mut usize) -> StreamerResult<String> {
    let start = *offset;
    while *offset < buffer.len() && buffer[*offset] != 0 {
        *offset += 1;
    }
    if *offset >= buffer.len() {
        return Err(StreamerError::protocol("expected null-terminated string"));
    }
    let value = String::from_utf8_lossy(&buffer[start..*offset]).into_owned();
    *offset += 1;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_relation() -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"public\0");
        buf.extend_from_slice(b"metrics\0");
        buf.push(b'd');
        buf.extend_from_slice(&1i16.to_be_bytes());
        buf.push(1); // key_flag
        buf.extend_from_slice(b"id\0");
        buf.extend_from_slice(&23u32.to_be_bytes()); // int4
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        buf
    }

    #[test]
    fn parses_relation_message() {
        let msg = MessageParser::parse(&encode_relation()).unwrap();
        match msg {
            ReplicationMessage::Relation { relation } => {
                assert_eq!(relation.oid, 100);
                assert_eq!(relation.canonical_name(), "public.metrics");
                assert_eq!(relation.columns.len(), 1);
                assert_eq!(relation.columns[0].column_name, "id");
            }
            _ => panic!("expected Relation"),
        }
    }

    #[test]
    fn parses_begin_and_commit() {
        let mut begin = vec![b'B'];
        begin.extend_from_slice(&0x100u64.to_be_bytes());
        begin.extend_from_slice(&0i64.to_be_bytes());
        begin.extend_from_slice(&7u32.to_be_bytes());
        let msg = MessageParser::parse(&begin).unwrap();
        assert!(matches!(msg, ReplicationMessage::Begin { xid: 7, .. }));

        let mut commit = vec![b'C', 0];
        commit.extend_from_slice(&0x100u64.to_be_bytes());
        commit.extend_from_slice(&0x200u64.to_be_bytes());
        commit.extend_from_slice(&0i64.to_be_bytes());
        let msg = MessageParser::parse(&commit).unwrap();
        match msg {
            ReplicationMessage::Commit { end_lsn, .. } => assert_eq!(end_lsn, Lsn(0x200)),
            _ => panic!("expected Commit"),
        }
    }

    #[test]
    fn rejects_empty_buffer() {
        assert!(MessageParser::parse(&[]).is_err());
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert!(MessageParser::parse(&[b'Z']).is_err());
    }

    #[test]
    fn parses_origin_message() {
        let mut buf = vec![b'O'];
        buf.extend_from_slice(&0x100u64.to_be_bytes());
        buf.extend_from_slice(b"pub_origin\0");
        let msg = MessageParser::parse(&buf).unwrap();
        match msg {
            ReplicationMessage::Origin { commit_lsn, name } => {
                assert_eq!(commit_lsn, Lsn(0x100));
                assert_eq!(name, "pub_origin");
            }
            _ => panic!("expected Origin"),
        }
    }

    #[test]
    fn parses_type_message() {
        let mut buf = vec![b'Y'];
        buf.extend_from_slice(&16401u32.to_be_bytes());
        buf.extend_from_slice(b"public\0");
        buf.extend_from_slice(b"mood\0");
        let msg = MessageParser::parse(&buf).unwrap();
        match msg {
            ReplicationMessage::Type { oid, namespace, name } => {
                assert_eq!(oid, 16401);
                assert_eq!(namespace, "public");
                assert_eq!(name, "mood");
            }
            _ => panic!("expected Type"),
        }
    }

    #[test]
    fn insert_with_null_column() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&1i16.to_be_bytes());
        buf.push(b'n');
        let msg = MessageParser::parse(&buf).unwrap();
        match msg {
            ReplicationMessage::Insert { tuple_data, .. } => {
                assert_eq!(tuple_data.columns[0].data_type, 'n');
            }
            _ => panic!("expected Insert"),
        }
    }
}
