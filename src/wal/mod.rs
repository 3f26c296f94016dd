//! WAL wire protocol: buffer cursors, decoded message types, and the
//! pgoutput message parser.

pub mod buffer;
pub mod messages;
pub mod parser;

pub use messages::{ColumnData, ColumnInfo, Oid, RelationInfo, ReplicationMessage, ReplicationState, TupleData, Xid};
pub use parser::MessageParser;
