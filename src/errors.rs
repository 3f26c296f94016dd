//! Error types for the event streamer.
//!
//! Mirrors the taxonomy from the project's error-handling design: every
//! fallible operation returns a `StreamerError`, built with `thiserror` the
//! same way the original replication-checker grouped connection/config/
//! protocol errors into one enum with constructor helpers.

use thiserror::Error;

/// Top-level error type for the event streamer.
#[derive(Error, Debug)]
pub enum StreamerError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("connection error: {message}")]
    Connect { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String, context: Option<String> },

    #[error("replication slot state error: {message}")]
    SlotState { message: String },

    #[error("catalog error: {message}")]
    Catalog { message: String },

    #[error("snapshot error: {message}")]
    Snapshot { message: String },

    #[error("sink error: {message}")]
    Sink { message: String, sink: String },

    #[error("replicator construction failed: {message}")]
    ReplicatorInit { message: String },

    #[error("offset storage error: {message}")]
    Storage { message: String },

    #[error("operation canceled")]
    Canceled,

    #[error("illegal value for OID {oid}")]
    IllegalValue { oid: u32 },

    #[error("unsupported OID: {0}")]
    UnsupportedOid(u32),

    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StreamerResult<T> = std::result::Result<T, StreamerError>;

impl StreamerError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect { message: message.into() }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into(), context: None }
    }

    pub fn protocol_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Protocol { message: message.into(), context: Some(context.into()) }
    }

    pub fn slot_state<S: Into<String>>(message: S) -> Self {
        Self::SlotState { message: message.into() }
    }

    pub fn catalog<S: Into<String>>(message: S) -> Self {
        Self::Catalog { message: message.into() }
    }

    pub fn snapshot<S: Into<String>>(message: S) -> Self {
        Self::Snapshot { message: message.into() }
    }

    pub fn sink<S: Into<String>, N: Into<String>>(message: S, sink: N) -> Self {
        Self::Sink { message: message.into(), sink: sink.into() }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage { message: message.into() }
    }

    pub fn replicator_init<S: Into<String>>(message: S) -> Self {
        Self::ReplicatorInit { message: message.into() }
    }

    /// Whether this error kind should be treated as fatal on load, per the
    /// propagation policy: ConfigError, SlotStateError, ProtocolError, and
    /// StorageError are fatal; everything else is handled by reconnect/retry
    /// logic upstream.
    pub fn is_fatal_on_load(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::SlotState { .. } | Self::Protocol { .. } | Self::Storage { .. }
        )
    }

    /// Maps this error to the process exit code from the external-interfaces
    /// section: config parse failure exits 6, a sink that can't be started
    /// exits 50 (plugin load failure), any other failure before the receive
    /// loop starts exits 21 (replicator construction failure), everything
    /// else fatal exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 6,
            Self::Sink { .. } => 50,
            Self::ReplicatorInit { .. } => 21,
            _ => 1,
        }
    }
}
