//! Error types for the replicator
//!
//! One error enum per pipeline stage, plus [`ReplicatorError`] which the
//! supervisor records as the last error and classifies for logging.

use crate::position::Gtid;
use crate::schema::TableRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection, timeout, disconnect
    Network,
    /// Replication protocol and binlog position errors
    Replication,
    /// Table layout and metadata errors
    Schema,
    /// Downstream sink errors
    Sink,
    /// Position store errors
    Storage,
    /// Invalid settings
    Configuration,
}

/// Position store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Nothing stored and no default position configured
    #[error("no checkpoint stored and no start position configured")]
    NoCheckpoint,

    /// Attempt to move the stored position backwards within a domain
    #[error("position regression: stored {stored}, attempted {attempted}")]
    Regression { stored: Gtid, attempted: Gtid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document could not be parsed
    #[error("position format error: {0}")]
    Format(String),
}

/// Source connection and metadata errors.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Authentication rejected by the server
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Unexpected packet layout
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error packet from the server
    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    /// The server closed the replication stream
    #[error("Connection closed")]
    Disconnected,

    /// The requested GTID is no longer in the source's binlogs
    #[error("Position {position} not available on source: {message}")]
    PositionNotAvailable { position: String, message: String },

    /// The source aborted the binlog dump for another reason
    #[error("Source stopped replication with error {code}: {message}")]
    SourceFatal { code: u16, message: String },

    /// Metadata lookup found no such table
    #[error("Table {0} not found in source metadata")]
    TableNotFound(TableRef),

    /// Metadata query failure
    #[error("Metadata query failed: {0}")]
    Metadata(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConnectError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Errors that end the current run instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PositionNotAvailable { .. }
                | Self::SourceFatal { .. }
                | Self::TableNotFound(_)
                | Self::Config(_)
        )
    }
}

/// Event decoding errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Rows event for a table with no cached schema; refresh and retry
    #[error("Unknown table {0}")]
    UnknownTable(TableRef),

    /// Event column count disagrees with the cached schema
    #[error("Schema drift on {table}: cached {cached} columns, event has {event}")]
    SchemaDrift {
        table: TableRef,
        cached: usize,
        event: usize,
    },

    /// Rows event referencing a table id with no preceding TABLE_MAP
    #[error("No table map for table id {0}")]
    MissingTableMap(u64),

    #[error("Truncated event: {0}")]
    Truncated(&'static str),

    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    Checksum { expected: u32, computed: u32 },

    /// Event shape this decoder does not handle
    #[error("Unsupported event: {0}")]
    Unsupported(String),
}

impl DecodeError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Sink flush errors.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Connectivity or contention; the batch may be retried
    #[error("Transient sink error: {0}")]
    Transient(String),

    /// The target refused the payload shape
    #[error("Sink rejected batch: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Any error the supervisor can observe.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Drift reappeared right after a schema refresh
    #[error("Persistent schema drift on {0} after refresh")]
    PersistentDrift(TableRef),

    /// Too many consecutive recovery attempts
    #[error("Giving up after {attempts} consecutive failures: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReplicatorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the supervisor should reconnect after this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connect(e) => !e.is_fatal(),
            Self::Decode(e) => !e.is_fatal(),
            Self::Sink(e) => e.is_retriable(),
            Self::Store(_)
            | Self::PersistentDrift(_)
            | Self::RetriesExhausted { .. }
            | Self::Config(_) => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) => ErrorCategory::Storage,
            Self::Connect(ConnectError::PositionNotAvailable { .. })
            | Self::Connect(ConnectError::SourceFatal { .. })
            | Self::Connect(ConnectError::Server { .. })
            | Self::Connect(ConnectError::Protocol(_)) => ErrorCategory::Replication,
            Self::Connect(ConnectError::TableNotFound(_))
            | Self::Connect(ConnectError::Metadata(_)) => ErrorCategory::Schema,
            Self::Connect(ConnectError::Config(_)) | Self::Config(_) => {
                ErrorCategory::Configuration
            }
            Self::Connect(_) => ErrorCategory::Network,
            Self::Decode(DecodeError::UnknownTable(_))
            | Self::Decode(DecodeError::SchemaDrift { .. })
            | Self::PersistentDrift(_) => ErrorCategory::Schema,
            Self::Decode(_) => ErrorCategory::Replication,
            Self::Sink(_) => ErrorCategory::Sink,
            Self::RetriesExhausted { .. } => ErrorCategory::Network,
        }
    }

    /// Stable short code for structured log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Store(StoreError::NoCheckpoint) => "NO_CHECKPOINT",
            Self::Store(StoreError::Regression { .. }) => "POSITION_REGRESSION",
            Self::Store(_) => "STORE_ERROR",
            Self::Connect(ConnectError::Io(_)) => "IO_ERROR",
            Self::Connect(ConnectError::Timeout(_)) => "TIMEOUT",
            Self::Connect(ConnectError::Auth(_)) => "AUTH_FAILED",
            Self::Connect(ConnectError::Protocol(_)) => "PROTOCOL_ERROR",
            Self::Connect(ConnectError::Server { .. }) => "SERVER_ERROR",
            Self::Connect(ConnectError::Disconnected) => "DISCONNECTED",
            Self::Connect(ConnectError::PositionNotAvailable { .. }) => "POSITION_NOT_AVAILABLE",
            Self::Connect(ConnectError::SourceFatal { .. }) => "SOURCE_FATAL",
            Self::Connect(ConnectError::TableNotFound(_)) => "TABLE_NOT_FOUND",
            Self::Connect(ConnectError::Metadata(_)) => "METADATA_ERROR",
            Self::Connect(ConnectError::Config(_)) | Self::Config(_) => "CONFIG_ERROR",
            Self::Decode(DecodeError::UnknownTable(_)) => "UNKNOWN_TABLE",
            Self::Decode(DecodeError::SchemaDrift { .. }) => "SCHEMA_DRIFT",
            Self::Decode(DecodeError::Checksum { .. }) => "CHECKSUM_MISMATCH",
            Self::Decode(DecodeError::Unsupported(_)) => "UNSUPPORTED_EVENT",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Sink(SinkError::Transient(_)) => "SINK_TRANSIENT",
            Self::Sink(SinkError::Rejected(_)) => "SINK_REJECTED",
            Self::PersistentDrift(_) => "PERSISTENT_SCHEMA_DRIFT",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef::new("shop", "orders")
    }

    #[test]
    fn test_error_display() {
        let err = DecodeError::SchemaDrift {
            table: table(),
            cached: 3,
            event: 4,
        };
        assert_eq!(
            err.to_string(),
            "Schema drift on shop.orders: cached 3 columns, event has 4"
        );

        let err = ConnectError::Server {
            code: 1045,
            message: "Access denied".into(),
        };
        assert_eq!(err.to_string(), "Server error 1045: Access denied");
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(ReplicatorError::from(ConnectError::Disconnected).is_retriable());
        assert!(ReplicatorError::from(ConnectError::timeout("read")).is_retriable());
        assert!(ReplicatorError::from(SinkError::transient("reset")).is_retriable());
        assert!(ReplicatorError::from(DecodeError::Truncated("row")).is_retriable());

        assert!(!ReplicatorError::from(ConnectError::PositionNotAvailable {
            position: "0-1-5".into(),
            message: "purged".into(),
        })
        .is_retriable());
        assert!(!ReplicatorError::from(SinkError::rejected("no such table")).is_retriable());
        assert!(!ReplicatorError::from(DecodeError::unsupported("partial image")).is_retriable());
        assert!(!ReplicatorError::PersistentDrift(table()).is_retriable());
        assert!(!ReplicatorError::from(StoreError::NoCheckpoint).is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            ReplicatorError::from(ConnectError::Disconnected).category(),
            ErrorCategory::Network
        );
        assert_eq!(
            ReplicatorError::from(DecodeError::UnknownTable(table())).category(),
            ErrorCategory::Schema
        );
        assert_eq!(
            ReplicatorError::from(SinkError::rejected("x")).category(),
            ErrorCategory::Sink
        );
        assert_eq!(
            ReplicatorError::from(StoreError::NoCheckpoint).category(),
            ErrorCategory::Storage
        );
        assert_eq!(
            ReplicatorError::config("bad").category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(
            ReplicatorError::from(ConnectError::PositionNotAvailable {
                position: "0-1-1".into(),
                message: String::new(),
            })
            .error_code(),
            "POSITION_NOT_AVAILABLE"
        );
        assert_eq!(
            ReplicatorError::from(SinkError::rejected("x")).error_code(),
            "SINK_REJECTED"
        );
        assert_eq!(
            ReplicatorError::PersistentDrift(table()).error_code(),
            "PERSISTENT_SCHEMA_DRIFT"
        );
        let fatal = ReplicatorError::from(ConnectError::SourceFatal {
            code: 1236,
            message: "event too big".into(),
        });
        assert_eq!(fatal.error_code(), "SOURCE_FATAL");
        assert_eq!(fatal.category(), ErrorCategory::Replication);
        assert!(!fatal.is_retriable());
    }
}
