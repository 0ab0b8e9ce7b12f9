//! Raw binlog events as they come off the replication stream

use bytes::Bytes;

/// Binlog event type codes the replicator cares about.
pub mod event_type {
    pub const QUERY: u8 = 2;
    pub const ROTATE: u8 = 4;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const TABLE_MAP: u8 = 19;
    pub const WRITE_ROWS_V1: u8 = 23;
    pub const UPDATE_ROWS_V1: u8 = 24;
    pub const DELETE_ROWS_V1: u8 = 25;
    pub const HEARTBEAT: u8 = 27;
    pub const WRITE_ROWS_V2: u8 = 30;
    pub const UPDATE_ROWS_V2: u8 = 31;
    pub const DELETE_ROWS_V2: u8 = 32;
    pub const ANNOTATE_ROWS: u8 = 160;
    pub const BINLOG_CHECKPOINT: u8 = 161;
    pub const MARIADB_GTID: u8 = 162;
    pub const GTID_LIST: u8 = 163;
    pub const START_ENCRYPTION: u8 = 164;
    pub const QUERY_COMPRESSED: u8 = 165;
    pub const WRITE_ROWS_COMPRESSED_V1: u8 = 166;
    pub const DELETE_ROWS_COMPRESSED: u8 = 171;
}

/// Type tag of a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RowInsert,
    RowUpdate,
    RowDelete,
    /// MariaDB GTID event opening an event group
    TransactionBegin,
    /// XID event closing a transactional group
    TransactionCommit,
    /// QUERY event: BEGIN/COMMIT/ROLLBACK or a DDL statement
    Statement,
    TableMap,
    Heartbeat,
    FormatDescription,
    Rotate,
    Other(u8),
}

impl EventKind {
    pub fn from_type_code(code: u8) -> Self {
        use event_type::*;
        match code {
            WRITE_ROWS_V1 | WRITE_ROWS_V2 => Self::RowInsert,
            UPDATE_ROWS_V1 | UPDATE_ROWS_V2 => Self::RowUpdate,
            DELETE_ROWS_V1 | DELETE_ROWS_V2 => Self::RowDelete,
            MARIADB_GTID => Self::TransactionBegin,
            XID => Self::TransactionCommit,
            QUERY => Self::Statement,
            TABLE_MAP => Self::TableMap,
            HEARTBEAT => Self::Heartbeat,
            FORMAT_DESCRIPTION => Self::FormatDescription,
            ROTATE => Self::Rotate,
            other => Self::Other(other),
        }
    }
}

/// Common 19-byte binlog event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub type_code: u8,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Some(Self {
            timestamp: u32_at(0),
            type_code: data[4],
            server_id: u32_at(5),
            event_length: u32_at(9),
            next_position: u32_at(13),
            flags: u16::from_le_bytes([data[17], data[18]]),
        })
    }
}

/// One complete binlog event: header, body and optional CRC32 trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub data: Bytes,
}

impl RawEvent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let kind = data
            .get(4)
            .map(|code| EventKind::from_type_code(*code))
            .unwrap_or(EventKind::Other(0));
        Self { kind, data }
    }

    pub fn header(&self) -> Option<EventHeader> {
        EventHeader::parse(&self.data)
    }
}
