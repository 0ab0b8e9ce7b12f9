//! Row change records and transaction batches

use crate::decoder::value::ColumnValue;
use crate::position::Gtid;
use crate::schema::TableRef;
use std::fmt;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// One decoded row change. Images are aligned to the table's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChangeRecord {
    pub table: TableRef,
    pub kind: ChangeKind,
    /// Present for updates and deletes
    pub before: Option<Vec<ColumnValue>>,
    /// Present for inserts and updates
    pub after: Option<Vec<ColumnValue>>,
}

impl RowChangeRecord {
    pub fn insert(table: TableRef, after: Vec<ColumnValue>) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(table: TableRef, before: Vec<ColumnValue>, after: Vec<ColumnValue>) -> Self {
        Self {
            table,
            kind: ChangeKind::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(table: TableRef, before: Vec<ColumnValue>) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            before: Some(before),
            after: None,
        }
    }
}

/// Records of one committed transaction, flushed atomically.
///
/// Covers the positions `(after, end]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub after: Option<Gtid>,
    pub end: Gtid,
    pub records: Vec<RowChangeRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Accumulates the records of the open transaction.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    open: Option<OpenTransaction>,
    records: Vec<RowChangeRecord>,
}

#[derive(Debug, Clone, Copy)]
struct OpenTransaction {
    gtid: Gtid,
    standalone: bool,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a group. Anything left from an unterminated group is dropped.
    pub fn begin(&mut self, gtid: Gtid, standalone: bool) -> usize {
        let dropped = self.discard();
        self.open = Some(OpenTransaction { gtid, standalone });
        dropped
    }

    pub fn push(&mut self, records: impl IntoIterator<Item = RowChangeRecord>) {
        self.records.extend(records);
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_gtid(&self) -> Option<Gtid> {
        self.open.map(|t| t.gtid)
    }

    pub fn is_standalone(&self) -> bool {
        self.open.is_some_and(|t| t.standalone)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Close the group as a batch ending at `end`, starting after `after`.
    pub fn finish(&mut self, after: Option<Gtid>, end: Gtid) -> Batch {
        self.open = None;
        Batch {
            after,
            end,
            records: std::mem::take(&mut self.records),
        }
    }

    /// Drop the open group, returning how many records were abandoned.
    pub fn discard(&mut self) -> usize {
        self.open = None;
        let n = self.records.len();
        self.records.clear();
        n
    }
}
