//! Shared fixtures for replicator integration tests: binlog event builders,
//! a scripted binlog source, a static schema fetcher and a sink with fault
//! injection.

#![allow(dead_code)]

use async_trait::async_trait;
use cdcrepl::decoder::value::ColumnType;
use cdcrepl::event::{event_type, EventHeader};
use cdcrepl::{
    Batch, BinlogSource, ColumnSchema, ConnectError, EventStream, Gtid, PositionStore, RawEvent,
    SchemaFetcher, SinkError, SinkWriter, StoreError, TableRef, TableSchema,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const SERVER_ID: u32 = 3000;
pub const FL_STANDALONE: u8 = 0x01;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cdcrepl=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn gtid(seq: u64) -> Gtid {
    Gtid::new(0, SERVER_ID, seq)
}

/// Poll `cond` every 10ms until it holds or five seconds pass.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Event builders
// ============================================================================

fn event(type_code: u8, body: &[u8]) -> RawEvent {
    let mut data = vec![0u8; EventHeader::SIZE];
    data[4] = type_code;
    data[5..9].copy_from_slice(&SERVER_ID.to_le_bytes());
    data[9..13].copy_from_slice(&((EventHeader::SIZE + body.len()) as u32).to_le_bytes());
    data.extend_from_slice(body);
    RawEvent::new(data)
}

pub fn gtid_event(seq: u64, flags: u8) -> RawEvent {
    let mut body = seq.to_le_bytes().to_vec();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(flags);
    body.extend_from_slice(&[0u8; 6]);
    event(event_type::MARIADB_GTID, &body)
}

pub fn xid_event() -> RawEvent {
    event(event_type::XID, &1u64.to_le_bytes())
}

pub fn heartbeat_event() -> RawEvent {
    event(event_type::HEARTBEAT, b"mysql-bin.000001")
}

pub fn query_event(db: &str, sql: &str) -> RawEvent {
    let mut body = Vec::new();
    body.extend_from_slice(&7u32.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(db.len() as u8);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(db.as_bytes());
    body.push(0);
    body.extend_from_slice(sql.as_bytes());
    event(event_type::QUERY, &body)
}

/// Table map for a table of `columns` INT columns.
pub fn table_map_event(table_id: u64, db: &str, table: &str, columns: usize) -> RawEvent {
    let mut body = table_id.to_le_bytes()[..6].to_vec();
    body.extend_from_slice(&0u16.to_le_bytes());
    for name in [db, table] {
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        body.push(0);
    }
    body.push(columns as u8);
    body.extend(std::iter::repeat(ColumnType::Long as u8).take(columns));
    body.push(0);
    body.extend(std::iter::repeat(0xFFu8).take(columns.div_ceil(8)));
    event(event_type::TABLE_MAP, &body)
}

fn rows_header(table_id: u64, columns: usize, images: usize) -> Vec<u8> {
    let mut body = table_id.to_le_bytes()[..6].to_vec();
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    body.push(columns as u8);
    for _ in 0..images {
        body.extend(std::iter::repeat(0xFFu8).take(columns.div_ceil(8)));
    }
    body
}

fn push_image(body: &mut Vec<u8>, row: &[i32]) {
    body.extend(std::iter::repeat(0u8).take(row.len().div_ceil(8)));
    for v in row {
        body.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn write_rows_event(table_id: u64, rows: &[&[i32]]) -> RawEvent {
    let columns = rows.first().map_or(0, |r| r.len());
    let mut body = rows_header(table_id, columns, 1);
    for row in rows {
        push_image(&mut body, row);
    }
    event(event_type::WRITE_ROWS_V2, &body)
}

pub fn update_rows_event(table_id: u64, rows: &[(&[i32], &[i32])]) -> RawEvent {
    let columns = rows.first().map_or(0, |(b, _)| b.len());
    let mut body = rows_header(table_id, columns, 2);
    for (before, after) in rows {
        push_image(&mut body, before);
        push_image(&mut body, after);
    }
    event(event_type::UPDATE_ROWS_V2, &body)
}

pub fn delete_rows_event(table_id: u64, rows: &[&[i32]]) -> RawEvent {
    let columns = rows.first().map_or(0, |r| r.len());
    let mut body = rows_header(table_id, columns, 1);
    for row in rows {
        push_image(&mut body, row);
    }
    event(event_type::DELETE_ROWS_V2, &body)
}

/// A complete transaction inserting `rows` into `db.table` (table id 42).
pub fn insert_transaction(seq: u64, db: &str, table: &str, rows: &[&[i32]]) -> Vec<Step> {
    let columns = rows.first().map_or(1, |r| r.len());
    vec![
        Step::Event(gtid_event(seq, 0)),
        Step::Event(query_event(db, "BEGIN")),
        Step::Event(table_map_event(42, db, table, columns)),
        Step::Event(write_rows_event(42, rows)),
        Step::Event(xid_event()),
    ]
}

pub fn int_schema(db: &str, table: &str, columns: usize) -> TableSchema {
    TableSchema::new(
        TableRef::new(db, table),
        (0..columns)
            .map(|i| ColumnSchema::new(format!("c{i}"), "int"))
            .collect(),
    )
}

// ============================================================================
// Scripted source
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Disconnect,
    PositionGone,
}

impl Failure {
    fn error(self, position: &Gtid) -> ConnectError {
        match self {
            Self::Disconnect => ConnectError::Disconnected,
            Self::PositionGone => ConnectError::PositionNotAvailable {
                position: position.to_string(),
                message: "Could not find GTID state requested by slave".into(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Event(RawEvent),
    Fail(Failure),
}

#[derive(Debug, Clone)]
pub enum Session {
    Stream(Vec<Step>),
    Refuse(Failure),
}

/// Plays one scripted session per `open`. Once the script is used up, opens
/// succeed with a stream that never yields.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    sessions: Mutex<VecDeque<Session>>,
    opens: Mutex<Vec<Gtid>>,
}

impl ScriptedSource {
    pub fn new(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            opens: Mutex::new(Vec::new()),
        })
    }

    /// Positions passed to every `open`, in order.
    pub fn opens(&self) -> Vec<Gtid> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl BinlogSource for ScriptedSource {
    async fn open(&self, position: &Gtid) -> Result<Box<dyn EventStream>, ConnectError> {
        self.opens.lock().push(*position);
        let session = self.sessions.lock().pop_front();
        match session {
            Some(Session::Refuse(failure)) => Err(failure.error(position)),
            Some(Session::Stream(steps)) => Ok(Box::new(ScriptedStream {
                steps: steps.into(),
                position: *position,
            })),
            None => Ok(Box::new(ScriptedStream {
                steps: VecDeque::new(),
                position: *position,
            })),
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    position: Gtid,
}

#[async_trait]
impl EventStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<RawEvent, ConnectError> {
        match self.steps.pop_front() {
            Some(Step::Event(event)) => Ok(event),
            Some(Step::Fail(failure)) => Err(failure.error(&self.position)),
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Schema fetcher
// ============================================================================

#[derive(Debug, Default)]
pub struct StaticFetcher {
    schemas: Mutex<HashMap<TableRef, TableSchema>>,
    queued: Mutex<VecDeque<TableSchema>>,
    fetches: Mutex<Vec<TableRef>>,
}

impl StaticFetcher {
    pub fn with(schemas: Vec<TableSchema>) -> Arc<Self> {
        let fetcher = Self::default();
        for schema in schemas {
            fetcher.set(schema);
        }
        Arc::new(fetcher)
    }

    pub fn set(&self, schema: TableSchema) {
        self.schemas.lock().insert(schema.table.clone(), schema);
    }

    /// Answer the next fetch of this table with `schema`, then fall back to
    /// the static layout.
    pub fn queue(&self, schema: TableSchema) {
        self.queued.lock().push_back(schema);
    }

    pub fn fetches(&self) -> Vec<TableRef> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl SchemaFetcher for StaticFetcher {
    async fn fetch(&self, table: &TableRef) -> Result<TableSchema, ConnectError> {
        self.fetches.lock().push(table.clone());
        let mut queued = self.queued.lock();
        if let Some(idx) = queued.iter().position(|s| &s.table == table) {
            if let Some(schema) = queued.remove(idx) {
                return Ok(schema);
            }
        }
        drop(queued);
        self.schemas
            .lock()
            .get(table)
            .cloned()
            .ok_or_else(|| ConnectError::TableNotFound(table.clone()))
    }
}

// ============================================================================
// Sink and store sharing one journal
// ============================================================================

/// Ordered log of sink flushes and position saves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Flush(Gtid),
    /// Some rows of the batch were written before the flush failed
    PartialFlush { end: Gtid, written: usize },
    Save(Gtid),
}

pub type Journal = Arc<Mutex<Vec<Entry>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFault {
    Transient,
    Rejected,
    /// Writes the first row, then loses the connection
    Partial,
}

/// Sink that records batches and fails on demand.
#[derive(Debug)]
pub struct FaultySink {
    journal: Journal,
    batches: Mutex<Vec<Batch>>,
    faults: Mutex<VecDeque<SinkFault>>,
    schema_changes: Mutex<Vec<Option<TableRef>>>,
}

impl FaultySink {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            batches: Mutex::new(Vec::new()),
            faults: Mutex::new(VecDeque::new()),
            schema_changes: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next flush calls, one fault per call.
    pub fn fail_next(&self, faults: &[SinkFault]) {
        self.faults.lock().extend(faults.iter().copied());
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub fn ends(&self) -> Vec<Gtid> {
        self.batches.lock().iter().map(|b| b.end).collect()
    }

    pub fn schema_changes(&self) -> Vec<Option<TableRef>> {
        self.schema_changes.lock().clone()
    }
}

#[async_trait]
impl SinkWriter for FaultySink {
    async fn flush(&self, batch: &Batch) -> Result<(), SinkError> {
        let fault = self.faults.lock().pop_front();
        match fault {
            Some(SinkFault::Transient) => Err(SinkError::transient("connection reset")),
            Some(SinkFault::Rejected) => Err(SinkError::rejected("Unknown column 'c9'")),
            Some(SinkFault::Partial) => {
                self.journal.lock().push(Entry::PartialFlush {
                    end: batch.end,
                    written: batch.records.len().min(1),
                });
                Err(SinkError::transient("lost connection during COMMIT"))
            }
            None => {
                self.batches.lock().push(batch.clone());
                self.journal.lock().push(Entry::Flush(batch.end));
                Ok(())
            }
        }
    }

    fn schema_changed(&self, table: Option<&TableRef>) {
        self.schema_changes.lock().push(table.cloned());
    }
}

/// In-memory position store writing to the journal.
#[derive(Debug)]
pub struct JournalStore {
    journal: Journal,
    current: Mutex<Option<Gtid>>,
}

impl JournalStore {
    pub fn new(journal: Journal, initial: Option<Gtid>) -> Arc<Self> {
        Arc::new(Self {
            journal,
            current: Mutex::new(initial),
        })
    }

    pub fn current(&self) -> Option<Gtid> {
        *self.current.lock()
    }
}

#[async_trait]
impl PositionStore for JournalStore {
    async fn load(&self) -> Result<Option<Gtid>, StoreError> {
        Ok(*self.current.lock())
    }

    async fn save(&self, position: &Gtid) -> Result<(), StoreError> {
        let mut current = self.current.lock();
        if let Some(stored) = *current {
            if stored.dominates(position) {
                return Err(StoreError::Regression {
                    stored,
                    attempted: *position,
                });
            }
        }
        *current = Some(*position);
        self.journal.lock().push(Entry::Save(*position));
        Ok(())
    }
}
