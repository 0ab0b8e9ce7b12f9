//! ColumnStore sink over the SQL endpoint
//!
//! Each batch runs in one transaction: inserts become `INSERT`, updates and
//! deletes match the old row image with null-safe equality (`<=>`). Any
//! failure rolls the transaction back.
//!
//! Target column names are cached per table. The cache entry is dropped on
//! source DDL and refetched once when a row no longer fits the cached layout.

use super::SinkWriter;
use crate::config::{ServerEndpoint, SinkConfig};
use crate::decoder::value::ColumnValue;
use crate::error::SinkError;
use crate::mariadb::opts_for;
use crate::record::{Batch, ChangeKind, RowChangeRecord};
use crate::schema::TableRef;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const COLUMNS_QUERY: &str = "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION";

/// Server error codes meaning the target refused the data itself.
const REJECTED_CODES: &[u16] = &[
    1048, // column cannot be null
    1054, // unknown column
    1136, // column count doesn't match
    1146, // table doesn't exist
    1264, // out of range
    1366, // incorrect value
    1406, // data too long
];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes batches to MariaDB ColumnStore.
pub struct ColumnStoreSink {
    endpoint: ServerEndpoint,
    database: Option<String>,
    bulk_metadata: PathBuf,
    timeout: Duration,
    conn: Mutex<Option<Conn>>,
    columns: ColumnCache,
}

/// Target column names per table.
#[derive(Debug, Default)]
struct ColumnCache {
    tables: parking_lot::Mutex<HashMap<TableRef, Vec<String>>>,
}

impl ColumnCache {
    fn get(&self, table: &TableRef) -> Option<Vec<String>> {
        self.tables.lock().get(table).cloned()
    }

    fn insert(&self, table: TableRef, columns: Vec<String>) {
        self.tables.lock().insert(table, columns);
    }

    fn evict(&self, table: &TableRef) -> bool {
        self.tables.lock().remove(table).is_some()
    }

    fn clear(&self) {
        self.tables.lock().clear();
    }
}

/// Whether a row image of `record` has a different width than `columns`.
fn layout_differs(columns: &[String], record: &RowChangeRecord) -> bool {
    [record.before.as_ref(), record.after.as_ref()]
        .into_iter()
        .flatten()
        .any(|image| image.len() != columns.len())
}

impl std::fmt::Debug for ColumnStoreSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnStoreSink")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("bulk_metadata", &self.bulk_metadata)
            .finish_non_exhaustive()
    }
}

/// The bulk-load descriptor must be a readable, non-empty file.
pub(crate) fn check_bulk_metadata(path: &Path) -> Result<(), SinkError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        SinkError::rejected(format!(
            "bulk metadata {} not accessible: {}",
            path.display(),
            e
        ))
    })?;
    if !meta.is_file() {
        return Err(SinkError::rejected(format!(
            "bulk metadata {} is not a file",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(SinkError::rejected(format!(
            "bulk metadata {} is empty",
            path.display()
        )));
    }
    std::fs::File::open(path).map_err(|e| {
        SinkError::rejected(format!(
            "bulk metadata {} not readable: {}",
            path.display(),
            e
        ))
    })?;
    Ok(())
}

impl ColumnStoreSink {
    /// Validate the bulk metadata descriptor; the connection is made lazily.
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        check_bulk_metadata(&config.bulk_metadata)?;
        Ok(Self {
            endpoint: config.endpoint(),
            database: config.database.clone(),
            bulk_metadata: config.bulk_metadata.clone(),
            timeout: DEFAULT_TIMEOUT,
            conn: Mutex::new(None),
            columns: ColumnCache::default(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn target(&self, table: &TableRef) -> TableRef {
        match &self.database {
            Some(db) => TableRef::new(db.clone(), table.table.clone()),
            None => table.clone(),
        }
    }

    async fn connect(&self) -> Result<Conn, SinkError> {
        let mut conn = timeout(self.timeout, Conn::new(opts_for(&self.endpoint, None)))
            .await
            .map_err(|_| SinkError::transient(format!("connecting to {} timed out", self.endpoint)))?
            .map_err(classify)?;
        conn.query_drop("SET time_zone = '+00:00'")
            .await
            .map_err(classify)?;
        info!(endpoint = %self.endpoint, "Connected to ColumnStore");
        Ok(conn)
    }

    async fn target_columns(
        &self,
        conn: &mut Conn,
        table: &TableRef,
    ) -> Result<Vec<String>, SinkError> {
        if let Some(columns) = self.columns.get(table) {
            return Ok(columns);
        }
        let columns: Vec<String> = conn
            .exec(COLUMNS_QUERY, (table.database.clone(), table.table.clone()))
            .await
            .map_err(classify)?;
        if columns.is_empty() {
            return Err(SinkError::rejected(format!(
                "target table {} does not exist",
                table
            )));
        }
        self.columns.insert(table.clone(), columns.clone());
        Ok(columns)
    }

    async fn apply(&self, conn: &mut Conn, batch: &Batch) -> Result<(), SinkError> {
        conn.query_drop("START TRANSACTION")
            .await
            .map_err(classify)?;
        for record in &batch.records {
            let target = self.target(&record.table);
            let mut columns = self.target_columns(conn, &target).await?;
            if layout_differs(&columns, record) {
                debug!(table = %target, cached = columns.len(), "Target layout changed, refetching");
                self.columns.evict(&target);
                columns = self.target_columns(conn, &target).await?;
            }
            let (sql, params) = build_statement(&target, &columns, record)?;
            conn.exec_drop(sql, params).await.map_err(|e| {
                let err = classify(e);
                if !err.is_retriable() {
                    // layout may have changed under us
                    self.columns.evict(&target);
                }
                err
            })?;
        }
        conn.query_drop("COMMIT").await.map_err(classify)
    }
}

#[async_trait]
impl SinkWriter for ColumnStoreSink {
    async fn flush(&self, batch: &Batch) -> Result<(), SinkError> {
        let started = Instant::now();
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let result = match timeout(self.timeout, self.apply(&mut conn, batch)).await {
            Ok(result) => result,
            Err(_) => {
                // mid-statement; dropping the connection aborts the transaction
                return Err(SinkError::transient(format!(
                    "batch ending at {} timed out",
                    batch.end
                )));
            }
        };

        match result {
            Ok(()) => {
                *guard = Some(conn);
                debug!(
                    gtid = %batch.end,
                    rows = batch.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Batch committed to ColumnStore"
                );
                Ok(())
            }
            Err(e) => {
                match conn.query_drop("ROLLBACK").await {
                    Ok(()) => *guard = Some(conn),
                    Err(rb) => warn!(error = %rb, "Rollback failed, dropping connection"),
                }
                Err(e)
            }
        }
    }

    fn schema_changed(&self, table: Option<&TableRef>) {
        match table {
            Some(table) => {
                let target = self.target(table);
                if self.columns.evict(&target) {
                    debug!(table = %target, "Dropped cached target columns");
                }
            }
            None => self.columns.clear(),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.database), quote_ident(&table.table))
}

fn image<'a>(
    record: &'a RowChangeRecord,
    image: Option<&'a Vec<ColumnValue>>,
    columns: &[String],
    which: &str,
) -> Result<&'a [ColumnValue], SinkError> {
    let values = image.ok_or_else(|| {
        SinkError::rejected(format!(
            "{} on {} has no {} image",
            record.kind, record.table, which
        ))
    })?;
    if values.len() != columns.len() {
        return Err(SinkError::rejected(format!(
            "column count mismatch on {}: row has {}, target has {}",
            record.table,
            values.len(),
            columns.len()
        )));
    }
    Ok(values)
}

fn match_clause(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} <=> ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// SQL and positional parameters for one record.
pub(crate) fn build_statement(
    target: &TableRef,
    columns: &[String],
    record: &RowChangeRecord,
) -> Result<(String, Vec<Value>), SinkError> {
    let table = qualified(target);
    match record.kind {
        ChangeKind::Insert => {
            let after = image(record, record.after.as_ref(), columns, "after")?;
            let names = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let marks = vec!["?"; columns.len()].join(", ");
            Ok((
                format!("INSERT INTO {} ({}) VALUES ({})", table, names, marks),
                after.iter().map(sql_value).collect(),
            ))
        }
        ChangeKind::Update => {
            let before = image(record, record.before.as_ref(), columns, "before")?;
            let after = image(record, record.after.as_ref(), columns, "after")?;
            let set = columns
                .iter()
                .map(|c| format!("{} = ?", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let params = after.iter().chain(before.iter()).map(sql_value).collect();
            Ok((
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    table,
                    set,
                    match_clause(columns)
                ),
                params,
            ))
        }
        ChangeKind::Delete => {
            let before = image(record, record.before.as_ref(), columns, "before")?;
            Ok((
                format!("DELETE FROM {} WHERE {}", table, match_clause(columns)),
                before.iter().map(sql_value).collect(),
            ))
        }
    }
}

/// Convert a decoded value to a statement parameter.
pub fn sql_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::NULL,
        ColumnValue::SignedInt(v) => Value::Int(*v),
        ColumnValue::UnsignedInt(v) => Value::UInt(*v),
        ColumnValue::Float(v) => Value::Float(*v),
        ColumnValue::Double(v) => Value::Double(*v),
        ColumnValue::Decimal(s) | ColumnValue::String(s) => Value::Bytes(s.as_bytes().to_vec()),
        ColumnValue::Bytes(b) | ColumnValue::Bit(b) => Value::Bytes(b.clone()),
        ColumnValue::Date { year, month, day } => Value::Date(*year, *month, *day, 0, 0, 0, 0),
        ColumnValue::Time {
            negative,
            hours,
            minutes,
            seconds,
            micros,
        } => Value::Time(
            *negative,
            u32::from(*hours / 24),
            (*hours % 24) as u8,
            *minutes,
            *seconds,
            *micros,
        ),
        ColumnValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        } => Value::Date(*year, *month, *day, *hour, *minute, *second, *micros),
        // rendered in UTC; the session time zone is UTC as well
        ColumnValue::Timestamp { .. } => Value::Bytes(value.to_string().into_bytes()),
        ColumnValue::Year(y) => Value::UInt(u64::from(*y)),
        ColumnValue::Enum(i) => Value::UInt(u64::from(*i)),
        ColumnValue::Set(bits) => Value::UInt(*bits),
    }
}

pub(crate) fn classify_server_code(code: u16, message: &str) -> SinkError {
    if REJECTED_CODES.contains(&code) {
        SinkError::rejected(format!("{}: {}", code, message))
    } else {
        // deadlocks (1213), lock wait timeouts (1205) and engine hiccups
        SinkError::transient(format!("{}: {}", code, message))
    }
}

fn classify(err: mysql_async::Error) -> SinkError {
    match err {
        mysql_async::Error::Server(e) => classify_server_code(e.code, &e.message),
        mysql_async::Error::Url(e) => SinkError::rejected(format!("invalid sink address: {}", e)),
        other => SinkError::transient(other.to_string()),
    }
}
