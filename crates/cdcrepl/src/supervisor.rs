//! # Replicator supervisor
//!
//! Owns the replication task: load the durable position, open the binlog
//! stream, decode, group rows per transaction, flush each committed
//! transaction to the sink and only then advance the stored position.
//!
//! ```text
//! Connecting ──open ok──▶ Streaming ──stream/decode/transient error──▶ Recovering
//!     ▲                                                                    │
//!     └─────────────────────────── backoff elapsed ◀──────────────────────┘
//!
//! fatal error / retries exhausted / stop()  ──▶  Stopped (terminal)
//! ```
//!
//! Delivery is at-least-once: after a failure the open transaction is
//! discarded and replayed from the last committed boundary.

use crate::config::ReplicatorConfig;
use crate::decoder::{BinlogDecoder, DecodedItem};
use crate::error::{DecodeError, ReplicatorError};
use crate::event::RawEvent;
use crate::filter::TableFilter;
use crate::health::{HealthSnapshot, ReplicatorState, SharedStatus};
use crate::mariadb::{BinlogSource, InformationSchemaFetcher, MariaDbSource};
use crate::position::{FilePositionStore, Gtid, PositionStore};
use crate::record::TransactionBuffer;
use crate::resilience::RetryConfig;
use crate::schema::{SchemaCache, SchemaFetcher, TableRef};
use crate::sink::{ColumnStoreSink, SinkWriter};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators the replication task drives.
#[derive(Clone)]
pub struct ReplicatorParts {
    pub store: Arc<dyn PositionStore>,
    pub source: Arc<dyn BinlogSource>,
    pub fetcher: Arc<dyn SchemaFetcher>,
    pub sink: Arc<dyn SinkWriter>,
}

/// Supervisor behaviour.
#[derive(Debug, Clone, Default)]
pub struct SupervisorSettings {
    /// Used when the store holds no checkpoint
    pub start_position: Option<Gtid>,
    pub retry: RetryConfig,
    pub filter: TableFilter,
}

impl SupervisorSettings {
    pub fn from_config(config: &ReplicatorConfig) -> Result<Self, ReplicatorError> {
        Ok(Self {
            start_position: config.source.gtid,
            retry: config.replicator.retry.clone(),
            filter: config.replicator.table_filter()?,
        })
    }

    pub fn with_start_position(mut self, gtid: Gtid) -> Self {
        self.start_position = Some(gtid);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_filter(mut self, filter: TableFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Handle to a running replicator.
pub struct Replicator {
    status: Arc<SharedStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("state", &self.state())
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

impl Replicator {
    /// Build the MariaDB/ColumnStore pipeline from configuration and start it.
    pub async fn start(config: &ReplicatorConfig) -> Result<Self, ReplicatorError> {
        config.validate()?;
        let settings = SupervisorSettings::from_config(config)?;
        let store = FilePositionStore::open(&config.state.dir).await?;
        let sink = ColumnStoreSink::new(&config.sink)?;

        let parts = ReplicatorParts {
            store: Arc::new(store),
            source: Arc::new(MariaDbSource::new(&config.source)),
            fetcher: Arc::new(InformationSchemaFetcher::new(&config.source)),
            sink: Arc::new(sink),
        };
        Ok(Self::spawn(parts, settings))
    }

    /// Start the replication task. Must be called within a tokio runtime.
    pub fn spawn(parts: ReplicatorParts, settings: SupervisorSettings) -> Self {
        let status = Arc::new(SharedStatus::new());
        let cancel = CancellationToken::new();
        let worker = Worker {
            parts,
            settings,
            status: Arc::clone(&status),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());
        Self {
            status,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Liveness: false once the replicator has stopped for any reason.
    pub fn ok(&self) -> bool {
        self.status.state().is_live()
            && self
                .task
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    pub fn state(&self) -> ReplicatorState {
        self.status.state()
    }

    /// Last durably committed position.
    pub fn position(&self) -> Option<Gtid> {
        self.status.position()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.status.snapshot()
    }

    /// Request a stop and wait for the task to finish. The open
    /// transaction is abandoned; an in-flight flush completes first.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Replication task failed");
                self.status.set_error(format!("replication task failed: {}", e));
            }
        }
        self.status.set_state(ReplicatorState::Stopped);
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    parts: ReplicatorParts,
    settings: SupervisorSettings,
    status: Arc<SharedStatus>,
    cancel: CancellationToken,
}

/// How a session ended without error.
enum SessionEnd {
    Cancelled,
}

impl Worker {
    async fn run(self) {
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.transition(ReplicatorState::Connecting);

            let mut advanced = false;
            let err = match self.session(&mut advanced).await {
                Ok(SessionEnd::Cancelled) => break,
                Err(e) => e,
            };
            if advanced {
                failures = 0;
            }

            if !err.is_retriable() {
                error!(
                    error = %err,
                    error_code = err.error_code(),
                    category = ?err.category(),
                    "Replication stopped on fatal error"
                );
                self.status.set_error(err.to_string());
                break;
            }

            if !self.settings.retry.should_retry(failures) {
                let err = ReplicatorError::RetriesExhausted {
                    attempts: failures + 1,
                    last: err.to_string(),
                };
                error!(error = %err, error_code = err.error_code(), "Replication stopped");
                self.status.set_error(err.to_string());
                break;
            }

            let delay = self.settings.retry.delay_for_attempt(failures);
            failures += 1;
            self.status.set_error(err.to_string());
            self.status.record_reconnect();
            self.transition(ReplicatorState::Recovering);
            warn!(
                error = %err,
                error_code = err.error_code(),
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Replication interrupted, reconnecting"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(ReplicatorState::Stopped);
        info!(position = ?self.status.position(), "Replicator stopped");
    }

    fn transition(&self, next: ReplicatorState) {
        let prev = self.status.set_state(next);
        if prev != next {
            info!(from = %prev, to = %next, "Replicator state");
        }
    }

    /// One connection: open, stream and commit until an error or a stop.
    async fn session(&self, advanced: &mut bool) -> Result<SessionEnd, ReplicatorError> {
        let position = self
            .parts
            .store
            .load_or(self.settings.start_position.as_ref())
            .await?;
        self.status.publish_position(position);

        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            opened = self.parts.source.open(&position) => opened?,
        };
        self.transition(ReplicatorState::Streaming);
        info!(gtid = %position, "Streaming from position");

        let mut decoder = BinlogDecoder::with_filter(self.settings.filter.clone());
        let mut schemas = SchemaCache::new();
        let mut buffer = TransactionBuffer::new();
        let mut committed = position;

        loop {
            let raw = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let dropped = buffer.discard();
                    if dropped > 0 {
                        debug!(rows = dropped, "Abandoned open transaction on stop");
                    }
                    return Ok(SessionEnd::Cancelled);
                }
                event = stream.next_event() => event?,
            };

            match self.decode(&mut decoder, &mut schemas, &raw).await? {
                DecodedItem::Begin { gtid, standalone } => {
                    let dropped = buffer.begin(gtid, standalone);
                    if dropped > 0 {
                        warn!(gtid = %gtid, rows = dropped, "Dropped unterminated event group");
                    }
                }
                DecodedItem::Rows(records) => {
                    if !buffer.is_open() {
                        return Err(
                            DecodeError::malformed("rows event outside an event group").into()
                        );
                    }
                    buffer.push(records);
                }
                DecodedItem::TransactionBoundary(end) => {
                    self.commit(&mut buffer, &mut committed, end, advanced)
                        .await?;
                }
                DecodedItem::SchemaChange { table, commit } => {
                    match &table {
                        Some(t) => info!(table = %t, "Schema change, cached layout dropped"),
                        None => info!("Schema change, schema cache cleared"),
                    }
                    self.parts.sink.schema_changed(table.as_ref());
                    if let Some(end) = commit {
                        self.commit(&mut buffer, &mut committed, end, advanced)
                            .await?;
                    }
                }
                DecodedItem::Rollback => {
                    let dropped = buffer.discard();
                    debug!(rows = dropped, "Transaction rolled back");
                }
                DecodedItem::Heartbeat | DecodedItem::Ignored => {}
            }
        }
    }

    /// Decode, fetching the table layout when it is unknown or has drifted.
    /// A second drift on the same table right after a refresh is fatal.
    async fn decode(
        &self,
        decoder: &mut BinlogDecoder,
        schemas: &mut SchemaCache,
        raw: &RawEvent,
    ) -> Result<DecodedItem, ReplicatorError> {
        let mut refreshed: Option<TableRef> = None;
        loop {
            match decoder.decode(raw, schemas) {
                Ok(item) => return Ok(item),
                Err(DecodeError::UnknownTable(table)) => {
                    if refreshed.as_ref() == Some(&table) {
                        return Err(DecodeError::UnknownTable(table).into());
                    }
                    debug!(table = %table, "Fetching table schema");
                    self.refresh(schemas, &table).await?;
                    refreshed = Some(table);
                }
                Err(DecodeError::SchemaDrift {
                    table,
                    cached,
                    event,
                }) => {
                    if refreshed.as_ref() == Some(&table) {
                        return Err(ReplicatorError::PersistentDrift(table));
                    }
                    warn!(table = %table, cached, event, "Schema drift, refreshing");
                    self.refresh(schemas, &table).await?;
                    refreshed = Some(table);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn refresh(
        &self,
        schemas: &mut SchemaCache,
        table: &TableRef,
    ) -> Result<(), ReplicatorError> {
        let schema = self.parts.fetcher.fetch(table).await?;
        self.status.record_schema_refresh();
        schemas.put(table.clone(), schema);
        Ok(())
    }

    /// Flush the finished group, then persist and publish its position.
    async fn commit(
        &self,
        buffer: &mut TransactionBuffer,
        committed: &mut Gtid,
        end: Gtid,
        advanced: &mut bool,
    ) -> Result<(), ReplicatorError> {
        let batch = buffer.finish(Some(*committed), end);
        if *committed == end || committed.dominates(&end) {
            debug!(gtid = %end, "Skipping already committed transaction");
            return Ok(());
        }

        if !batch.is_empty() {
            self.parts.sink.flush(&batch).await?;
        }
        self.parts.store.save(&end).await?;

        *committed = end;
        *advanced = true;
        self.status.record_commit(batch.len());
        self.status.publish_position(end);
        debug!(gtid = %end, rows = batch.len(), "Transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
source:
  servers: [{ host: 127.0.0.1, port: 3000, user: maxuser, password: maxpwd }]
  server_id: 1234
  gtid: "0-3000-7"
sink:
  host: 127.0.0.1
  user: maxuser
  bulk_metadata: ./Columnstore.xml
state:
  dir: ./state
replicator:
  retry: { max_retries: 3 }
  exclude_tables: ["mysql.*"]
"#;

    #[test]
    fn test_settings_from_config() {
        let config = ReplicatorConfig::from_yaml(CONFIG).unwrap();
        let settings = SupervisorSettings::from_config(&config).unwrap();
        assert_eq!(settings.start_position, Some(Gtid::new(0, 3000, 7)));
        assert_eq!(settings.retry.max_retries(), 3);
        assert!(!settings.filter.accepts("mysql", "user"));

        let settings = settings.with_start_position(Gtid::new(1, 1, 1));
        assert_eq!(settings.start_position, Some(Gtid::new(1, 1, 1)));
    }

    #[tokio::test]
    async fn test_start_fails_without_bulk_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = CONFIG.replace("./state", &dir.path().join("state").display().to_string());
        let config = ReplicatorConfig::from_yaml(&yaml).unwrap();
        let err = Replicator::start(&config).await.unwrap_err();
        assert_eq!(err.error_code(), "SINK_REJECTED");
    }
}
