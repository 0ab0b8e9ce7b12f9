//! Sink writers
//!
//! A [`SinkWriter`] applies one committed transaction atomically: after
//! `flush` returns `Ok` every record of the batch is durable downstream,
//! after an error none of it is visible.

mod columnstore;

pub use columnstore::{sql_value, ColumnStoreSink};

use crate::error::SinkError;
use crate::record::{Batch, RowChangeRecord};
use crate::schema::TableRef;
use async_trait::async_trait;
use parking_lot::Mutex;

#[async_trait]
pub trait SinkWriter: Send + Sync {
    async fn flush(&self, batch: &Batch) -> Result<(), SinkError>;

    /// DDL was seen for `table` on the source; `None` means any table.
    fn schema_changed(&self, _table: Option<&TableRef>) {}
}

/// In-memory sink keeping every flushed batch.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Batch>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    /// All flushed records in flush order.
    pub fn records(&self) -> Vec<RowChangeRecord> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

#[async_trait]
impl SinkWriter for MemorySink {
    async fn flush(&self, batch: &Batch) -> Result<(), SinkError> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}
