//! # cdcrepl - MariaDB to ColumnStore change data capture
//!
//! Attaches to a MariaDB server as a GTID replica, decodes row events
//! against cached table layouts and applies every committed transaction to a
//! ColumnStore target in one sink transaction. The durable position only
//! moves after the sink acknowledged the transaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  RawEvent  ┌──────────────┐  Batch   ┌──────────────┐
//! │ MariaDbSource│──────────▶│BinlogDecoder │────────▶│ SinkWriter   │
//! │ (binlog dump)│            │ + SchemaCache│          │ (ColumnStore)│
//! └──────────────┘            └──────┬───────┘          └──────┬───────┘
//!                                    │ unknown / drifted        │ ack
//!                                    ▼                          ▼
//!                             ┌──────────────┐          ┌──────────────┐
//!                             │SchemaFetcher │          │PositionStore │
//!                             └──────────────┘          └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cdcrepl::{ReplicatorConfig, Replicator};
//! use std::time::Duration;
//!
//! # async fn example() -> cdcrepl::Result<()> {
//! let config = ReplicatorConfig::from_file("cdcrepl.yaml")?;
//! let replicator = Replicator::start(&config).await?;
//!
//! while replicator.ok() {
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//! }
//! replicator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod filter;
pub mod health;
pub mod mariadb;
pub mod position;
pub mod record;
pub mod resilience;
pub mod schema;
pub mod sink;
pub mod supervisor;

pub use config::{
    ReplicatorConfig, ReplicatorSettings, SensitiveString, ServerEndpoint, SinkConfig,
    SourceConfig, StateConfig,
};
pub use decoder::value::{ColumnType, ColumnValue};
pub use decoder::{BinlogDecoder, DecodedItem};
pub use error::{
    ConnectError, DecodeError, ErrorCategory, ReplicatorError, Result, SinkError, StoreError,
};
pub use event::{EventKind, RawEvent};
pub use filter::TableFilter;
pub use health::{HealthSnapshot, ReplicatorState};
pub use mariadb::{BinlogSource, EventStream, InformationSchemaFetcher, MariaDbSource};
pub use position::{FilePositionStore, Gtid, MemoryPositionStore, PositionStore};
pub use record::{Batch, ChangeKind, RowChangeRecord, TransactionBuffer};
pub use resilience::RetryConfig;
pub use schema::{ColumnSchema, SchemaCache, SchemaFetcher, TableRef, TableSchema};
pub use sink::{ColumnStoreSink, MemorySink, SinkWriter};
pub use supervisor::{Replicator, ReplicatorParts, SupervisorSettings};
