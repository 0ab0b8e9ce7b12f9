//! MariaDB source: replication client, binlog stream and table metadata.

mod metadata;
pub mod protocol;
mod stream;

pub(crate) use metadata::opts_for;
pub use metadata::InformationSchemaFetcher;
pub use protocol::{HandshakePacket, MariaDbClient};
pub use stream::{BinlogSource, EventStream, MariaDbEventStream, MariaDbSource};
