//! Table layouts from `INFORMATION_SCHEMA.COLUMNS`

use crate::config::{ServerEndpoint, SourceConfig};
use crate::error::ConnectError;
use crate::schema::{ColumnSchema, SchemaFetcher, TableRef, TableSchema};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

const COLUMNS_QUERY: &str = "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE \
     FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

pub(crate) fn opts_for(server: &ServerEndpoint, database: Option<&str>) -> OptsBuilder {
    let password = server.password.expose_secret();
    OptsBuilder::default()
        .ip_or_hostname(server.host.clone())
        .tcp_port(server.port)
        .user(Some(server.user.clone()))
        .pass((!password.is_empty()).then(|| password.to_string()))
        .db_name(database.map(str::to_string))
}

/// Fetches schemas from the first reachable source server, keeping one
/// connection open between calls.
pub struct InformationSchemaFetcher {
    servers: Vec<ServerEndpoint>,
    timeout: Duration,
    conn: Mutex<Option<Conn>>,
}

impl std::fmt::Debug for InformationSchemaFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InformationSchemaFetcher")
            .field("servers", &self.servers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl InformationSchemaFetcher {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            timeout: config.connect_timeout(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Conn, ConnectError> {
        let mut last_error = None;
        for server in &self.servers {
            match timeout(self.timeout, Conn::new(opts_for(server, None))).await {
                Ok(Ok(conn)) => {
                    debug!(server = %server, "Metadata connection established");
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    warn!(server = %server, error = %e, "Metadata connection failed");
                    last_error = Some(ConnectError::Metadata(e.to_string()));
                }
                Err(_) => {
                    last_error = Some(ConnectError::timeout(format!(
                        "metadata connection to {}",
                        server
                    )))
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ConnectError::Config("no source servers configured".into())))
    }
}

pub(crate) fn column_from_row(
    name: String,
    data_type: String,
    column_type: String,
    is_nullable: String,
) -> ColumnSchema {
    let mut column = ColumnSchema::new(name, data_type);
    if column_type.to_ascii_lowercase().contains("unsigned") {
        column = column.unsigned();
    }
    if is_nullable.eq_ignore_ascii_case("NO") {
        column = column.not_null();
    }
    column
}

#[async_trait]
impl SchemaFetcher for InformationSchemaFetcher {
    async fn fetch(&self, table: &TableRef) -> Result<TableSchema, ConnectError> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let rows: Vec<(String, String, String, String)> = timeout(
            self.timeout,
            conn.exec(COLUMNS_QUERY, (table.database.clone(), table.table.clone())),
        )
        .await
        .map_err(|_| ConnectError::timeout(format!("schema query for {}", table)))?
        .map_err(|e| ConnectError::Metadata(format!("schema query for {}: {}", table, e)))?;

        // only a healthy connection goes back
        *guard = Some(conn);

        if rows.is_empty() {
            return Err(ConnectError::TableNotFound(table.clone()));
        }
        let columns = rows
            .into_iter()
            .map(|(name, data_type, column_type, nullable)| {
                column_from_row(name, data_type, column_type, nullable)
            })
            .collect::<Vec<_>>();
        debug!(table = %table, columns = columns.len(), "Fetched table schema");
        Ok(TableSchema::new(table.clone(), columns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_from_row() {
        let col = column_from_row(
            "id".into(),
            "INT".into(),
            "int(10) unsigned".into(),
            "NO".into(),
        );
        assert_eq!(col.name, "id");
        assert_eq!(col.data_type, "int");
        assert!(col.unsigned);
        assert!(!col.nullable);

        let col = column_from_row(
            "note".into(),
            "varchar".into(),
            "varchar(64)".into(),
            "YES".into(),
        );
        assert!(!col.unsigned);
        assert!(col.nullable);
    }

    #[test]
    fn test_opts_for_endpoint() {
        let server = ServerEndpoint::new("db.local", 3307, "repl", "");
        let opts: mysql_async::Opts = opts_for(&server, Some("information_schema")).into();
        assert_eq!(opts.ip_or_hostname(), "db.local");
        assert_eq!(opts.tcp_port(), 3307);
        assert_eq!(opts.user(), Some("repl"));
        assert_eq!(opts.pass(), None);
        assert_eq!(opts.db_name(), Some("information_schema"));
    }
}
