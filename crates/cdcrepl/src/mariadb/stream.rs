//! Binlog stream client
//!
//! [`BinlogSource`] opens a replication stream at a GTID; [`EventStream`]
//! yields raw events until the connection fails. A stream is never
//! restarted in place: recovery always opens a fresh one from the durable
//! position.

use super::protocol::{MariaDbClient, StreamPacket};
use crate::config::{ServerEndpoint, SourceConfig};
use crate::error::ConnectError;
use crate::event::RawEvent;
use crate::position::Gtid;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// ER_MASTER_FATAL_ERROR_READING_BINLOG
const ER_MASTER_FATAL_READING_BINLOG: u16 = 1236;

/// Something that can start a binlog stream at a position.
#[async_trait]
pub trait BinlogSource: Send + Sync {
    /// Connect, register and request the binlog starting after `position`.
    ///
    /// Fails with [`ConnectError::PositionNotAvailable`] when the source no
    /// longer holds that GTID.
    async fn open(&self, position: &Gtid) -> Result<Box<dyn EventStream>, ConnectError>;
}

/// An open replication stream.
#[async_trait]
pub trait EventStream: Send {
    /// Next raw event. Errors are terminal for this stream.
    async fn next_event(&mut self) -> Result<RawEvent, ConnectError>;
}

/// Map a server error on the replication channel.
pub(crate) fn replication_error(err: ConnectError, position: &Gtid) -> ConnectError {
    match err {
        ConnectError::Server { message, .. } if mentions_missing_position(&message) => {
            ConnectError::PositionNotAvailable {
                position: position.to_string(),
                message,
            }
        }
        ConnectError::Server { code, message } if code == ER_MASTER_FATAL_READING_BINLOG => {
            ConnectError::SourceFatal { code, message }
        }
        other => other,
    }
}

fn mentions_missing_position(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    (lower.contains("gtid")
        && (lower.contains("purged")
            || lower.contains("not find")
            || lower.contains("not in the master's binlog")))
        || lower.contains("could not find first log file")
}

/// MariaDB replication source with ordered server failover.
#[derive(Debug, Clone)]
pub struct MariaDbSource {
    servers: Vec<ServerEndpoint>,
    server_id: u32,
    heartbeat_period: Duration,
    read_timeout: Duration,
    connect_timeout: Duration,
}

impl MariaDbSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            server_id: config.server_id,
            heartbeat_period: config.heartbeat_period(),
            read_timeout: config.read_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    async fn open_on(
        &self,
        server: &ServerEndpoint,
        position: &Gtid,
    ) -> Result<MariaDbEventStream, ConnectError> {
        let password = server.password.expose_secret();
        let mut client = MariaDbClient::connect(
            &server.host,
            server.port,
            &server.user,
            (!password.is_empty()).then_some(password),
            self.connect_timeout,
        )
        .await?;

        let setup = [
            "SET @master_binlog_checksum = @@global.binlog_checksum".to_string(),
            "SET @mariadb_slave_capability = 4".to_string(),
            format!("SET @slave_connect_state = '{}'", position),
            "SET @slave_gtid_strict_mode = 1".to_string(),
            "SET @slave_gtid_ignore_duplicates = 1".to_string(),
            format!(
                "SET @master_heartbeat_period = {}",
                self.heartbeat_period.as_nanos()
            ),
        ];
        for sql in &setup {
            debug!("{}", sql);
            timeout(self.connect_timeout, client.query(sql))
                .await
                .map_err(|_| ConnectError::timeout(format!("session setup: {}", sql)))??;
        }

        timeout(self.connect_timeout, client.register_slave(self.server_id))
            .await
            .map_err(|_| ConnectError::timeout("COM_REGISTER_SLAVE"))??;
        client.binlog_dump(self.server_id).await?;

        let mut stream = MariaDbEventStream {
            client,
            pending: None,
            read_timeout: self.read_timeout,
            position: *position,
        };
        // A missing position is reported on the first reply
        let first = stream.read_event().await?;
        stream.pending = Some(first);

        info!(
            server = %server,
            version = stream.client.server_version(),
            gtid = %position,
            "Replication stream open"
        );
        Ok(stream)
    }
}

#[async_trait]
impl BinlogSource for MariaDbSource {
    async fn open(&self, position: &Gtid) -> Result<Box<dyn EventStream>, ConnectError> {
        let mut last_error = None;
        for server in &self.servers {
            match self.open_on(server, position).await {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(e) => {
                    warn!(server = %server, error = %e, "Failed to open replication stream");
                    // a missing position outranks connectivity failures elsewhere
                    let keep_previous = matches!(
                        last_error,
                        Some(ConnectError::PositionNotAvailable { .. })
                    ) && !matches!(e, ConnectError::PositionNotAvailable { .. });
                    if !keep_previous {
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ConnectError::Config("no source servers configured".into())))
    }
}

/// Replication stream over one [`MariaDbClient`].
#[derive(Debug)]
pub struct MariaDbEventStream {
    client: MariaDbClient,
    pending: Option<Bytes>,
    read_timeout: Duration,
    position: Gtid,
}

impl MariaDbEventStream {
    async fn read_event(&mut self) -> Result<Bytes, ConnectError> {
        let packet = timeout(self.read_timeout, self.client.read_stream_packet())
            .await
            .map_err(|_| {
                ConnectError::timeout(format!(
                    "no binlog data for {}s",
                    self.read_timeout.as_secs()
                ))
            })??;

        match packet {
            StreamPacket::Event(data) => Ok(data),
            StreamPacket::Eof => {
                debug!("Received EOF in binlog stream");
                Err(ConnectError::Disconnected)
            }
            StreamPacket::Error(e) => Err(replication_error(e, &self.position)),
        }
    }
}

#[async_trait]
impl EventStream for MariaDbEventStream {
    async fn next_event(&mut self) -> Result<RawEvent, ConnectError> {
        let data = match self.pending.take() {
            Some(data) => data,
            None => self.read_event().await?,
        };
        let event = RawEvent::new(data);
        trace!(kind = ?event.kind, len = event.data.len(), "binlog event");
        Ok(event)
    }
}
