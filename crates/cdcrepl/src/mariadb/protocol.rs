//! MariaDB replication wire protocol
//!
//! - Handshake v10 and authentication (mysql_native_password,
//!   caching_sha2_password fast path, auth switch)
//! - COM_QUERY for session setup
//! - COM_REGISTER_SLAVE
//! - COM_BINLOG_DUMP
//! - Packet framing with reassembly of payloads split at 16 MiB

use crate::error::ConnectError;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 3 bytes length + 1 byte sequence
const PACKET_HEADER_SIZE: usize = 4;
/// Maximum payload of a single packet; a full one means more follow
pub(crate) const MAX_PACKET_SIZE: usize = 16_777_215;
/// utf8mb4_general_ci
const CHARSET_UTF8MB4: u8 = 45;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

/// Client capability flags we use
pub(crate) mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;
}

/// Initial greeting from the server.
#[derive(Debug)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: String,
}

fn take<'a>(buf: &mut &'a [u8], n: usize, what: &str) -> Result<&'a [u8], ConnectError> {
    if buf.len() < n {
        return Err(ConnectError::protocol(format!(
            "handshake truncated reading {}",
            what
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_nul_terminated<'a>(buf: &mut &'a [u8]) -> &'a [u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let value = &buf[..end];
    *buf = &buf[(end + 1).min(buf.len())..];
    value
}

impl HandshakePacket {
    pub fn parse(data: &[u8]) -> Result<Self, ConnectError> {
        let mut buf = data;

        let protocol_version = take(&mut buf, 1, "protocol version")?[0];
        if protocol_version != 10 {
            return Err(ConnectError::protocol(format!(
                "unsupported handshake protocol version {}",
                protocol_version
            )));
        }
        let server_version = String::from_utf8_lossy(take_nul_terminated(&mut buf)).into_owned();
        let connection_id = u32::from_le_bytes(
            take(&mut buf, 4, "connection id")?
                .try_into()
                .map_err(|_| ConnectError::protocol("connection id"))?,
        );
        let mut auth_plugin_data = take(&mut buf, 8, "auth data")?.to_vec();
        take(&mut buf, 1, "filler")?;

        let cap_lower = take(&mut buf, 2, "capabilities")?;
        let cap_lower = u16::from_le_bytes([cap_lower[0], cap_lower[1]]);
        let character_set = take(&mut buf, 1, "character set")?[0];
        let status = take(&mut buf, 2, "status flags")?;
        let status_flags = u16::from_le_bytes([status[0], status[1]]);
        let cap_upper = take(&mut buf, 2, "capabilities")?;
        let cap_upper = u16::from_le_bytes([cap_upper[0], cap_upper[1]]);
        let capability_flags = (u32::from(cap_upper) << 16) | u32::from(cap_lower);

        let auth_data_len = take(&mut buf, 1, "auth data length")?[0] as usize;
        // 6 reserved bytes followed by MariaDB's extended capabilities
        take(&mut buf, 10, "reserved")?;

        if capability_flags & capability::CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_data_len.saturating_sub(8).max(13);
            let avail = part2_len.min(buf.len());
            let part2 = take(&mut buf, avail, "auth data part 2")?;
            let end = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
            auth_plugin_data.extend_from_slice(&part2[..end]);
        }

        let auth_plugin_name = if capability_flags & capability::CLIENT_PLUGIN_AUTH != 0 {
            String::from_utf8_lossy(take_nul_terminated(&mut buf)).into_owned()
        } else {
            "mysql_native_password".to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }
}

/// Decode an ERR packet (`0xFF`, code, optional `#` + SQL state, message).
pub(crate) fn parse_error_packet(packet: &[u8]) -> ConnectError {
    if packet.len() < 3 {
        return ConnectError::protocol("short error packet");
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]);
    let mut message = &packet[3..];
    if message.first() == Some(&b'#') && message.len() >= 6 {
        message = &message[6..];
    }
    ConnectError::Server {
        code,
        message: String::from_utf8_lossy(message).into_owned(),
    }
}

/// One packet read from a replication stream.
#[derive(Debug)]
pub(crate) enum StreamPacket {
    /// Binlog event without the leading OK byte
    Event(Bytes),
    /// Server ended the stream
    Eof,
    /// ERR packet
    Error(ConnectError),
}

impl StreamPacket {
    pub fn classify(packet: Vec<u8>) -> Result<Self, ConnectError> {
        match packet.first() {
            Some(0x00) => {
                let mut data = Bytes::from(packet);
                let event = data.split_off(1);
                Ok(Self::Event(event))
            }
            Some(0xFE) if packet.len() < 9 => Ok(Self::Eof),
            Some(0xFF) => Ok(Self::Error(parse_error_packet(&packet))),
            Some(other) => Err(ConnectError::protocol(format!(
                "unexpected replication packet marker 0x{:02X}",
                other
            ))),
            None => Err(ConnectError::protocol("empty replication packet")),
        }
    }
}

/// Authenticated connection to a MariaDB server.
pub struct MariaDbClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for MariaDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MariaDbClient")
            .field("sequence_id", &self.sequence_id)
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl MariaDbClient {
    /// Connect and authenticate; the whole exchange is bounded by `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let addr = format!("{}:{}", host, port);
        info!("Connecting to MariaDB at {}", addr);

        timeout(connect_timeout, Self::connect_inner(&addr, user, password))
            .await
            .map_err(|_| {
                ConnectError::timeout(format!(
                    "connecting to {} took longer than {}s",
                    addr,
                    connect_timeout.as_secs()
                ))
            })?
    }

    async fn connect_inner(
        addr: &str,
        user: &str,
        password: Option<&str>,
    ) -> Result<Self, ConnectError> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;

        let mut client = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let greeting = client.read_packet().await?;
        if greeting.first() == Some(&0xFF) {
            return Err(parse_error_packet(&greeting));
        }
        let handshake = HandshakePacket::parse(&greeting)?;
        info!(
            "Connected to MariaDB {} (connection_id={})",
            handshake.server_version, handshake.connection_id
        );
        debug!("Auth plugin: {}", handshake.auth_plugin_name);

        client.server_version = handshake.server_version.clone();
        client.connection_id = handshake.connection_id;
        client.authenticate(user, password, &handshake).await?;
        Ok(client)
    }

    /// Read one logical packet, joining continuation packets.
    pub(crate) async fn read_packet(&mut self) -> Result<Vec<u8>, ConnectError> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            self.read_exact(&mut header).await?;

            let len =
                (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
            self.sequence_id = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..]).await?;

            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectError> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ConnectError::Disconnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<(), ConnectError> {
        let len = data.len();
        if len >= MAX_PACKET_SIZE {
            return Err(ConnectError::protocol(format!(
                "packet too large: {} bytes",
                len
            )));
        }

        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + len);
        packet.push((len & 0xFF) as u8);
        packet.push(((len >> 8) & 0xFF) as u8);
        packet.push(((len >> 16) & 0xFF) as u8);
        packet.push(self.sequence_id);
        packet.extend_from_slice(data);

        let stream = self.stream.get_mut();
        stream.write_all(&packet).await?;
        stream.flush().await?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &HandshakePacket,
    ) -> Result<(), ConnectError> {
        let client_flags = capability::CLIENT_PROTOCOL_41
            | capability::CLIENT_SECURE_CONNECTION
            | capability::CLIENT_LONG_PASSWORD
            | capability::CLIENT_TRANSACTIONS
            | capability::CLIENT_PLUGIN_AUTH
            | capability::CLIENT_DEPRECATE_EOF;

        let plugin = match handshake.auth_plugin_name.as_str() {
            "caching_sha2_password" => "caching_sha2_password",
            "mysql_native_password" | "" => "mysql_native_password",
            other => {
                warn!(
                    "Unknown auth plugin: {}, trying mysql_native_password",
                    other
                );
                "mysql_native_password"
            }
        };
        let auth_response = scramble(plugin, password, &handshake.auth_plugin_data)?;

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(CHARSET_UTF8MB4);
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;
        self.finish_auth(plugin, password).await
    }

    /// Follow the server's replies until OK or failure.
    async fn finish_auth(
        &mut self,
        mut plugin: &str,
        password: Option<&str>,
    ) -> Result<(), ConnectError> {
        let mut switched = false;
        loop {
            let resp = self.read_packet().await?;
            match resp.first() {
                Some(0x00) => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                Some(0xFF) => {
                    return Err(match parse_error_packet(&resp) {
                        ConnectError::Server { code, message } => {
                            ConnectError::Auth(format!("{} - {}", code, message))
                        }
                        other => other,
                    });
                }
                Some(0xFE) if !switched => {
                    // Auth switch request: plugin name, then new salt
                    let body = &resp[1..];
                    let name_end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                    let name = String::from_utf8_lossy(&body[..name_end]).into_owned();
                    let mut salt = body.get(name_end + 1..).unwrap_or_default();
                    if salt.last() == Some(&0) {
                        salt = &salt[..salt.len() - 1];
                    }
                    debug!("Auth switch to plugin: {}", name);

                    plugin = match name.as_str() {
                        "mysql_native_password" => "mysql_native_password",
                        "caching_sha2_password" => "caching_sha2_password",
                        other => {
                            return Err(ConnectError::Auth(format!(
                                "unsupported auth plugin for switch: {}",
                                other
                            )))
                        }
                    };
                    let auth_response = scramble(plugin, password, salt)?;
                    self.write_packet(&auth_response).await?;
                    switched = true;
                }
                Some(0x01) if plugin == "caching_sha2_password" => match resp.get(1) {
                    // fast auth success; the OK packet follows
                    Some(0x03) => debug!("Fast auth success"),
                    Some(0x04) => {
                        return Err(ConnectError::Auth(
                            "caching_sha2_password full authentication requires a secure connection"
                                .into(),
                        ))
                    }
                    _ => return Err(ConnectError::Auth("unexpected auth more-data packet".into())),
                },
                Some(other) => {
                    return Err(ConnectError::Auth(format!(
                        "unexpected auth response: 0x{:02X}",
                        other
                    )))
                }
                None => return Err(ConnectError::Auth("empty auth response".into())),
            }
        }
    }

    /// Execute a statement and discard any result set.
    pub async fn query(&mut self, sql: &str) -> Result<(), ConnectError> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(parse_error_packet(&resp)),
            Some(_) => {
                // column definitions and rows, terminated by EOF/OK (0xFE)
                loop {
                    let packet = self.read_packet().await?;
                    match packet.first() {
                        Some(0xFE) if packet.len() < MAX_PACKET_SIZE => return Ok(()),
                        Some(0xFF) => return Err(parse_error_packet(&packet)),
                        _ => {}
                    }
                }
            }
            None => Err(ConnectError::protocol("empty query response")),
        }
    }

    /// Announce this connection as replica `server_id`.
    pub async fn register_slave(&mut self, server_id: u32) -> Result<(), ConnectError> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => {
                info!("Registered as replica with server_id={}", server_id);
                Ok(())
            }
            Some(0xFF) => Err(parse_error_packet(&resp)),
            _ => Err(ConnectError::protocol(
                "unexpected response to COM_REGISTER_SLAVE",
            )),
        }
    }

    /// Request the binlog. With `@slave_connect_state` set, the server
    /// ignores the file name and position and starts from that GTID.
    pub async fn binlog_dump(&mut self, server_id: u32) -> Result<(), ConnectError> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(11);
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(4); // position
        packet.put_u16_le(0); // flags
        packet.put_u32_le(server_id);
        // empty file name
        self.write_packet(&packet).await?;
        debug!("Sent COM_BINLOG_DUMP");
        Ok(())
    }

    /// Next packet of the replication stream.
    pub(crate) async fn read_stream_packet(&mut self) -> Result<StreamPacket, ConnectError> {
        let packet = self.read_packet().await?;
        StreamPacket::classify(packet)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }
}

fn scramble(plugin: &str, password: Option<&str>, salt: &[u8]) -> Result<Vec<u8>, ConnectError> {
    match plugin {
        "mysql_native_password" => Ok(mysql_native_password(password, salt)),
        "caching_sha2_password" => Ok(caching_sha2_password(password, salt)),
        other => Err(ConnectError::Auth(format!(
            "unsupported auth plugin: {}",
            other
        ))),
    }
}

/// SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
fn mysql_native_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let stage1 = Sha1::digest(pwd.as_bytes());
            let stage2 = Sha1::digest(stage1);

            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let stage3 = hasher.finalize();

            stage1
                .iter()
                .zip(stage3.iter())
                .map(|(a, b)| a ^ b)
                .collect()
        }
    }
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + salt)
fn caching_sha2_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let hash1 = Sha256::digest(pwd.as_bytes());
            let hash2 = Sha256::digest(hash1);

            let mut hasher = Sha256::new();
            hasher.update(hash2);
            hasher.update(salt);
            let hash3 = hasher.finalize();

            hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting() -> Vec<u8> {
        let mut p = vec![10];
        p.extend_from_slice(b"10.11.6-MariaDB\0");
        p.extend_from_slice(&7u32.to_le_bytes());
        p.extend_from_slice(b"abcdefgh");
        p.push(0);
        let caps = capability::CLIENT_PROTOCOL_41
            | capability::CLIENT_SECURE_CONNECTION
            | capability::CLIENT_PLUGIN_AUTH;
        p.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
        p.push(CHARSET_UTF8MB4);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        p.push(21);
        p.extend_from_slice(&[0u8; 10]);
        p.extend_from_slice(b"ijklmnopqrst\0");
        p.extend_from_slice(b"mysql_native_password\0");
        p
    }

    #[test]
    fn test_parse_handshake() {
        let hs = HandshakePacket::parse(&greeting()).unwrap();
        assert_eq!(hs.server_version, "10.11.6-MariaDB");
        assert_eq!(hs.connection_id, 7);
        assert_eq!(hs.auth_plugin_data, b"abcdefghijklmnopqrst");
        assert_eq!(hs.auth_plugin_name, "mysql_native_password");
        assert_eq!(hs.status_flags, 2);
    }

    #[test]
    fn test_parse_handshake_short_scramble_tail() {
        let caps = capability::CLIENT_PROTOCOL_41 | capability::CLIENT_SECURE_CONNECTION;
        let mut p = vec![10];
        p.extend_from_slice(b"5.5.5-10.6.16-MariaDB\0");
        p.extend_from_slice(&9u32.to_le_bytes());
        p.extend_from_slice(b"abcdefgh");
        p.push(0);
        p.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
        p.push(CHARSET_UTF8MB4);
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        p.push(0);
        p.extend_from_slice(&[0u8; 10]);
        // fewer than the 13 bytes the length byte implies
        p.extend_from_slice(b"ijklm");

        let hs = HandshakePacket::parse(&p).unwrap();
        assert_eq!(hs.connection_id, 9);
        assert_eq!(hs.auth_plugin_data, b"abcdefghijklm");
        assert_eq!(hs.auth_plugin_name, "mysql_native_password");
    }

    #[test]
    fn test_parse_handshake_truncated() {
        let g = greeting();
        assert!(matches!(
            HandshakePacket::parse(&g[..12]),
            Err(ConnectError::Protocol(_))
        ));
        assert!(HandshakePacket::parse(&[9]).is_err());
    }

    #[test]
    fn test_mysql_native_password() {
        let salt = b"12345678901234567890";
        assert_eq!(mysql_native_password(Some("password"), salt).len(), 20);
        assert!(mysql_native_password(None, salt).is_empty());
        assert!(mysql_native_password(Some(""), salt).is_empty());
    }

    #[test]
    fn test_caching_sha2_password() {
        let salt = b"12345678901234567890";
        let a = caching_sha2_password(Some("password"), salt);
        let b = caching_sha2_password(Some("password"), b"09876543210987654321");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_error_packet() {
        let mut p = vec![0xFF];
        p.extend_from_slice(&1236u16.to_le_bytes());
        p.extend_from_slice(b"#HY000Could not find GTID state");
        match parse_error_packet(&p) {
            ConnectError::Server { code, message } => {
                assert_eq!(code, 1236);
                assert_eq!(message, "Could not find GTID state");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse_error_packet(&[0xFF]),
            ConnectError::Protocol(_)
        ));
    }

    #[test]
    fn test_classify_stream_packets() {
        match StreamPacket::classify(vec![0x00, 1, 2, 3]).unwrap() {
            StreamPacket::Event(data) => assert_eq!(&data[..], &[1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            StreamPacket::classify(vec![0xFE, 0, 0, 2, 0]).unwrap(),
            StreamPacket::Eof
        ));
        assert!(matches!(
            StreamPacket::classify(vec![0xFF, 0x15, 0x04]).unwrap(),
            StreamPacket::Error(ConnectError::Server { code: 1045, .. })
        ));
        assert!(StreamPacket::classify(vec![]).is_err());
        assert!(StreamPacket::classify(vec![0x42]).is_err());
    }
}
