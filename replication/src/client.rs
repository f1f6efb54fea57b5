//! Synchronous wire client for the upstream primary: one regular SQL
//! connection for publication/slot bookkeeping and one replication
//! connection streaming CopyBoth frames. Blocking reads with a socket
//! timeout give the consumer loop its deadline.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use common::err::server_error::ServerError;
use common::err::SResult;
use engine::value::quote_literal;

use crate::lsn::Lsn;
use crate::pgoutput::{parse_frame, ReplicationFrame};

const PROTOCOL_VERSION: i32 = 196608; // 3.0

/// Microseconds since the PostgreSQL epoch (2000-01-01), used in standby
/// status updates.
pub fn pg_now_micros() -> i64 {
    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    (Utc::now() - epoch).num_microseconds().unwrap_or(0)
}

/// Connection parameters parsed from the subscription's kv connection
/// string, e.g. `host=p port=5432 user=u password=s dbname=db`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
}

impl PrimaryConfig {
    pub fn parse(kv: &str) -> SResult<Self> {
        let mut host = None;
        let mut port = 5432u16;
        let mut user = None;
        let mut password = None;
        let mut dbname = None;
        for pair in kv.split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ServerError::Config(format!("bad connection string item '{}'", pair))
            })?;
            match key {
                "host" => host = Some(value.to_string()),
                "port" => {
                    port = value
                        .parse()
                        .map_err(|_| ServerError::Config(format!("bad port '{}'", value)))?
                }
                "user" => user = Some(value.to_string()),
                "password" => password = Some(value.to_string()),
                "dbname" => dbname = Some(value.to_string()),
                _ => debug!("ignoring connection string key '{}'", key),
            }
        }
        Ok(PrimaryConfig {
            host: host
                .ok_or_else(|| ServerError::Config("connection string missing host".to_string()))?,
            port,
            user: user
                .ok_or_else(|| ServerError::Config("connection string missing user".to_string()))?,
            password,
            dbname: dbname.ok_or_else(|| {
                ServerError::Config("connection string missing dbname".to_string())
            })?,
        })
    }
}

/// Length-prefixed message channel over a blocking TCP stream.
pub struct WireChannel {
    stream: TcpStream,
}

impl WireChannel {
    pub fn connect(config: &PrimaryConfig) -> SResult<Self> {
        let address = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&address)?;
        stream.set_nodelay(true)?;
        Ok(WireChannel { stream })
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> SResult<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn send_startup(&mut self, params: &[(&str, &str)]) -> SResult<()> {
        let mut payload = Vec::new();
        payload.write_i32::<BigEndian>(PROTOCOL_VERSION)?;
        for (key, value) in params {
            payload.extend_from_slice(key.as_bytes());
            payload.push(0);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);

        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.write_u32::<BigEndian>(payload.len() as u32 + 4)?;
        framed.extend_from_slice(&payload);
        self.stream.write_all(&framed)?;
        Ok(())
    }

    pub fn send(&mut self, tag: u8, payload: &[u8]) -> SResult<()> {
        let mut framed = Vec::with_capacity(payload.len() + 5);
        framed.push(tag);
        framed.write_u32::<BigEndian>(payload.len() as u32 + 4)?;
        framed.extend_from_slice(payload);
        self.stream.write_all(&framed)?;
        Ok(())
    }

    pub fn recv(&mut self) -> SResult<(u8, Vec<u8>)> {
        match self.recv_opt()? {
            Some(message) => Ok(message),
            None => Err(ServerError::Replication("read timed out".to_string())),
        }
    }

    /// Receive one message, or None when the socket timeout elapses.
    pub fn recv_opt(&mut self) -> SResult<Option<(u8, Vec<u8>)>> {
        let mut header = [0u8; 5];
        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        }
        let tag = header[0];
        let len = (&header[1..5]).read_u32::<BigEndian>()? as usize;
        if len < 4 {
            return Err(ServerError::Protocol(format!(
                "message length {} too small",
                len
            )));
        }
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload)?;
        Ok(Some((tag, payload)))
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Parse the field list of an ErrorResponse into (sqlstate, message).
pub fn parse_error_fields(payload: &[u8]) -> (String, String) {
    let mut code = String::new();
    let mut message = String::new();
    let mut rest = payload;
    while !rest.is_empty() && rest[0] != 0 {
        let kind = rest[0];
        let end = rest[1..]
            .iter()
            .position(|b| *b == 0)
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[1..end]).into_owned();
        match kind {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
        if end + 1 >= rest.len() {
            break;
        }
        rest = &rest[end + 1..];
    }
    (code, message)
}

/// Client to the primary, SQL or replication flavored.
pub struct ReplicaClient {
    channel: WireChannel,
    config: PrimaryConfig,
}

impl ReplicaClient {
    pub fn connect_sql(config: &PrimaryConfig) -> SResult<Self> {
        let mut client = ReplicaClient {
            channel: WireChannel::connect(config)?,
            config: config.clone(),
        };
        client.startup(false)?;
        Ok(client)
    }

    pub fn connect_replication(config: &PrimaryConfig) -> SResult<Self> {
        let mut client = ReplicaClient {
            channel: WireChannel::connect(config)?,
            config: config.clone(),
        };
        client.startup(true)?;
        Ok(client)
    }

    fn startup(&mut self, replication: bool) -> SResult<()> {
        let mut params: Vec<(&str, &str)> = vec![
            ("user", self.config.user.as_str()),
            ("database", self.config.dbname.as_str()),
            ("application_name", "front_replica"),
        ];
        if replication {
            params.push(("replication", "database"));
        }
        self.channel.send_startup(&params)?;

        loop {
            let (tag, payload) = self.channel.recv()?;
            match tag {
                b'R' => {
                    if payload.len() < 4 {
                        return Err(ServerError::Protocol(
                            "short authentication message".to_string(),
                        ));
                    }
                    let code = (&payload[0..4]).read_u32::<BigEndian>()?;
                    match code {
                        0 => {}
                        3 => {
                            let password = self.config.password.clone().ok_or_else(|| {
                                ServerError::Replication(
                                    "primary requires a password but none configured".to_string(),
                                )
                            })?;
                            let mut body = password.into_bytes();
                            body.push(0);
                            self.channel.send(b'p', &body)?;
                        }
                        other => {
                            return Err(ServerError::ReplicationFatal(format!(
                                "unsupported authentication method {}",
                                other
                            )))
                        }
                    }
                }
                b'S' | b'K' | b'N' => {}
                b'Z' => return Ok(()),
                b'E' => {
                    let (code, message) = parse_error_fields(&payload);
                    return Err(ServerError::Replication(format!("{} {}", code, message)));
                }
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected startup message '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    /// Simple-protocol query returning text rows.
    pub fn simple_query(&mut self, sql: &str) -> SResult<Vec<Vec<Option<String>>>> {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        self.channel.send(b'Q', &body)?;

        let mut rows = Vec::new();
        let mut error: Option<ServerError> = None;
        loop {
            let (tag, payload) = self.channel.recv()?;
            match tag {
                b'T' | b'C' | b'S' | b'N' | b'I' => {}
                b'D' => {
                    let mut cursor = io::Cursor::new(payload.as_slice());
                    let ncols = cursor.read_u16::<BigEndian>()?;
                    let mut row = Vec::with_capacity(ncols as usize);
                    for _ in 0..ncols {
                        let len = cursor.read_i32::<BigEndian>()?;
                        if len < 0 {
                            row.push(None);
                        } else {
                            let mut data = vec![0u8; len as usize];
                            cursor.read_exact(&mut data)?;
                            row.push(Some(String::from_utf8(data)?));
                        }
                    }
                    rows.push(row);
                }
                b'E' => {
                    let (code, message) = parse_error_fields(&payload);
                    error = Some(ServerError::Replication(format!("{} {}", code, message)));
                }
                b'Z' => break,
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected query response '{}'",
                        other as char
                    )))
                }
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    /// Ensure the publication exists on the primary.
    pub fn ensure_publication(&mut self, publication: &str) -> SResult<()> {
        let rows = self.simple_query(&format!(
            "SELECT 1 FROM pg_publication WHERE pubname = {}",
            quote_literal(publication)
        ))?;
        if rows.is_empty() {
            info!("creating publication '{}' on primary", publication);
            self.simple_query(&format!(
                "CREATE PUBLICATION \"{}\" FOR ALL TABLES",
                publication
            ))?;
        }
        Ok(())
    }

    /// Ensure the logical replication slot exists on the primary.
    pub fn ensure_slot(&mut self, slot: &str) -> SResult<()> {
        let rows = self.simple_query(&format!(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = {}",
            quote_literal(slot)
        ))?;
        if rows.is_empty() {
            info!("creating replication slot '{}' on primary", slot);
            self.simple_query(&format!(
                "SELECT pg_create_logical_replication_slot({}, 'pgoutput')",
                quote_literal(slot)
            ))?;
        }
        Ok(())
    }

    /// Enter CopyBoth streaming from `start_lsn`.
    pub fn start_replication(
        &mut self,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> SResult<()> {
        let sql = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL {} (proto_version '2', publication_names '\"{}\"', messages 'true', streaming 'true')",
            slot, start_lsn, publication
        );
        let mut body = sql.into_bytes();
        body.push(0);
        self.channel.send(b'Q', &body)?;

        loop {
            let (tag, payload) = self.channel.recv()?;
            match tag {
                b'W' => return Ok(()),
                b'N' | b'S' => {}
                b'E' => {
                    let (code, message) = parse_error_fields(&payload);
                    return Err(ServerError::Replication(format!("{} {}", code, message)));
                }
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected START_REPLICATION response '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> SResult<()> {
        self.channel.set_read_timeout(Some(timeout))
    }

    /// Receive one replication frame, or None when the deadline elapses.
    pub fn recv_replication(&mut self) -> SResult<Option<ReplicationFrame>> {
        loop {
            let Some((tag, payload)) = self.channel.recv_opt()? else {
                return Ok(None);
            };
            match tag {
                b'd' => return Ok(Some(parse_frame(&payload)?)),
                b'c' | b'C' | b'Z' => {
                    // server ended the copy stream
                    return Err(ServerError::Replication(
                        "replication stream closed by primary".to_string(),
                    ));
                }
                b'E' => {
                    let (code, message) = parse_error_fields(&payload);
                    return Err(ServerError::Replication(format!("{} {}", code, message)));
                }
                b'N' | b'S' => continue,
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected stream message '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    /// Standby status update inside the copy stream.
    pub fn send_standby_update(
        &mut self,
        write: Lsn,
        flush: Lsn,
        apply: Lsn,
        reply_requested: bool,
    ) -> SResult<()> {
        let mut body = vec![b'r'];
        body.write_u64::<BigEndian>(write.0)?;
        body.write_u64::<BigEndian>(flush.0)?;
        body.write_u64::<BigEndian>(apply.0)?;
        body.write_i64::<BigEndian>(pg_now_micros())?;
        body.push(u8::from(reply_requested));
        self.channel.send(b'd', &body)?;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.channel.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::{parse_error_fields, PrimaryConfig};

    #[test]
    fn test_parse_connection_string() {
        let config =
            PrimaryConfig::parse("host=primary port=5433 user=repl password=secret dbname=app")
                .unwrap();
        assert_eq!(config.host, "primary");
        assert_eq!(config.port, 5433);
        assert_eq!(config.user, "repl");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.dbname, "app");

        assert!(PrimaryConfig::parse("host=p user=u").is_err());
        assert!(PrimaryConfig::parse("host=p port=bogus user=u dbname=d").is_err());
    }

    #[test]
    fn test_parse_error_fields() {
        let mut payload = Vec::new();
        payload.push(b'S');
        payload.extend_from_slice(b"ERROR\0");
        payload.push(b'C');
        payload.extend_from_slice(b"55006\0");
        payload.push(b'M');
        payload.extend_from_slice(b"replication slot is active\0");
        payload.push(0);
        let (code, message) = parse_error_fields(&payload);
        assert_eq!(code, "55006");
        assert_eq!(message, "replication slot is active");
    }
}
