//! MySQL packet framing and payload encodings, server side: handshake,
//! OK/ERR/EOF, column definitions, text and binary result rows.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{Datelike, Timelike};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use catalog::types::{MysqlType, TypeSpec};
use common::err::server_error::ServerError;
use common::err::SResult;
use engine::value::EngineValue;

use crate::flags::{
    CapabilityFlags, StatusFlags, COLUMN_FLAG_BINARY, COLUMN_FLAG_NOT_NULL,
    COLUMN_FLAG_PRIMARY_KEY, COLUMN_FLAG_UNSIGNED,
};
use crate::{NULL_TERMINATOR, PACKET_HEADER_SIZE, UTF8_MB4_GENERAL_CI};

const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024 - 1;

/// TCP or unix-socket transport under one channel type.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl From<TcpStream> for Transport {
    fn from(stream: TcpStream) -> Self {
        Transport::Tcp(stream)
    }
}

impl From<UnixStream> for Transport {
    fn from(stream: UnixStream) -> Self {
        Transport::Unix(stream)
    }
}

/// Framed channel with sequence tracking. The sequence resets at every
/// command boundary and increments per packet inside one exchange.
pub struct PacketChannel {
    stream: Transport,
    seq: u8,
}

impl PacketChannel {
    pub fn new(stream: impl Into<Transport>) -> Self {
        PacketChannel {
            stream: stream.into(),
            seq: 0,
        }
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match &mut self.stream {
            Transport::Tcp(s) => s.read_exact(buf).await.map(|_| ()),
            Transport::Unix(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }

    async fn write_all_bytes(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match &mut self.stream {
            Transport::Tcp(s) => s.write_all(buf).await,
            Transport::Unix(s) => s.write_all(buf).await,
        }
    }

    pub async fn read_packet(&mut self) -> SResult<Vec<u8>> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        self.read_exact(&mut header).await?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.seq = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(payload)
    }

    pub async fn write_packet(&mut self, payload: &[u8]) -> SResult<()> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(ServerError::Protocol("oversized packet".to_string()));
        }
        let mut frame = Vec::with_capacity(payload.len() + PACKET_HEADER_SIZE);
        let len = payload.len() as u32;
        frame.push((len & 0xff) as u8);
        frame.push(((len >> 8) & 0xff) as u8);
        frame.push(((len >> 16) & 0xff) as u8);
        frame.push(self.seq);
        self.seq = self.seq.wrapping_add(1);
        frame.extend_from_slice(payload);
        self.write_all_bytes(&frame).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> SResult<()> {
        match &mut self.stream {
            Transport::Tcp(s) => s.flush().await?,
            Transport::Unix(s) => s.flush().await?,
        }
        Ok(())
    }
}

//////////////////////
// Length-encoded primitives
//////////////////////

pub fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    if value < 251 {
        out.push(value as u8);
    } else if value < 65536 {
        out.push(0xfc);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 16_777_216 {
        out.push(0xfd);
        out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xfe);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn write_lenenc_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_lenenc_int(out, data.len() as u64);
    out.extend_from_slice(data);
}

pub fn read_lenenc_int(cursor: &mut Cursor<&[u8]>) -> SResult<u64> {
    let first = ReadBytesExt::read_u8(&mut *cursor)?;
    let value = match first {
        0xfc => ReadBytesExt::read_u16::<LittleEndian>(&mut *cursor)? as u64,
        0xfd => cursor.read_u24::<LittleEndian>()? as u64,
        0xfe => ReadBytesExt::read_u64::<LittleEndian>(&mut *cursor)?,
        v => v as u64,
    };
    Ok(value)
}

pub fn read_lenenc_bytes(cursor: &mut Cursor<&[u8]>) -> SResult<Vec<u8>> {
    let len = read_lenenc_int(cursor)? as usize;
    let mut data = vec![0u8; len];
    std::io::Read::read_exact(&mut *cursor, &mut data)?;
    Ok(data)
}

fn read_null_term_string(cursor: &mut Cursor<&[u8]>) -> SResult<String> {
    let mut bytes = Vec::new();
    loop {
        let b = ReadBytesExt::read_u8(&mut *cursor)?;
        if b == NULL_TERMINATOR {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8(bytes)?)
}

//////////////////////
// Handshake
//////////////////////

pub const SERVER_VERSION: &str = "8.0.33";
pub const AUTH_PLUGIN_NAME: &str = "mysql_native_password";

/// Initial handshake v10 sent by the server.
pub fn serialize_handshake_v10(conn_id: u32, scramble: &[u8; 20], status: StatusFlags) -> Vec<u8> {
    let capabilities = server_capabilities().bits();
    let mut out = Vec::new();
    out.push(10u8);
    out.extend_from_slice(SERVER_VERSION.as_bytes());
    out.push(NULL_TERMINATOR);
    out.extend_from_slice(&conn_id.to_le_bytes());
    out.extend_from_slice(&scramble[..8]);
    out.push(0);
    out.extend_from_slice(&((capabilities & 0xffff) as u16).to_le_bytes());
    out.push(UTF8_MB4_GENERAL_CI);
    out.extend_from_slice(&status.bits().to_le_bytes());
    out.extend_from_slice(&(((capabilities >> 16) & 0xffff) as u16).to_le_bytes());
    out.push(21); // auth plugin data length
    out.extend_from_slice(&[0u8; 10]);
    out.extend_from_slice(&scramble[8..20]);
    out.push(NULL_TERMINATOR);
    out.extend_from_slice(AUTH_PLUGIN_NAME.as_bytes());
    out.push(NULL_TERMINATOR);
    out
}

pub fn server_capabilities() -> CapabilityFlags {
    CapabilityFlags::CLIENT_LONG_PASSWORD
        | CapabilityFlags::CLIENT_LONG_FLAG
        | CapabilityFlags::CLIENT_CONNECT_WITH_DB
        | CapabilityFlags::CLIENT_LOCAL_FILES
        | CapabilityFlags::CLIENT_PROTOCOL_41
        | CapabilityFlags::CLIENT_TRANSACTIONS
        | CapabilityFlags::CLIENT_SECURE_CONNECTION
        | CapabilityFlags::CLIENT_MULTI_STATEMENTS
        | CapabilityFlags::CLIENT_MULTI_RESULTS
        | CapabilityFlags::CLIENT_PLUGIN_AUTH
}

/// HandshakeResponse41 from the client.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capabilities: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

pub fn parse_handshake_response(payload: &[u8]) -> SResult<HandshakeResponse> {
    let mut cursor = Cursor::new(payload);
    let capability_bits = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
    let capabilities = CapabilityFlags::from_bits_truncate(capability_bits);
    if !capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        return Err(ServerError::Protocol(
            "client does not speak protocol 41".to_string(),
        ));
    }
    let max_packet_size = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
    let charset = ReadBytesExt::read_u8(&mut cursor)?;
    let mut filler = [0u8; 23];
    std::io::Read::read_exact(&mut cursor, &mut filler)?;
    let username = read_null_term_string(&mut cursor)?;

    let auth_response =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            read_lenenc_bytes(&mut cursor)?
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let len = ReadBytesExt::read_u8(&mut cursor)? as usize;
            let mut data = vec![0u8; len];
            std::io::Read::read_exact(&mut cursor, &mut data)?;
            data
        } else {
            read_null_term_string(&mut cursor)?.into_bytes()
        };

    let database = if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        Some(read_null_term_string(&mut cursor)?)
    } else {
        None
    };
    let auth_plugin = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        read_null_term_string(&mut cursor).ok()
    } else {
        None
    };

    Ok(HandshakeResponse {
        capabilities,
        max_packet_size,
        charset,
        username,
        auth_response,
        database,
        auth_plugin,
    })
}

//////////////////////
// Generic replies
//////////////////////

pub fn serialize_ok(affected: u64, last_insert_id: u64, status: StatusFlags) -> Vec<u8> {
    let mut out = vec![0x00];
    write_lenenc_int(&mut out, affected);
    write_lenenc_int(&mut out, last_insert_id);
    out.extend_from_slice(&status.bits().to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // warnings
    out
}

pub fn serialize_err(errno: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xff];
    out.extend_from_slice(&errno.to_le_bytes());
    out.push(b'#');
    let mut state = sqlstate.as_bytes().to_vec();
    state.resize(5, b'0');
    out.extend_from_slice(&state);
    out.extend_from_slice(message.as_bytes());
    out
}

pub fn serialize_eof(status: StatusFlags) -> Vec<u8> {
    let mut out = vec![0xfe];
    out.extend_from_slice(&0u16.to_le_bytes()); // warnings
    out.extend_from_slice(&status.bits().to_le_bytes());
    out
}

/// LOAD DATA LOCAL INFILE request: asks the client to stream the named file.
pub fn serialize_local_infile_request(file_name: &str) -> Vec<u8> {
    let mut out = vec![0xfb];
    out.extend_from_slice(file_name.as_bytes());
    out
}

//////////////////////
// Result sets
//////////////////////

/// One column of a result set, with everything the definition packet needs.
#[derive(Debug, Clone)]
pub struct WireColumn {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub spec: TypeSpec,
    pub not_null: bool,
    pub primary_key: bool,
}

impl WireColumn {
    pub fn result(name: &str, spec: TypeSpec) -> Self {
        WireColumn {
            schema: String::new(),
            table: String::new(),
            name: name.to_string(),
            spec,
            not_null: false,
            primary_key: false,
        }
    }
}

pub fn serialize_column_def(column: &WireColumn) -> Vec<u8> {
    let mysql_type = column.spec.mysql_type();
    let mut flags = 0u16;
    if column.not_null {
        flags |= COLUMN_FLAG_NOT_NULL;
    }
    if column.primary_key {
        flags |= COLUMN_FLAG_PRIMARY_KEY;
    }
    if column.spec.is_unsigned() {
        flags |= COLUMN_FLAG_UNSIGNED;
    }
    if column.spec.is_binary() {
        flags |= COLUMN_FLAG_BINARY;
    }
    let charset: u16 = if column.spec.is_binary() {
        63 // binary
    } else {
        UTF8_MB4_GENERAL_CI as u16
    };
    let decimals: u8 = match column.spec {
        TypeSpec::Decimal { scale, .. } => scale,
        TypeSpec::Float | TypeSpec::Double => 31,
        _ => 0,
    };

    let mut out = Vec::new();
    write_lenenc_bytes(&mut out, b"def");
    write_lenenc_bytes(&mut out, column.schema.as_bytes());
    write_lenenc_bytes(&mut out, column.table.as_bytes());
    write_lenenc_bytes(&mut out, column.table.as_bytes());
    write_lenenc_bytes(&mut out, column.name.as_bytes());
    write_lenenc_bytes(&mut out, column.name.as_bytes());
    out.push(0x0c);
    out.extend_from_slice(&charset.to_le_bytes());
    out.extend_from_slice(&(65535u32).to_le_bytes()); // display length
    out.push(u8::from(mysql_type));
    out.extend_from_slice(&flags.to_le_bytes());
    out.push(decimals);
    out.extend_from_slice(&[0u8, 0u8]);
    out
}

/// Text-protocol row: length-encoded strings, NULL as 0xfb.
pub fn serialize_text_row(row: &[EngineValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in row {
        match mysql_text(value) {
            None => out.push(0xfb),
            Some(text) => write_lenenc_bytes(&mut out, text.as_bytes()),
        }
    }
    out
}

/// MySQL-flavored text rendering (booleans as 1/0, binary raw).
pub fn mysql_text(value: &EngineValue) -> Option<String> {
    match value {
        EngineValue::Null => None,
        EngineValue::Bool(v) => Some(if *v { "1" } else { "0" }.to_string()),
        EngineValue::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
        other => other.render_text(),
    }
}

/// Binary-protocol row for COM_STMT_EXECUTE results.
pub fn serialize_binary_row(columns: &[WireColumn], row: &[EngineValue]) -> SResult<Vec<u8>> {
    let mut out = vec![0x00];
    let bitmap_len = (row.len() + 7 + 2) / 8;
    let bitmap_start = out.len();
    out.extend(std::iter::repeat(0u8).take(bitmap_len));

    for (idx, value) in row.iter().enumerate() {
        if value.is_null() {
            let bit = idx + 2;
            out[bitmap_start + bit / 8] |= 1 << (bit % 8);
            continue;
        }
        let spec = columns
            .get(idx)
            .map(|c| c.spec)
            .unwrap_or(TypeSpec::Varchar);
        write_binary_value(&mut out, &spec, value)?;
    }
    Ok(out)
}

fn write_binary_value(out: &mut Vec<u8>, spec: &TypeSpec, value: &EngineValue) -> SResult<()> {
    match (spec.mysql_type(), value) {
        (MysqlType::Tiny, EngineValue::Bool(v)) => out.push(u8::from(*v)),
        (MysqlType::Tiny, EngineValue::Int(v)) => out.push(*v as u8),
        (MysqlType::Tiny, EngineValue::UInt(v)) => out.push(*v as u8),
        (MysqlType::Short, EngineValue::Int(v)) => {
            out.extend_from_slice(&(*v as i16).to_le_bytes())
        }
        (MysqlType::Short, EngineValue::UInt(v)) => {
            out.extend_from_slice(&(*v as u16).to_le_bytes())
        }
        (MysqlType::Long, EngineValue::Int(v)) => {
            out.extend_from_slice(&(*v as i32).to_le_bytes())
        }
        (MysqlType::Long, EngineValue::UInt(v)) => {
            out.extend_from_slice(&(*v as u32).to_le_bytes())
        }
        (MysqlType::LongLong, EngineValue::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (MysqlType::LongLong, EngineValue::UInt(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (MysqlType::Float, EngineValue::Float(v)) => {
            out.extend_from_slice(&(*v as f32).to_le_bytes())
        }
        (MysqlType::Double, EngineValue::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (MysqlType::Date, EngineValue::Date(d)) => {
            out.push(4);
            out.extend_from_slice(&(d.year() as u16).to_le_bytes());
            out.push(d.month() as u8);
            out.push(d.day() as u8);
        }
        (MysqlType::DateTime, EngineValue::Timestamp(ts)) => {
            out.push(11);
            out.extend_from_slice(&(ts.year() as u16).to_le_bytes());
            out.push(ts.month() as u8);
            out.push(ts.day() as u8);
            out.push(ts.hour() as u8);
            out.push(ts.minute() as u8);
            out.push(ts.second() as u8);
            out.extend_from_slice(&(ts.and_utc().timestamp_subsec_micros()).to_le_bytes());
        }
        (MysqlType::Time, EngineValue::Time(t)) => {
            out.push(8);
            out.push(0); // non-negative
            out.extend_from_slice(&0u32.to_le_bytes()); // days
            out.push(t.hour() as u8);
            out.push(t.minute() as u8);
            out.push(t.second() as u8);
        }
        (_, value) => {
            // everything else travels as length-encoded text
            let text = mysql_text(value).unwrap_or_default();
            write_lenenc_bytes(out, text.as_bytes());
        }
    }
    Ok(())
}

/// Parameter values of a COM_STMT_EXECUTE, decoded against the declared
/// parameter count.
pub fn parse_execute_params(
    payload: &[u8],
    param_count: usize,
) -> SResult<(u32, Vec<EngineValue>)> {
    let mut cursor = Cursor::new(payload);
    let stmt_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
    let _flags = ReadBytesExt::read_u8(&mut cursor)?;
    let _iterations = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;

    let mut params = Vec::with_capacity(param_count);
    if param_count == 0 {
        return Ok((stmt_id, params));
    }

    let bitmap_len = (param_count + 7) / 8;
    let mut null_bitmap = vec![0u8; bitmap_len];
    std::io::Read::read_exact(&mut cursor, &mut null_bitmap)?;
    let new_params_bound = ReadBytesExt::read_u8(&mut cursor)?;
    let mut types = Vec::with_capacity(param_count);
    if new_params_bound == 1 {
        for _ in 0..param_count {
            let type_byte = ReadBytesExt::read_u8(&mut cursor)?;
            let flags = ReadBytesExt::read_u8(&mut cursor)?;
            types.push((type_byte, flags & 0x80 != 0));
        }
    } else {
        return Err(ServerError::Unsupported(
            "re-execution without parameter types".to_string(),
        ));
    }

    for (idx, (type_byte, unsigned)) in types.iter().enumerate() {
        if null_bitmap[idx / 8] & (1 << (idx % 8)) != 0 {
            params.push(EngineValue::Null);
            continue;
        }
        let mysql_type = MysqlType::try_from(*type_byte)
            .map_err(|_| ServerError::Protocol(format!("bad parameter type {}", type_byte)))?;
        let value = match mysql_type {
            MysqlType::Null => EngineValue::Null,
            MysqlType::Tiny => {
                let v = ReadBytesExt::read_i8(&mut cursor)?;
                if *unsigned {
                    EngineValue::UInt(v as u8 as u64)
                } else {
                    EngineValue::Int(v as i64)
                }
            }
            MysqlType::Short | MysqlType::Year => {
                let v = ReadBytesExt::read_i16::<LittleEndian>(&mut cursor)?;
                if *unsigned {
                    EngineValue::UInt(v as u16 as u64)
                } else {
                    EngineValue::Int(v as i64)
                }
            }
            MysqlType::Long | MysqlType::Int24 => {
                let v = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?;
                if *unsigned {
                    EngineValue::UInt(v as u32 as u64)
                } else {
                    EngineValue::Int(v as i64)
                }
            }
            MysqlType::LongLong => {
                let v = ReadBytesExt::read_i64::<LittleEndian>(&mut cursor)?;
                if *unsigned {
                    EngineValue::UInt(v as u64)
                } else {
                    EngineValue::Int(v)
                }
            }
            MysqlType::Float => EngineValue::Float(ReadBytesExt::read_f32::<LittleEndian>(&mut cursor)? as f64),
            MysqlType::Double => EngineValue::Float(ReadBytesExt::read_f64::<LittleEndian>(&mut cursor)?),
            _ => {
                let bytes = read_lenenc_bytes(&mut cursor)?;
                EngineValue::Text(String::from_utf8(bytes)?)
            }
        };
        params.push(value);
    }
    Ok((stmt_id, params))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use engine::value::EngineValue;

    use super::{
        parse_execute_params, parse_handshake_response, read_lenenc_int, serialize_err,
        serialize_handshake_v10, serialize_ok, serialize_text_row, write_lenenc_int,
    };
    use crate::flags::{CapabilityFlags, StatusFlags};

    #[test]
    fn test_lenenc_round_trip() {
        for value in [0u64, 250, 251, 65535, 65536, 16_777_215, 16_777_216, u64::MAX] {
            let mut out = Vec::new();
            write_lenenc_int(&mut out, value);
            let mut cursor = Cursor::new(out.as_slice());
            assert_eq!(read_lenenc_int(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn test_handshake_round_trip() {
        let scramble = [9u8; 20];
        let packet = serialize_handshake_v10(7, &scramble, StatusFlags::SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(packet[0], 10);
        assert!(packet
            .windows(b"mysql_native_password".len())
            .any(|w| w == b"mysql_native_password"));

        // build a client response the way a 4.1 client does
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        let mut response = Vec::new();
        response.extend_from_slice(&caps.bits().to_le_bytes());
        response.extend_from_slice(&0u32.to_le_bytes());
        response.push(45);
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(b"root\0");
        response.push(20);
        response.extend_from_slice(&[3u8; 20]);
        response.extend_from_slice(b"testdb\0");
        response.extend_from_slice(b"mysql_native_password\0");

        let parsed = parse_handshake_response(&response).unwrap();
        assert_eq!(parsed.username, "root");
        assert_eq!(parsed.auth_response.len(), 20);
        assert_eq!(parsed.database.as_deref(), Some("testdb"));
        assert_eq!(
            parsed.auth_plugin.as_deref(),
            Some("mysql_native_password")
        );
    }

    #[test]
    fn test_ok_err_shapes() {
        let ok = serialize_ok(3, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(ok[0], 0x00);
        assert_eq!(ok[1], 3);

        let err = serialize_err(1049, "42000", "Unknown database 'x'");
        assert_eq!(err[0], 0xff);
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), 1049);
        assert_eq!(err[3], b'#');
        assert_eq!(&err[4..9], b"42000");
    }

    #[test]
    fn test_text_row_nulls() {
        let row = serialize_text_row(&[
            EngineValue::Int(1),
            EngineValue::Null,
            EngineValue::Bool(true),
        ]);
        assert_eq!(row, vec![1, b'1', 0xfb, 1, b'1']);
    }

    #[test]
    fn test_parse_execute_params() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes()); // stmt id
        payload.push(0); // flags
        payload.extend_from_slice(&1u32.to_le_bytes()); // iterations
        payload.push(0b0000_0010); // param 1 is null
        payload.push(1); // new params bound
        payload.extend_from_slice(&[0x08, 0x00]); // longlong signed
        payload.extend_from_slice(&[0x0f, 0x00]); // varchar
        payload.extend_from_slice(&42i64.to_le_bytes());

        let (stmt_id, params) = parse_execute_params(&payload, 2).unwrap();
        assert_eq!(stmt_id, 1);
        assert_eq!(params[0], EngineValue::Int(42));
        assert_eq!(params[1], EngineValue::Null);
    }
}
