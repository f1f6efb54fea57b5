//! PostgreSQL frontend/backend protocol v3 message parsing and encoding.
//! Parsing covers what a frontend sends post-startup; encoding covers the
//! backend replies the session emits.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use common::err::server_error::ServerError;
use common::err::SResult;

pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const PROTOCOL_VERSION: i32 = 196608;

/// First frame on a fresh connection.
#[derive(Debug)]
pub enum StartupAction {
    SslRequest,
    GssEncRequest,
    CancelRequest { pid: u32, secret: u32 },
    Startup(HashMap<String, String>),
}

pub fn parse_startup(payload: &[u8]) -> SResult<StartupAction> {
    let mut cursor = Cursor::new(payload);
    let code = cursor.read_i32::<BigEndian>()?;
    match code {
        SSL_REQUEST_CODE => Ok(StartupAction::SslRequest),
        GSSENC_REQUEST_CODE => Ok(StartupAction::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            let pid = cursor.read_u32::<BigEndian>()?;
            let secret = cursor.read_u32::<BigEndian>()?;
            Ok(StartupAction::CancelRequest { pid, secret })
        }
        PROTOCOL_VERSION => {
            let mut params = HashMap::new();
            let rest = &payload[4..];
            let mut parts = rest.split(|b| *b == 0);
            loop {
                let Some(key) = parts.next() else { break };
                if key.is_empty() {
                    break;
                }
                let value = parts.next().unwrap_or(&[]);
                params.insert(
                    String::from_utf8(key.to_vec())?,
                    String::from_utf8(value.to_vec())?,
                );
            }
            Ok(StartupAction::Startup(params))
        }
        other => Err(ServerError::Protocol(format!(
            "unsupported startup code {}",
            other
        ))),
    }
}

/// Frontend messages after startup.
#[derive(Debug, PartialEq)]
pub enum FrontendMessage {
    Query(String),
    Parse {
        name: String,
        sql: String,
        param_oids: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Describe {
        kind: u8,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        kind: u8,
        name: String,
    },
    Flush,
    Sync,
    CopyData(Vec<u8>),
    CopyDone,
    CopyFail(String),
    PasswordMessage(String),
    Terminate,
}

fn read_cstr(cursor: &mut Cursor<&[u8]>) -> SResult<String> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor.read_u8().map_err(|_| {
            ServerError::Protocol("unterminated string in message".to_string())
        })?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8(bytes)?)
}

pub fn parse_frontend(tag: u8, payload: &[u8]) -> SResult<FrontendMessage> {
    let mut cursor = Cursor::new(payload);
    let message = match tag {
        b'Q' => FrontendMessage::Query(read_cstr(&mut cursor)?),
        b'P' => {
            let name = read_cstr(&mut cursor)?;
            let sql = read_cstr(&mut cursor)?;
            let count = cursor.read_i16::<BigEndian>()?;
            let mut param_oids = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                param_oids.push(cursor.read_u32::<BigEndian>()?);
            }
            FrontendMessage::Parse {
                name,
                sql,
                param_oids,
            }
        }
        b'B' => {
            let portal = read_cstr(&mut cursor)?;
            let statement = read_cstr(&mut cursor)?;
            let nformats = cursor.read_i16::<BigEndian>()?;
            let mut param_formats = Vec::with_capacity(nformats.max(0) as usize);
            for _ in 0..nformats {
                param_formats.push(cursor.read_i16::<BigEndian>()?);
            }
            let nparams = cursor.read_i16::<BigEndian>()?;
            let mut params = Vec::with_capacity(nparams.max(0) as usize);
            for _ in 0..nparams {
                let len = cursor.read_i32::<BigEndian>()?;
                if len < 0 {
                    params.push(None);
                } else {
                    let mut data = vec![0u8; len as usize];
                    cursor.read_exact(&mut data)?;
                    params.push(Some(data));
                }
            }
            let nresults = cursor.read_i16::<BigEndian>()?;
            let mut result_formats = Vec::with_capacity(nresults.max(0) as usize);
            for _ in 0..nresults {
                result_formats.push(cursor.read_i16::<BigEndian>()?);
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            }
        }
        b'D' => {
            let kind = cursor.read_u8()?;
            let name = read_cstr(&mut cursor)?;
            FrontendMessage::Describe { kind, name }
        }
        b'E' => {
            let portal = read_cstr(&mut cursor)?;
            let max_rows = cursor.read_i32::<BigEndian>()?;
            FrontendMessage::Execute { portal, max_rows }
        }
        b'C' => {
            let kind = cursor.read_u8()?;
            let name = read_cstr(&mut cursor)?;
            FrontendMessage::Close { kind, name }
        }
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'd' => FrontendMessage::CopyData(payload.to_vec()),
        b'c' => FrontendMessage::CopyDone,
        b'f' => FrontendMessage::CopyFail(read_cstr(&mut cursor).unwrap_or_default()),
        b'p' => FrontendMessage::PasswordMessage(read_cstr(&mut cursor)?),
        b'X' => FrontendMessage::Terminate,
        other => {
            return Err(ServerError::Protocol(format!(
                "unknown frontend message '{}' (0x{:02x})",
                other as char, other
            )))
        }
    };
    Ok(message)
}

/// One result field descriptor in a RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: u32,
    pub typlen: i16,
    pub format: i16,
}

fn put_message(out: &mut BytesMut, tag: u8, body: &[u8]) {
    out.put_u8(tag);
    out.put_u32(body.len() as u32 + 4);
    out.put_slice(body);
}

pub fn authentication_ok(out: &mut BytesMut) {
    put_message(out, b'R', &0u32.to_be_bytes());
}

pub fn authentication_cleartext(out: &mut BytesMut) {
    put_message(out, b'R', &3u32.to_be_bytes());
}

pub fn parameter_status(out: &mut BytesMut, name: &str, value: &str) {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    put_message(out, b'S', &body);
}

pub fn backend_key_data(out: &mut BytesMut, pid: u32, secret: u32) {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&pid.to_be_bytes());
    body.extend_from_slice(&secret.to_be_bytes());
    put_message(out, b'K', &body);
}

pub const TXN_IDLE: u8 = b'I';
pub const TXN_OPEN: u8 = b'T';
pub const TXN_FAILED: u8 = b'E';

pub fn ready_for_query(out: &mut BytesMut, status: u8) {
    put_message(out, b'Z', &[status]);
}

pub fn row_description(out: &mut BytesMut, fields: &[FieldDescription]) {
    let mut body = Vec::new();
    body.extend_from_slice(&(fields.len() as i16).to_be_bytes());
    for field in fields {
        body.extend_from_slice(field.name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0u32.to_be_bytes()); // table oid
        body.extend_from_slice(&0i16.to_be_bytes()); // attribute number
        body.extend_from_slice(&field.type_oid.to_be_bytes());
        body.extend_from_slice(&field.typlen.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes()); // typmod
        body.extend_from_slice(&field.format.to_be_bytes());
    }
    put_message(out, b'T', &body);
}

pub fn data_row(out: &mut BytesMut, cells: &[Option<Vec<u8>>]) {
    let mut body = Vec::new();
    body.extend_from_slice(&(cells.len() as i16).to_be_bytes());
    for cell in cells {
        match cell {
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(data) => {
                body.extend_from_slice(&(data.len() as i32).to_be_bytes());
                body.extend_from_slice(data);
            }
        }
    }
    put_message(out, b'D', &body);
}

pub fn command_complete(out: &mut BytesMut, tag: &str) {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    put_message(out, b'C', &body);
}

pub fn empty_query_response(out: &mut BytesMut) {
    put_message(out, b'I', &[]);
}

pub fn parse_complete(out: &mut BytesMut) {
    put_message(out, b'1', &[]);
}

pub fn bind_complete(out: &mut BytesMut) {
    put_message(out, b'2', &[]);
}

pub fn close_complete(out: &mut BytesMut) {
    put_message(out, b'3', &[]);
}

pub fn no_data(out: &mut BytesMut) {
    put_message(out, b'n', &[]);
}

pub fn portal_suspended(out: &mut BytesMut) {
    put_message(out, b's', &[]);
}

pub fn parameter_description(out: &mut BytesMut, oids: &[u32]) {
    let mut body = Vec::new();
    body.extend_from_slice(&(oids.len() as i16).to_be_bytes());
    for oid in oids {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    put_message(out, b't', &body);
}

pub fn error_response(out: &mut BytesMut, severity: &str, code: &str, message: &str) {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(severity.as_bytes());
    body.push(0);
    body.push(b'V');
    body.extend_from_slice(severity.as_bytes());
    body.push(0);
    body.push(b'C');
    body.extend_from_slice(code.as_bytes());
    body.push(0);
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);
    put_message(out, b'E', &body);
}

pub fn copy_in_response(out: &mut BytesMut, ncols: i16) {
    let mut body = vec![0u8]; // overall text format
    body.extend_from_slice(&ncols.to_be_bytes());
    for _ in 0..ncols {
        body.extend_from_slice(&0i16.to_be_bytes());
    }
    put_message(out, b'G', &body);
}

pub fn copy_out_response(out: &mut BytesMut, ncols: i16) {
    let mut body = vec![0u8];
    body.extend_from_slice(&ncols.to_be_bytes());
    for _ in 0..ncols {
        body.extend_from_slice(&0i16.to_be_bytes());
    }
    put_message(out, b'H', &body);
}

pub fn copy_data(out: &mut BytesMut, data: &[u8]) {
    put_message(out, b'd', data);
}

pub fn copy_done(out: &mut BytesMut) {
    put_message(out, b'c', &[]);
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn test_parse_startup() {
        let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
        payload.extend_from_slice(b"user\0alice\0database\0app\0\0");
        match parse_startup(&payload).unwrap() {
            StartupAction::Startup(params) => {
                assert_eq!(params.get("user").unwrap(), "alice");
                assert_eq!(params.get("database").unwrap(), "app");
            }
            other => panic!("unexpected {:?}", other),
        }

        let payload = SSL_REQUEST_CODE.to_be_bytes().to_vec();
        assert!(matches!(
            parse_startup(&payload).unwrap(),
            StartupAction::SslRequest
        ));
    }

    #[test]
    fn test_parse_query_and_extended() {
        let msg = parse_frontend(b'Q', b"SELECT 1\0").unwrap();
        assert_eq!(msg, FrontendMessage::Query("SELECT 1".to_string()));

        let mut payload = Vec::new();
        payload.extend_from_slice(b"s1\0select $1\0");
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&23u32.to_be_bytes());
        match parse_frontend(b'P', &payload).unwrap() {
            FrontendMessage::Parse {
                name,
                sql,
                param_oids,
            } => {
                assert_eq!(name, "s1");
                assert_eq!(sql, "select $1");
                assert_eq!(param_oids, vec![23]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut payload = Vec::new();
        payload.extend_from_slice(b"\0s1\0");
        payload.extend_from_slice(&0i16.to_be_bytes()); // formats
        payload.extend_from_slice(&1i16.to_be_bytes()); // params
        payload.extend_from_slice(&2i32.to_be_bytes());
        payload.extend_from_slice(b"42");
        payload.extend_from_slice(&0i16.to_be_bytes()); // result formats
        match parse_frontend(b'B', &payload).unwrap() {
            FrontendMessage::Bind {
                portal,
                statement,
                params,
                ..
            } => {
                assert_eq!(portal, "");
                assert_eq!(statement, "s1");
                assert_eq!(params, vec![Some(b"42".to_vec())]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_shapes() {
        let mut out = BytesMut::new();
        ready_for_query(&mut out, TXN_IDLE);
        assert_eq!(&out[..], &[b'Z', 0, 0, 0, 5, b'I']);

        let mut out = BytesMut::new();
        data_row(&mut out, &[Some(b"1".to_vec()), None]);
        assert_eq!(out[0], b'D');
        let body = &out[5..];
        // two cells: one of length 1, one null (-1)
        assert_eq!(&body[..2], &2i16.to_be_bytes());
        assert_eq!(&body[2..6], &1i32.to_be_bytes());
        assert_eq!(body[6], b'1');
        assert_eq!(&body[7..11], &(-1i32).to_be_bytes());

        let mut out = BytesMut::new();
        command_complete(&mut out, "SELECT 1");
        assert_eq!(out[0], b'C');
        assert!(out.ends_with(&[0]));
    }

    #[test]
    fn test_error_response_fields() {
        let mut out = BytesMut::new();
        error_response(&mut out, "ERROR", "3D000", "unknown database");
        let text = String::from_utf8_lossy(&out[..]).into_owned();
        assert!(text.contains("3D000"));
        assert!(text.contains("unknown database"));
    }
}
