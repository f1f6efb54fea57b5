//! Decoders for the upstream logical replication stream: the transport
//! frames carried inside CopyData, and the change messages inside XLogData.
//!
//! All integers are big-endian on this wire. With `proto_version=2` and
//! streaming enabled, change messages inside an open stream segment carry
//! the transaction id right after the tag byte; the caller passes the
//! `in_stream` flag it derives from StreamStart/StreamStop.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use nom::number::complete::{be_i64, be_u64, be_u8};
use nom::IResult;

use common::err::server_error::ServerError;
use common::err::SResult;

use crate::lsn::Lsn;

/// Transport frame inside a CopyData message on a replication connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    /// 'w': a WAL data chunk carrying one logical message.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_clock: i64,
        data: Vec<u8>,
    },
    /// 'k': primary keepalive.
    Keepalive {
        wal_end: Lsn,
        server_clock: i64,
        reply_requested: bool,
    },
}

fn xlog_data(input: &[u8]) -> IResult<&[u8], ReplicationFrame> {
    let (input, wal_start) = be_u64(input)?;
    let (input, wal_end) = be_u64(input)?;
    let (input, server_clock) = be_i64(input)?;
    Ok((
        &[],
        ReplicationFrame::XLogData {
            wal_start: Lsn(wal_start),
            wal_end: Lsn(wal_end),
            server_clock,
            data: input.to_vec(),
        },
    ))
}

fn keepalive(input: &[u8]) -> IResult<&[u8], ReplicationFrame> {
    let (input, wal_end) = be_u64(input)?;
    let (input, server_clock) = be_i64(input)?;
    let (input, reply) = be_u8(input)?;
    Ok((
        input,
        ReplicationFrame::Keepalive {
            wal_end: Lsn(wal_end),
            server_clock,
            reply_requested: reply != 0,
        },
    ))
}

/// Parse one CopyData payload from the replication stream.
pub fn parse_frame(payload: &[u8]) -> SResult<ReplicationFrame> {
    if payload.is_empty() {
        return Err(ServerError::Incomplete(1));
    }
    let body = &payload[1..];
    let result = match payload[0] {
        b'w' => xlog_data(body),
        b'k' => keepalive(body),
        other => {
            return Err(ServerError::Protocol(format!(
                "unknown replication frame tag 0x{:02x}",
                other
            )))
        }
    };
    match result {
        Ok((_, frame)) => Ok(frame),
        Err(_) => Err(ServerError::Parse("truncated replication frame".to_string())),
    }
}

/// One column in a Relation message.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    /// Bit 0 set when the column is part of the replica identity key.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    pub fn is_key(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// Cell inside a tuple of an Insert/Update/Delete message.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleCell {
    Null,
    /// TOAST value not sent; the stored value is unchanged.
    Unchanged,
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

pub type TupleData = Vec<TupleCell>;

/// Logical change messages, decoded from XLogData payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        commit_ts: i64,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_ts: i64,
    },
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    Relation {
        rel_id: u32,
        namespace: String,
        name: String,
        replica_identity: u8,
        columns: Vec<RelationColumn>,
    },
    TypeDef {
        oid: u32,
        namespace: String,
        name: String,
    },
    Insert {
        rel_id: u32,
        new: TupleData,
    },
    Update {
        rel_id: u32,
        key: Option<TupleData>,
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        rel_id: u32,
        key: Option<TupleData>,
        old: Option<TupleData>,
    },
    Truncate {
        options: u8,
        rel_ids: Vec<u32>,
    },
    /// 'M' with `messages=true`: decoded and ignored downstream.
    Message {
        prefix: String,
        content: Vec<u8>,
    },
    StreamStart {
        xid: u32,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: u32,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_ts: i64,
    },
    StreamAbort {
        xid: u32,
        subxid: u32,
    },
}

fn read_cstr(cursor: &mut Cursor<&[u8]>) -> SResult<String> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8(bytes)?)
}

fn read_tuple(cursor: &mut Cursor<&[u8]>) -> SResult<TupleData> {
    let ncols = cursor.read_u16::<BigEndian>()?;
    let mut cells = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let kind = cursor.read_u8()?;
        let cell = match kind {
            b'n' => TupleCell::Null,
            b'u' => TupleCell::Unchanged,
            b't' => {
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data)?;
                TupleCell::Text(data)
            }
            b'b' => {
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data)?;
                TupleCell::Binary(data)
            }
            other => {
                return Err(ServerError::Protocol(format!(
                    "unknown tuple cell kind 0x{:02x}",
                    other
                )))
            }
        };
        cells.push(cell);
    }
    Ok(cells)
}

/// Skip the xid prefix carried by change messages inside a stream segment.
fn skip_stream_xid(cursor: &mut Cursor<&[u8]>, in_stream: bool) -> SResult<()> {
    if in_stream {
        let _xid = cursor.read_u32::<BigEndian>()?;
    }
    Ok(())
}

/// Parse one logical message out of an XLogData payload.
pub fn parse_logical(data: &[u8], in_stream: bool) -> SResult<LogicalMessage> {
    if data.is_empty() {
        return Err(ServerError::Incomplete(1));
    }
    let tag = data[0];
    let mut cursor = Cursor::new(&data[1..]);

    let message = match tag {
        b'B' => {
            let final_lsn = cursor.read_u64::<BigEndian>()?;
            let commit_ts = cursor.read_i64::<BigEndian>()?;
            let xid = cursor.read_u32::<BigEndian>()?;
            LogicalMessage::Begin {
                final_lsn: Lsn(final_lsn),
                commit_ts,
                xid,
            }
        }
        b'C' => {
            let _flags = cursor.read_u8()?;
            let commit_lsn = cursor.read_u64::<BigEndian>()?;
            let end_lsn = cursor.read_u64::<BigEndian>()?;
            let commit_ts = cursor.read_i64::<BigEndian>()?;
            LogicalMessage::Commit {
                commit_lsn: Lsn(commit_lsn),
                end_lsn: Lsn(end_lsn),
                commit_ts,
            }
        }
        b'O' => {
            let commit_lsn = cursor.read_u64::<BigEndian>()?;
            let name = read_cstr(&mut cursor)?;
            LogicalMessage::Origin {
                commit_lsn: Lsn(commit_lsn),
                name,
            }
        }
        b'R' => {
            skip_stream_xid(&mut cursor, in_stream)?;
            let rel_id = cursor.read_u32::<BigEndian>()?;
            let namespace = read_cstr(&mut cursor)?;
            let name = read_cstr(&mut cursor)?;
            let replica_identity = cursor.read_u8()?;
            let ncols = cursor.read_u16::<BigEndian>()?;
            let mut columns = Vec::with_capacity(ncols as usize);
            for _ in 0..ncols {
                let flags = cursor.read_u8()?;
                let col_name = read_cstr(&mut cursor)?;
                let type_oid = cursor.read_u32::<BigEndian>()?;
                let type_modifier = cursor.read_i32::<BigEndian>()?;
                columns.push(RelationColumn {
                    flags,
                    name: col_name,
                    type_oid,
                    type_modifier,
                });
            }
            LogicalMessage::Relation {
                rel_id,
                namespace,
                name,
                replica_identity,
                columns,
            }
        }
        b'Y' => {
            skip_stream_xid(&mut cursor, in_stream)?;
            let oid = cursor.read_u32::<BigEndian>()?;
            let namespace = read_cstr(&mut cursor)?;
            let name = read_cstr(&mut cursor)?;
            LogicalMessage::TypeDef {
                oid,
                namespace,
                name,
            }
        }
        b'I' => {
            skip_stream_xid(&mut cursor, in_stream)?;
            let rel_id = cursor.read_u32::<BigEndian>()?;
            let marker = cursor.read_u8()?;
            if marker != b'N' {
                return Err(ServerError::Protocol(format!(
                    "insert tuple marker 0x{:02x}",
                    marker
                )));
            }
            let new = read_tuple(&mut cursor)?;
            LogicalMessage::Insert { rel_id, new }
        }
        b'U' => {
            skip_stream_xid(&mut cursor, in_stream)?;
            let rel_id = cursor.read_u32::<BigEndian>()?;
            let mut key = None;
            let mut old = None;
            let mut marker = cursor.read_u8()?;
            if marker == b'K' {
                key = Some(read_tuple(&mut cursor)?);
                marker = cursor.read_u8()?;
            } else if marker == b'O' {
                old = Some(read_tuple(&mut cursor)?);
                marker = cursor.read_u8()?;
            }
            if marker != b'N' {
                return Err(ServerError::Protocol(format!(
                    "update tuple marker 0x{:02x}",
                    marker
                )));
            }
            let new = read_tuple(&mut cursor)?;
            LogicalMessage::Update {
                rel_id,
                key,
                old,
                new,
            }
        }
        b'D' => {
            skip_stream_xid(&mut cursor, in_stream)?;
            let rel_id = cursor.read_u32::<BigEndian>()?;
            let marker = cursor.read_u8()?;
            let (key, old) = match marker {
                b'K' => (Some(read_tuple(&mut cursor)?), None),
                b'O' => (None, Some(read_tuple(&mut cursor)?)),
                other => {
                    return Err(ServerError::Protocol(format!(
                        "delete tuple marker 0x{:02x}",
                        other
                    )))
                }
            };
            LogicalMessage::Delete { rel_id, key, old }
        }
        b'T' => {
            skip_stream_xid(&mut cursor, in_stream)?;
            let nrels = cursor.read_u32::<BigEndian>()?;
            let options = cursor.read_u8()?;
            let mut rel_ids = Vec::with_capacity(nrels as usize);
            for _ in 0..nrels {
                rel_ids.push(cursor.read_u32::<BigEndian>()?);
            }
            LogicalMessage::Truncate { options, rel_ids }
        }
        b'M' => {
            skip_stream_xid(&mut cursor, in_stream)?;
            let _flags = cursor.read_u8()?;
            let _lsn = cursor.read_u64::<BigEndian>()?;
            let prefix = read_cstr(&mut cursor)?;
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let mut content = vec![0u8; len];
            cursor.read_exact(&mut content)?;
            LogicalMessage::Message { prefix, content }
        }
        b'S' => {
            let xid = cursor.read_u32::<BigEndian>()?;
            let first = cursor.read_u8()?;
            LogicalMessage::StreamStart {
                xid,
                first_segment: first == 1,
            }
        }
        b'E' => LogicalMessage::StreamStop,
        b'c' => {
            let xid = cursor.read_u32::<BigEndian>()?;
            let _flags = cursor.read_u8()?;
            let commit_lsn = cursor.read_u64::<BigEndian>()?;
            let end_lsn = cursor.read_u64::<BigEndian>()?;
            let commit_ts = cursor.read_i64::<BigEndian>()?;
            LogicalMessage::StreamCommit {
                xid,
                commit_lsn: Lsn(commit_lsn),
                end_lsn: Lsn(end_lsn),
                commit_ts,
            }
        }
        b'A' => {
            let xid = cursor.read_u32::<BigEndian>()?;
            let subxid = cursor.read_u32::<BigEndian>()?;
            LogicalMessage::StreamAbort { xid, subxid }
        }
        other => {
            return Err(ServerError::Protocol(format!(
                "unknown logical message tag 0x{:02x}",
                other
            )))
        }
    };
    Ok(message)
}

#[cfg(test)]
pub mod testutil {
    //! Builders for scripted message sequences used by consumer tests.

    use byteorder::{BigEndian, WriteBytesExt};

    use super::TupleCell;
    use crate::lsn::Lsn;

    pub fn begin(final_lsn: Lsn, xid: u32) -> Vec<u8> {
        let mut out = vec![b'B'];
        out.write_u64::<BigEndian>(final_lsn.0).unwrap();
        out.write_i64::<BigEndian>(0).unwrap();
        out.write_u32::<BigEndian>(xid).unwrap();
        out
    }

    pub fn commit(commit_lsn: Lsn, end_lsn: Lsn) -> Vec<u8> {
        let mut out = vec![b'C', 0];
        out.write_u64::<BigEndian>(commit_lsn.0).unwrap();
        out.write_u64::<BigEndian>(end_lsn.0).unwrap();
        out.write_i64::<BigEndian>(0).unwrap();
        out
    }

    pub fn relation(rel_id: u32, namespace: &str, name: &str, cols: &[(&str, u32, bool)]) -> Vec<u8> {
        let mut out = vec![b'R'];
        out.write_u32::<BigEndian>(rel_id).unwrap();
        out.extend_from_slice(namespace.as_bytes());
        out.push(0);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.push(b'd');
        out.write_u16::<BigEndian>(cols.len() as u16).unwrap();
        for (col_name, oid, key) in cols {
            out.push(if *key { 1 } else { 0 });
            out.extend_from_slice(col_name.as_bytes());
            out.push(0);
            out.write_u32::<BigEndian>(*oid).unwrap();
            out.write_i32::<BigEndian>(-1).unwrap();
        }
        out
    }

    pub fn tuple(cells: &[TupleCell]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u16::<BigEndian>(cells.len() as u16).unwrap();
        for cell in cells {
            match cell {
                TupleCell::Null => out.push(b'n'),
                TupleCell::Unchanged => out.push(b'u'),
                TupleCell::Text(data) => {
                    out.push(b't');
                    out.write_u32::<BigEndian>(data.len() as u32).unwrap();
                    out.extend_from_slice(data);
                }
                TupleCell::Binary(data) => {
                    out.push(b'b');
                    out.write_u32::<BigEndian>(data.len() as u32).unwrap();
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }

    pub fn text_cells(values: &[Option<&str>]) -> Vec<TupleCell> {
        values
            .iter()
            .map(|v| match v {
                Some(s) => TupleCell::Text(s.as_bytes().to_vec()),
                None => TupleCell::Null,
            })
            .collect()
    }

    pub fn insert(rel_id: u32, cells: &[TupleCell]) -> Vec<u8> {
        let mut out = vec![b'I'];
        out.write_u32::<BigEndian>(rel_id).unwrap();
        out.push(b'N');
        out.extend_from_slice(&tuple(cells));
        out
    }

    pub fn update(
        rel_id: u32,
        key: Option<&[TupleCell]>,
        old: Option<&[TupleCell]>,
        new: &[TupleCell],
    ) -> Vec<u8> {
        let mut out = vec![b'U'];
        out.write_u32::<BigEndian>(rel_id).unwrap();
        if let Some(key) = key {
            out.push(b'K');
            out.extend_from_slice(&tuple(key));
        } else if let Some(old) = old {
            out.push(b'O');
            out.extend_from_slice(&tuple(old));
        }
        out.push(b'N');
        out.extend_from_slice(&tuple(new));
        out
    }

    pub fn delete(rel_id: u32, key: &[TupleCell]) -> Vec<u8> {
        let mut out = vec![b'D'];
        out.write_u32::<BigEndian>(rel_id).unwrap();
        out.push(b'K');
        out.extend_from_slice(&tuple(key));
        out
    }

    pub fn truncate(rel_ids: &[u32]) -> Vec<u8> {
        let mut out = vec![b'T'];
        out.write_u32::<BigEndian>(rel_ids.len() as u32).unwrap();
        out.push(0);
        for rel_id in rel_ids {
            out.write_u32::<BigEndian>(*rel_id).unwrap();
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::testutil::*;
    use super::{parse_frame, parse_logical, LogicalMessage, ReplicationFrame, TupleCell};
    use crate::lsn::Lsn;

    #[test]
    fn test_frame_keepalive() {
        let mut payload = vec![b'k'];
        payload.extend_from_slice(&0x1122u64.to_be_bytes());
        payload.extend_from_slice(&0i64.to_be_bytes());
        payload.push(1);
        let frame = parse_frame(&payload).unwrap();
        assert_eq!(
            frame,
            ReplicationFrame::Keepalive {
                wal_end: Lsn(0x1122),
                server_clock: 0,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_frame_xlog_data() {
        let mut payload = vec![b'w'];
        payload.extend_from_slice(&7u64.to_be_bytes());
        payload.extend_from_slice(&9u64.to_be_bytes());
        payload.extend_from_slice(&0i64.to_be_bytes());
        payload.extend_from_slice(b"inner");
        match parse_frame(&payload).unwrap() {
            ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                data,
                ..
            } => {
                assert_eq!(wal_start, Lsn(7));
                assert_eq!(wal_end, Lsn(9));
                assert_eq!(data, b"inner");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_begin_commit_round_trip() {
        let msg = parse_logical(&begin(Lsn(100), 42), false).unwrap();
        assert_eq!(
            msg,
            LogicalMessage::Begin {
                final_lsn: Lsn(100),
                commit_ts: 0,
                xid: 42,
            }
        );

        let msg = parse_logical(&commit(Lsn(100), Lsn(101)), false).unwrap();
        assert_eq!(
            msg,
            LogicalMessage::Commit {
                commit_lsn: Lsn(100),
                end_lsn: Lsn(101),
                commit_ts: 0,
            }
        );
    }

    #[test]
    fn test_relation_and_changes() {
        let msg = parse_logical(
            &relation(16384, "public", "t", &[("id", 23, true), ("name", 25, false)]),
            false,
        )
        .unwrap();
        match msg {
            LogicalMessage::Relation {
                rel_id,
                namespace,
                name,
                columns,
                ..
            } => {
                assert_eq!(rel_id, 16384);
                assert_eq!(namespace, "public");
                assert_eq!(name, "t");
                assert_eq!(columns.len(), 2);
                assert!(columns[0].is_key());
                assert!(!columns[1].is_key());
            }
            other => panic!("unexpected {:?}", other),
        }

        let cells = text_cells(&[Some("1"), Some("a")]);
        let msg = parse_logical(&insert(16384, &cells), false).unwrap();
        assert_eq!(
            msg,
            LogicalMessage::Insert {
                rel_id: 16384,
                new: cells.clone(),
            }
        );

        let key = text_cells(&[Some("1"), None]);
        let msg = parse_logical(&delete(16384, &key), false).unwrap();
        match msg {
            LogicalMessage::Delete { key: Some(k), .. } => {
                assert_eq!(k[1], TupleCell::Null)
            }
            other => panic!("unexpected {:?}", other),
        }

        let msg = parse_logical(&truncate(&[16384, 16385]), false).unwrap();
        assert_eq!(
            msg,
            LogicalMessage::Truncate {
                options: 0,
                rel_ids: vec![16384, 16385],
            }
        );
    }

    #[test]
    fn test_unknown_tag() {
        assert!(parse_logical(&[0x7f], false).is_err());
        assert!(parse_frame(&[0x7f]).is_err());
    }
}
