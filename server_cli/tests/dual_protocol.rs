//! Scenario: a table is created through the MySQL port, populated through
//! the PostgreSQL port, and read back through the MySQL port, all against
//! one shared engine pool.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use common::auth::TrustAuthenticator;
use common::err::SResult;
use engine::iface::EngineColumn;
use engine::mock::MockConnector;
use engine::pool::ConnectionPool;
use engine::value::EngineValue;
use translate::gucs::PersistentVars;
use translate::intercept::{BackupRequest, CreateSubscriptionRequest, ExtensionOps};

struct StubVars(Mutex<HashMap<String, String>>);

impl PersistentVars for StubVars {
    fn get(&self, name: &str) -> Option<String> {
        self.0.lock().unwrap().get(name).cloned()
    }
    fn set(&self, name: &str, value: &str, _vtype: &str) -> SResult<()> {
        self.0
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
    fn reset(&self, name: &str) -> SResult<()> {
        self.0.lock().unwrap().remove(name);
        Ok(())
    }
    fn all(&self) -> Vec<(String, String)> {
        vec![]
    }
}

struct NoopOps;

impl ExtensionOps for NoopOps {
    fn create_subscription(&self, _request: &CreateSubscriptionRequest) -> SResult<()> {
        Ok(())
    }
    fn backup(&self, _request: &BackupRequest) -> SResult<()> {
        Ok(())
    }
    fn wal_position(&self) -> u64 {
        0
    }
}

fn spawn_pg(pool: Arc<ConnectionPool>, conn_id: u32) -> TcpStream {
    let ctx = Arc::new(pgwire::session::SessionContext {
        pool,
        vars: Arc::new(StubVars(Mutex::new(HashMap::new()))),
        ops: Arc::new(NoopOps),
        auth: Arc::new(TrustAuthenticator),
        datadir: std::env::temp_dir(),
        tls: None,
    });
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            listener.set_nonblocking(true).unwrap();
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let (socket, _) = listener.accept().await.unwrap();
            let mut session = pgwire::session::PgSession::new(
                pgwire::codec::PgChannel::new(socket),
                conn_id,
                ctx,
            );
            let _ = session.run().await;
        });
    });
    TcpStream::connect(addr).unwrap()
}

fn spawn_mysql(pool: Arc<ConnectionPool>, conn_id: u32) -> TcpStream {
    let ctx = Arc::new(mysqlwire::session::MySessionContext {
        pool,
        vars: Arc::new(StubVars(Mutex::new(HashMap::new()))),
        ops: Arc::new(NoopOps),
        auth: Arc::new(TrustAuthenticator),
        datadir: std::env::temp_dir(),
        catalog: "main".to_string(),
        report_host: String::new(),
        report_port: 3306,
    });
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            listener.set_nonblocking(true).unwrap();
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let (socket, _) = listener.accept().await.unwrap();
            let mut session = mysqlwire::session::MySession::new(
                mysqlwire::packets::PacketChannel::new(socket),
                conn_id,
                ctx,
            );
            let _ = session.run().await;
        });
    });
    TcpStream::connect(addr).unwrap()
}

fn mysql_handshake(client: &mut TcpStream) {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut greeting = vec![0u8; len];
    client.read_exact(&mut greeting).unwrap();

    let caps: u32 = 0x0000_0200 | 0x0000_8000 | 0x0008_0000;
    let mut response = Vec::new();
    response.extend_from_slice(&caps.to_le_bytes());
    response.extend_from_slice(&0u32.to_le_bytes());
    response.push(45);
    response.extend_from_slice(&[0u8; 23]);
    response.extend_from_slice(b"tester\0");
    response.push(0);
    response.extend_from_slice(b"mysql_native_password\0");

    let rlen = response.len() as u32;
    let mut frame = vec![
        (rlen & 0xff) as u8,
        ((rlen >> 8) & 0xff) as u8,
        ((rlen >> 16) & 0xff) as u8,
        1,
    ];
    frame.extend_from_slice(&response);
    client.write_all(&frame).unwrap();

    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut ok = vec![0u8; len];
    client.read_exact(&mut ok).unwrap();
    assert_eq!(ok[0], 0x00);
}

fn mysql_query(client: &mut TcpStream, sql: &str) {
    let mut payload = vec![0x03];
    payload.extend_from_slice(sql.as_bytes());
    let len = payload.len() as u32;
    let mut frame = vec![
        (len & 0xff) as u8,
        ((len >> 8) & 0xff) as u8,
        ((len >> 16) & 0xff) as u8,
        0,
    ];
    frame.extend_from_slice(&payload);
    client.write_all(&frame).unwrap();
}

fn mysql_read_packet(client: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    client.read_exact(&mut payload).unwrap();
    payload
}

fn pg_handshake(client: &mut TcpStream) {
    let mut body = 196608i32.to_be_bytes().to_vec();
    body.extend_from_slice(b"user\0tester\0database\0main\0\0");
    let mut frame = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    client.write_all(&frame).unwrap();

    loop {
        let mut header = [0u8; 5];
        client.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        client.read_exact(&mut payload).unwrap();
        if header[0] == b'Z' {
            return;
        }
    }
}

fn pg_query(client: &mut TcpStream, sql: &str) -> Vec<u8> {
    let mut body = sql.as_bytes().to_vec();
    body.push(0);
    let mut frame = vec![b'Q'];
    frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    client.write_all(&frame).unwrap();

    let mut tags = Vec::new();
    loop {
        let mut header = [0u8; 5];
        client.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        client.read_exact(&mut payload).unwrap();
        tags.push(header[0]);
        if header[0] == b'Z' {
            return tags;
        }
    }
}

#[test]
fn test_dual_protocol_round_trip() {
    let connector = MockConnector::new();
    connector.state.lock().unwrap().canned(
        "SELECT \"id\", \"name\" FROM \"t\"",
        vec![
            EngineColumn::new("id", "INTEGER"),
            EngineColumn::new("name", "VARCHAR"),
        ],
        vec![vec![
            EngineValue::Int(1),
            EngineValue::Text("alice".to_string()),
        ]],
    );
    let state = connector.state.clone();
    let pool = Arc::new(ConnectionPool::new(Arc::new(connector)));

    // create via the MySQL port
    let mut mysql = spawn_mysql(pool.clone(), 1);
    mysql_handshake(&mut mysql);
    mysql_query(&mut mysql, "CREATE TABLE t (id int, name varchar(64))");
    let ok = mysql_read_packet(&mut mysql);
    assert_eq!(ok[0], 0x00);

    // insert via the PostgreSQL port
    let mut pg = spawn_pg(pool.clone(), 2);
    pg_handshake(&mut pg);
    let tags = pg_query(&mut pg, "INSERT INTO t VALUES (1, 'alice')");
    assert_eq!(tags, vec![b'C', b'Z']);

    // select via the MySQL port; values round-trip in text protocol
    mysql_query(&mut mysql, "SELECT `id`, `name` FROM `t`");
    let header = mysql_read_packet(&mut mysql);
    assert_eq!(header[0], 2);
    mysql_read_packet(&mut mysql); // id definition
    mysql_read_packet(&mut mysql); // name definition
    assert_eq!(mysql_read_packet(&mut mysql)[0], 0xfe); // eof
    let row = mysql_read_packet(&mut mysql);
    assert_eq!(row, vec![1, b'1', 5, b'a', b'l', b'i', b'c', b'e']);

    // both sessions shared one pool against one engine
    let log = state.lock().unwrap().log.clone();
    assert!(log
        .iter()
        .any(|l| l.contains("CREATE TABLE t (id int, name varchar(64))")));
    assert!(log.iter().any(|l| l.contains("INSERT INTO t VALUES")));
}
