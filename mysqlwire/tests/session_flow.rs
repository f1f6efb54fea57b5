//! Protocol-level MySQL session tests with a scripted client against the
//! recording mock engine.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use common::auth::TrustAuthenticator;
use common::err::SResult;
use engine::iface::{CatalogColumn, EngineColumn};
use engine::mock::MockConnector;
use engine::pool::ConnectionPool;
use engine::value::EngineValue;
use translate::gucs::PersistentVars;
use translate::intercept::{BackupRequest, CreateSubscriptionRequest, ExtensionOps};

use mysqlwire::packets::PacketChannel;
use mysqlwire::session::{MySession, MySessionContext};

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
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
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

fn spawn_session(connector: MockConnector) -> TcpStream {
    let ctx = Arc::new(MySessionContext {
        pool: Arc::new(ConnectionPool::new(Arc::new(connector))),
        vars: Arc::new(StubVars(Mutex::new(HashMap::new()))),
        ops: Arc::new(NoopOps),
        auth: Arc::new(TrustAuthenticator),
        datadir: std::env::temp_dir(),
        catalog: "main".to_string(),
        report_host: String::new(),
        report_port: 3306,
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();

    std::thread::spawn(move || {
        runtime.block_on(async move {
            std_listener.set_nonblocking(true).unwrap();
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            let (socket, _) = listener.accept().await.unwrap();
            let mut session = MySession::new(PacketChannel::new(socket), 5, ctx);
            let _ = session.run().await;
        });
    });

    TcpStream::connect(addr).unwrap()
}

fn read_packet(client: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    client.read_exact(&mut payload).unwrap();
    (header[3], payload)
}

fn write_packet(client: &mut TcpStream, seq: u8, payload: &[u8]) {
    let len = payload.len() as u32;
    let mut frame = vec![
        (len & 0xff) as u8,
        ((len >> 8) & 0xff) as u8,
        ((len >> 16) & 0xff) as u8,
        seq,
    ];
    frame.extend_from_slice(payload);
    client.write_all(&frame).unwrap();
}

/// Greeting, HandshakeResponse41, OK.
fn handshake(client: &mut TcpStream) {
    let (_, greeting) = read_packet(client);
    assert_eq!(greeting[0], 10); // protocol version

    let caps: u32 = 0x0000_0200 | 0x0000_8000 | 0x0008_0000; // 41 + secure + plugin auth
    let mut response = Vec::new();
    response.extend_from_slice(&caps.to_le_bytes());
    response.extend_from_slice(&0u32.to_le_bytes());
    response.push(45);
    response.extend_from_slice(&[0u8; 23]);
    response.extend_from_slice(b"tester\0");
    response.push(0); // empty auth response
    response.extend_from_slice(b"mysql_native_password\0");
    write_packet(client, 1, &response);

    let (_, ok) = read_packet(client);
    assert_eq!(ok[0], 0x00);
}

fn send_query(client: &mut TcpStream, sql: &str) {
    let mut payload = vec![0x03];
    payload.extend_from_slice(sql.as_bytes());
    write_packet(client, 0, &payload);
}

/// Read a text result set, returning the decoded rows.
fn read_result_set(client: &mut TcpStream) -> Vec<Vec<Option<String>>> {
    let (_, header) = read_packet(client);
    let ncols = header[0] as usize;
    for _ in 0..ncols {
        read_packet(client); // column definitions
    }
    let (_, eof) = read_packet(client);
    assert_eq!(eof[0], 0xfe);

    let mut rows = Vec::new();
    loop {
        let (_, payload) = read_packet(client);
        if payload[0] == 0xfe && payload.len() < 9 {
            return rows;
        }
        let mut row = Vec::new();
        let mut pos = 0usize;
        while pos < payload.len() {
            if payload[pos] == 0xfb {
                row.push(None);
                pos += 1;
            } else {
                let len = payload[pos] as usize; // short cells in tests
                row.push(Some(
                    String::from_utf8(payload[pos + 1..pos + 1 + len].to_vec()).unwrap(),
                ));
                pos += 1 + len;
            }
        }
        rows.push(row);
    }
}

#[test]
fn test_handshake_and_query() {
    let connector = MockConnector::new();
    connector.state.lock().unwrap().canned(
        "SELECT 1+1",
        vec![EngineColumn::new("1+1", "INTEGER")],
        vec![vec![EngineValue::Int(2)]],
    );

    let mut client = spawn_session(connector);
    handshake(&mut client);

    send_query(&mut client, "SELECT 1+1");
    let rows = read_result_set(&mut client);
    assert_eq!(rows, vec![vec![Some("2".to_string())]]);
}

#[test]
fn test_ping_and_init_db() {
    let connector = MockConnector::new();
    let state = connector.state.clone();

    let mut client = spawn_session(connector);
    handshake(&mut client);

    write_packet(&mut client, 0, &[0x0e]); // COM_PING
    let (_, ok) = read_packet(&mut client);
    assert_eq!(ok[0], 0x00);

    let mut payload = vec![0x02]; // COM_INIT_DB
    payload.extend_from_slice(b"analytics");
    write_packet(&mut client, 0, &payload);
    let (_, ok) = read_packet(&mut client);
    assert_eq!(ok[0], 0x00);

    // USE runs on the pinned engine connection before the view updates
    let log = state.lock().unwrap().log.clone();
    assert!(log.iter().any(|l| l == "USE \"main\".\"analytics\""));
}

#[test]
fn test_show_create_table_round_trip() {
    let connector = MockConnector::new();
    connector.state.lock().unwrap().meta.insert(
        ("main".to_string(), "t".to_string()),
        vec![
            CatalogColumn {
                name: "id".to_string(),
                type_name: "INTEGER".to_string(),
                nullable: false,
                comment: None,
                primary_key: true,
            },
            CatalogColumn {
                name: "name".to_string(),
                type_name: "VARCHAR".to_string(),
                nullable: true,
                comment: Some(catalog::bridge::encode_type_comment("varchar(64)")),
                primary_key: false,
            },
        ],
    );

    let mut client = spawn_session(connector);
    handshake(&mut client);

    send_query(&mut client, "SHOW CREATE TABLE t");
    let (_, header) = read_packet(&mut client);
    assert_eq!(header[0], 2); // Table, Create Table
    read_packet(&mut client);
    read_packet(&mut client);
    let (_, eof) = read_packet(&mut client);
    assert_eq!(eof[0], 0xfe);

    // the row itself: two lenenc strings
    let (_, row) = read_packet(&mut client);
    let text = String::from_utf8_lossy(&row).into_owned();
    // the comment hint restores the MySQL-side type
    assert!(text.contains("varchar(64)"), "got: {}", text);
    assert!(text.contains("`id` int NOT NULL"));
    assert!(text.contains("PRIMARY KEY (`id`)"));
}

#[test]
fn test_unknown_command_keeps_connection() {
    let connector = MockConnector::new();
    let mut client = spawn_session(connector);
    handshake(&mut client);

    write_packet(&mut client, 0, &[0x77]); // bogus command
    let (_, err) = read_packet(&mut client);
    assert_eq!(err[0], 0xff);

    // connection still serves queries
    send_query(&mut client, "SELECT 1+1");
    let rows = read_result_set(&mut client);
    assert_eq!(rows.len(), 0);
}
