//! Per-connection MySQL session: server-side handshake, COM_* dispatch,
//! text and binary result sets, LOAD DATA LOCAL INFILE through the FIFO
//! loader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use catalog::bridge::{self, infer_fields, infer_result_fields, quote_ident, Field};
use catalog::types::TypeSpec;
use common::auth::{mysql_native_token, Authenticator};
use common::err::server_error::ServerError;
use common::err::SResult;
use common::pipe::PipeFile;
use engine::iface::EnginePrepared;
use engine::pool::{ConnectionPool, PinnedConn};
use engine::value::EngineValue;
use translate::gucs::PersistentVars;
use translate::intercept::ExtensionOps;
use translate::rewrite::rewrite_mysql;

use crate::flags::{
    StatusFlags, COM_FIELD_LIST, COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT, COM_STMT_CLOSE,
    COM_STMT_EXECUTE, COM_STMT_PREPARE, COM_STMT_RESET,
};
use crate::packets::{
    self, parse_execute_params, parse_handshake_response, serialize_binary_row,
    serialize_column_def, serialize_eof, serialize_err, serialize_handshake_v10,
    serialize_local_infile_request, serialize_ok, serialize_text_row, PacketChannel, WireColumn,
};

/// Shared state handed to every MySQL session by the listener.
pub struct MySessionContext {
    pub pool: Arc<ConnectionPool>,
    pub vars: Arc<dyn PersistentVars>,
    pub ops: Arc<dyn ExtensionOps>,
    pub auth: Arc<dyn Authenticator>,
    pub datadir: PathBuf,
    /// Engine catalog the `USE catalog.schema` statements address.
    pub catalog: String,
    /// Replica reporting identity, surfaced through SHOW VARIABLES.
    pub report_host: String,
    pub report_port: u16,
}

struct MyPrepared {
    handle: Box<dyn EnginePrepared>,
    columns: Vec<WireColumn>,
    param_count: usize,
}

pub struct MySession {
    conn_id: u32,
    channel: PacketChannel,
    ctx: Arc<MySessionContext>,
    user: String,
    schema: String,
    autocommit: bool,
    engine: Option<PinnedConn>,
    statements: HashMap<u32, MyPrepared>,
    next_stmt_id: u32,
}

lazy_static! {
    static ref RE_LOAD_DATA: Regex = Regex::new(
        r"(?is)^\s*load\s+data\s+(?P<local>local\s+)?infile\s+'(?P<file>[^']+)'\s+into\s+table\s+(?P<table>[`\w\.]+)"
    )
    .unwrap();
    static ref RE_SET_AUTOCOMMIT: Regex =
        Regex::new(r"(?is)^\s*set\s+(@@)?(session\.)?autocommit\s*=\s*(?P<v>\S+?)\s*;?\s*$")
            .unwrap();
    static ref RE_SET_NAMES: Regex =
        Regex::new(r"(?is)^\s*set\s+names\s+\S+\s*;?\s*$").unwrap();
    static ref RE_SHOW_CREATE: Regex =
        Regex::new(r#"(?is)^\s*show\s+create\s+table\s+(?P<table>[`"\w\.]+)\s*;?\s*$"#).unwrap();
}

impl MySession {
    pub fn new(channel: PacketChannel, conn_id: u32, ctx: Arc<MySessionContext>) -> Self {
        MySession {
            conn_id,
            channel,
            ctx,
            user: String::new(),
            schema: "main".to_string(),
            autocommit: true,
            engine: None,
            statements: HashMap::new(),
            next_stmt_id: 1,
        }
    }

    pub async fn run(&mut self) -> SResult<()> {
        if !self.handshake().await? {
            return Ok(());
        }
        info!(
            "mysql session {} started (user '{}', schema '{}')",
            self.conn_id, self.user, self.schema
        );

        loop {
            let payload = match self.channel.read_packet().await {
                Ok(payload) => payload,
                Err(ServerError::Io(_)) => break,
                Err(err) => return Err(err),
            };
            if payload.is_empty() {
                return Err(ServerError::Protocol("empty command packet".to_string()));
            }
            let command = payload[0];
            let body = &payload[1..];

            let result = match command {
                COM_QUIT => break,
                COM_PING => self.send_ok(0).await,
                COM_INIT_DB => self.on_init_db(body).await,
                COM_QUERY => {
                    let sql = String::from_utf8(body.to_vec())?;
                    self.on_query(&sql).await
                }
                COM_FIELD_LIST => self.on_field_list(body).await,
                COM_STMT_PREPARE => {
                    let sql = String::from_utf8(body.to_vec())?;
                    self.on_stmt_prepare(&sql).await
                }
                COM_STMT_EXECUTE => self.on_stmt_execute(body).await,
                COM_STMT_CLOSE => {
                    if body.len() >= 4 {
                        let stmt_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                        self.statements.remove(&stmt_id);
                    }
                    Ok(()) // no response
                }
                COM_STMT_RESET => self.send_ok(0).await,
                other => {
                    debug!("unsupported command 0x{:02x}", other);
                    self.send_error(&ServerError::Unsupported(format!(
                        "command 0x{:02x}",
                        other
                    )))
                    .await
                }
            };

            if let Err(err) = result {
                if err.closes_connection() {
                    return Err(err);
                }
                self.send_error(&err).await?;
            }
        }

        self.release();
        info!("mysql session {} closed", self.conn_id);
        Ok(())
    }

    pub fn release(&mut self) {
        self.engine = None;
        self.ctx.pool.release(self.conn_id);
    }

    async fn handshake(&mut self) -> SResult<bool> {
        let mut scramble = [0u8; 20];
        rand::thread_rng().fill(&mut scramble);
        // the scramble bytes must be non-zero on the wire
        for b in scramble.iter_mut() {
            if *b == 0 {
                *b = 1;
            }
        }

        let greeting = serialize_handshake_v10(self.conn_id, &scramble, self.status());
        self.channel.write_packet(&greeting).await?;
        self.channel.flush().await?;

        let payload = self.channel.read_packet().await?;
        let response = parse_handshake_response(&payload)?;
        self.user = response.username.clone();

        let authorized = match self.ctx.auth.password_of(&self.user) {
            None => self.ctx.auth.verify(&self.user, ""),
            Some(password) => {
                let expected = mysql_native_token(&password, &scramble);
                response.auth_response == expected
            }
        };
        if !authorized {
            let err = ServerError::AuthFailed(self.user.clone());
            let (errno, state) = err.mysql_code();
            self.channel
                .write_packet(&serialize_err(errno, state, &err.to_string()))
                .await?;
            self.channel.flush().await?;
            return Ok(false);
        }

        if let Some(database) = &response.database {
            self.schema = database.clone();
        }
        match self.ctx.pool.acquire(self.conn_id, &self.schema) {
            Ok(conn) => self.engine = Some(conn),
            Err(_) => {
                let err = ServerError::UnknownDatabase(self.schema.clone());
                let (errno, state) = err.mysql_code();
                self.channel
                    .write_packet(&serialize_err(errno, state, &err.to_string()))
                    .await?;
                self.channel.flush().await?;
                return Ok(false);
            }
        }

        self.send_ok(0).await?;
        Ok(true)
    }

    fn engine(&self) -> SResult<PinnedConn> {
        self.engine
            .clone()
            .ok_or_else(|| ServerError::Engine("no engine connection".to_string()))
    }

    fn status(&self) -> StatusFlags {
        let mut status = StatusFlags::empty();
        if self.autocommit {
            status |= StatusFlags::SERVER_STATUS_AUTOCOMMIT;
        }
        if let Some(conn) = &self.engine {
            if let Ok(guard) = conn.try_lock() {
                if guard.in_transaction() {
                    status |= StatusFlags::SERVER_STATUS_IN_TRANS;
                }
            }
        }
        status
    }

    async fn send_ok(&mut self, affected: u64) -> SResult<()> {
        let ok = serialize_ok(affected, 0, self.status());
        self.channel.write_packet(&ok).await?;
        self.channel.flush().await
    }

    async fn send_error(&mut self, err: &ServerError) -> SResult<()> {
        let (errno, state) = err.mysql_code();
        self.channel
            .write_packet(&serialize_err(errno, state, &err.to_string()))
            .await?;
        self.channel.flush().await
    }

    async fn send_result_set(
        &mut self,
        columns: &[WireColumn],
        rows: &[Vec<EngineValue>],
    ) -> SResult<()> {
        let mut header = Vec::new();
        packets::write_lenenc_int(&mut header, columns.len() as u64);
        self.channel.write_packet(&header).await?;
        for column in columns {
            let def = serialize_column_def(column);
            self.channel.write_packet(&def).await?;
        }
        self.channel
            .write_packet(&serialize_eof(self.status()))
            .await?;
        for row in rows {
            self.channel.write_packet(&serialize_text_row(row)).await?;
        }
        self.channel
            .write_packet(&serialize_eof(self.status()))
            .await?;
        self.channel.flush().await
    }

    async fn on_init_db(&mut self, body: &[u8]) -> SResult<()> {
        let schema = String::from_utf8(body.to_vec())?;
        // the engine view changes first so a failure leaves ours untouched
        let conn = self.engine()?;
        {
            let mut guard = conn.lock().await;
            guard.execute(&format!(
                "USE {}.{}",
                quote_ident(&self.ctx.catalog),
                quote_ident(&schema)
            ))?;
        }
        self.schema = schema;
        self.send_ok(0).await
    }

    async fn on_query(&mut self, sql: &str) -> SResult<()> {
        let trimmed = sql.trim().trim_end_matches(';');

        if let Some(caps) = RE_LOAD_DATA.captures(trimmed) {
            let local = caps.name("local").is_some();
            if !local {
                return Err(ServerError::Unsupported(
                    "LOAD DATA without LOCAL".to_string(),
                ));
            }
            let file = caps["file"].to_string();
            let table = caps["table"].replace('`', "");
            return self.load_data_local(&file, &table).await;
        }

        if let Some(caps) = RE_SET_AUTOCOMMIT.captures(trimmed) {
            let raw = caps["v"].to_ascii_lowercase();
            self.autocommit = matches!(raw.as_str(), "1" | "on" | "true");
            return self.send_ok(0).await;
        }
        if RE_SET_NAMES.is_match(trimmed) {
            return self.send_ok(0).await;
        }
        if let Some(caps) = RE_SHOW_CREATE.captures(trimmed) {
            return self.show_create_table(&caps["table"].replace(['`', '"'], "")).await;
        }

        match translate::intercept::inspect(trimmed) {
            Some(translate::intercept::Intercepted::Backup(request)) => {
                self.ctx.ops.backup(&request)?;
                return self.send_ok(0).await;
            }
            Some(translate::intercept::Intercepted::CreateSubscription(request)) => {
                self.ctx.ops.create_subscription(&request)?;
                return self.send_ok(0).await;
            }
            _ => {}
        }

        let upper = first_keyword(trimmed);
        match upper.as_str() {
            "USE" => {
                let schema = trimmed[3..].trim().replace(['`', '"'], "").into_bytes();
                return self.on_init_db(&schema).await;
            }
            "SHOW" => {
                if let Some(result) = self.show_statement(trimmed).await? {
                    return result;
                }
            }
            "BEGIN" | "START" => {
                let conn = self.engine()?;
                let mut guard = conn.lock().await;
                if !guard.in_transaction() {
                    guard.begin()?;
                }
                drop(guard);
                return self.send_ok(0).await;
            }
            "COMMIT" => {
                let conn = self.engine()?;
                let mut guard = conn.lock().await;
                if guard.in_transaction() {
                    guard.commit()?;
                }
                drop(guard);
                return self.send_ok(0).await;
            }
            "ROLLBACK" => {
                let conn = self.engine()?;
                let mut guard = conn.lock().await;
                if guard.in_transaction() {
                    guard.rollback()?;
                }
                drop(guard);
                return self.send_ok(0).await;
            }
            "SET" => {
                if let Some(translate::intercept::Intercepted::SetVar {
                    name,
                    value,
                    persist,
                }) = translate::intercept::inspect(trimmed)
                {
                    if persist {
                        self.ctx.vars.set(&name, &value, "string")?;
                    }
                    return self.send_ok(0).await;
                }
                // unrecognized SETs are accepted and dropped, matching the
                // compatibility expectations of common clients
                return self.send_ok(0).await;
            }
            _ => {}
        }

        // single-statement atomicity with autocommit off means the engine
        // transaction starts with the first statement
        if !self.autocommit {
            let conn = self.engine()?;
            let mut guard = conn.lock().await;
            if !guard.in_transaction() {
                guard.execute("BEGIN READ ONLY")?;
            }
        }

        let rewritten = rewrite_mysql(trimmed);
        if is_row_returning(&upper) {
            let conn = self.engine()?;
            let mut guard = conn.lock().await;
            let mut engine_rows = guard.query(&rewritten)?;
            let fields = infer_result_fields(engine_rows.columns())?;
            let columns = result_columns(&fields);
            let mut rows = Vec::new();
            while let Some(row) = engine_rows.next_row()? {
                rows.push(row);
            }
            drop(engine_rows);
            drop(guard);
            self.send_result_set(&columns, &rows).await
        } else {
            let conn = self.engine()?;
            let mut guard = conn.lock().await;
            let affected = guard.execute(&rewritten)?;
            drop(guard);
            self.send_ok(affected).await
        }
    }

    /// SHOW forms answered from the catalog bridge. Returns None when the
    /// statement should fall through to the engine.
    async fn show_statement(&mut self, sql: &str) -> SResult<Option<SResult<()>>> {
        let lower = sql.to_ascii_lowercase();
        if lower.starts_with("show databases") || lower.starts_with("show schemas") {
            let conn = self.engine()?;
            let schemas = {
                let mut guard = conn.lock().await;
                guard.schemas()?
            };
            let columns = vec![WireColumn::result("Database", TypeSpec::Varchar)];
            let rows: Vec<Vec<EngineValue>> = schemas
                .into_iter()
                .filter(|s| !s.starts_with("__"))
                .map(|s| vec![EngineValue::Text(s)])
                .collect();
            return Ok(Some(self.send_result_set(&columns, &rows).await));
        }
        if lower.starts_with("show tables") {
            let conn = self.engine()?;
            let tables = {
                let mut guard = conn.lock().await;
                guard.tables(&self.schema)?
            };
            let columns = vec![WireColumn::result(
                &format!("Tables_in_{}", self.schema),
                TypeSpec::Varchar,
            )];
            let rows: Vec<Vec<EngineValue>> = tables
                .into_iter()
                .map(|t| vec![EngineValue::Text(t)])
                .collect();
            return Ok(Some(self.send_result_set(&columns, &rows).await));
        }
        if lower.starts_with("show variables") {
            let columns = vec![
                WireColumn::result("Variable_name", TypeSpec::Varchar),
                WireColumn::result("Value", TypeSpec::Varchar),
            ];
            let mut rows: Vec<Vec<EngineValue>> = vec![
                vec![
                    EngineValue::Text("autocommit".to_string()),
                    EngineValue::Text(if self.autocommit { "ON" } else { "OFF" }.to_string()),
                ],
                vec![
                    EngineValue::Text("version".to_string()),
                    EngineValue::Text(packets::SERVER_VERSION.to_string()),
                ],
            ];
            if !self.ctx.report_host.is_empty() {
                rows.push(vec![
                    EngineValue::Text("report_host".to_string()),
                    EngineValue::Text(self.ctx.report_host.clone()),
                ]);
                rows.push(vec![
                    EngineValue::Text("report_port".to_string()),
                    EngineValue::Text(self.ctx.report_port.to_string()),
                ]);
            }
            for (name, value) in self.ctx.vars.all() {
                rows.push(vec![EngineValue::Text(name), EngineValue::Text(value)]);
            }
            return Ok(Some(self.send_result_set(&columns, &rows).await));
        }
        Ok(None)
    }

    async fn show_create_table(&mut self, table_ref: &str) -> SResult<()> {
        let (schema, table) = match table_ref.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => (self.schema.clone(), table_ref.to_string()),
        };
        let conn = self.engine()?;
        let ddl = {
            let mut guard = conn.lock().await;
            bridge::show_create_table(guard.as_mut(), &schema, &table)?
        };
        let columns = vec![
            WireColumn::result("Table", TypeSpec::Varchar),
            WireColumn::result("Create Table", TypeSpec::Varchar),
        ];
        let rows = vec![vec![
            EngineValue::Text(table),
            EngineValue::Text(ddl),
        ]];
        self.send_result_set(&columns, &rows).await
    }

    async fn on_field_list(&mut self, body: &[u8]) -> SResult<()> {
        let table = body
            .split(|b| *b == 0)
            .next()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let conn = self.engine()?;
        let fields = {
            let mut guard = conn.lock().await;
            let columns = guard.table_columns(&self.schema, &table)?;
            infer_fields(&columns)?
        };
        for field in &fields {
            let column = WireColumn {
                schema: self.schema.clone(),
                table: table.clone(),
                name: field.name.clone(),
                spec: field.spec,
                not_null: !field.nullable,
                primary_key: field.primary_key,
            };
            let def = serialize_column_def(&column);
            self.channel.write_packet(&def).await?;
        }
        self.channel
            .write_packet(&serialize_eof(self.status()))
            .await?;
        self.channel.flush().await
    }

    //////////////////////
    // Prepared statements
    //////////////////////

    async fn on_stmt_prepare(&mut self, sql: &str) -> SResult<()> {
        let rewritten = rewrite_mysql(sql.trim());
        let conn = self.engine()?;
        let handle = {
            let mut guard = conn.lock().await;
            guard.prepare(&rewritten)?
        };
        let fields = infer_result_fields(handle.columns())?;
        let columns = result_columns(&fields);
        let param_count = handle.parameter_count();
        let stmt_id = self.next_stmt_id;
        self.next_stmt_id += 1;

        let mut header = vec![0x00];
        header.extend_from_slice(&stmt_id.to_le_bytes());
        header.extend_from_slice(&(columns.len() as u16).to_le_bytes());
        header.extend_from_slice(&(param_count as u16).to_le_bytes());
        header.push(0);
        header.extend_from_slice(&0u16.to_le_bytes()); // warnings
        self.channel.write_packet(&header).await?;

        if param_count > 0 {
            for idx in 0..param_count {
                let column = WireColumn::result(&format!("?{}", idx + 1), TypeSpec::Varchar);
                let def = serialize_column_def(&column);
                self.channel.write_packet(&def).await?;
            }
            self.channel
                .write_packet(&serialize_eof(self.status()))
                .await?;
        }
        if !columns.is_empty() {
            for column in &columns {
                let def = serialize_column_def(column);
                self.channel.write_packet(&def).await?;
            }
            self.channel
                .write_packet(&serialize_eof(self.status()))
                .await?;
        }
        self.channel.flush().await?;

        self.statements.insert(
            stmt_id,
            MyPrepared {
                handle,
                columns,
                param_count,
            },
        );
        Ok(())
    }

    async fn on_stmt_execute(&mut self, body: &[u8]) -> SResult<()> {
        let stmt_id = if body.len() >= 4 {
            u32::from_le_bytes([body[0], body[1], body[2], body[3]])
        } else {
            return Err(ServerError::Protocol("short COM_STMT_EXECUTE".to_string()));
        };
        let param_count = self
            .statements
            .get(&stmt_id)
            .map(|s| s.param_count)
            .ok_or_else(|| {
                ServerError::sql("HY000", format!("unknown statement id {}", stmt_id))
            })?;
        let (_, params) = parse_execute_params(body, param_count)?;

        let stmt = self.statements.get_mut(&stmt_id).unwrap();
        if stmt.columns.is_empty() {
            let affected = stmt.handle.execute(&params)?;
            return self.send_ok(affected).await;
        }

        let mut engine_rows = stmt.handle.query(&params)?;
        let columns = stmt.columns.clone();
        let mut rows = Vec::new();
        while let Some(row) = engine_rows.next_row()? {
            rows.push(row);
        }
        drop(engine_rows);

        let mut header = Vec::new();
        packets::write_lenenc_int(&mut header, columns.len() as u64);
        self.channel.write_packet(&header).await?;
        for column in &columns {
            let def = serialize_column_def(column);
            self.channel.write_packet(&def).await?;
        }
        self.channel
            .write_packet(&serialize_eof(self.status()))
            .await?;
        for row in &rows {
            let encoded = serialize_binary_row(&columns, row)?;
            self.channel.write_packet(&encoded).await?;
        }
        self.channel
            .write_packet(&serialize_eof(self.status()))
            .await?;
        self.channel.flush().await
    }

    //////////////////////
    // LOAD DATA LOCAL INFILE
    //////////////////////

    async fn load_data_local(&mut self, file: &str, table: &str) -> SResult<()> {
        let pipe = PipeFile::create(&self.ctx.datadir, "loaddata")?;
        let (schema, table) = match table.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => (self.schema.clone(), table.to_string()),
        };
        let target = format!("{}.{}", quote_ident(&schema), quote_ident(&table));
        let engine_sql = format!(
            "COPY {} FROM '{}' (FORMAT CSV, DELIMITER '\\t', HEADER false, NULL '\\N')",
            target,
            pipe.path_string().replace('\'', "''"),
        );

        // the engine's bulk load reads the pipe while packets stream into it
        let conn = self.engine()?;
        let loader_conn = conn.clone();
        let loader = tokio::task::spawn_blocking(move || -> SResult<u64> {
            let mut guard = loader_conn.blocking_lock();
            guard.execute(&engine_sql)
        });

        let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
        let write_path = pipe.path().to_path_buf();
        let writer = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().write(true).open(&write_path)?;
            let mut rx = rx;
            while let Some(chunk) = rx.blocking_recv() {
                file.write_all(&chunk)?;
            }
            file.flush()?;
            Ok(())
        });

        self.channel
            .write_packet(&serialize_local_infile_request(file))
            .await?;
        self.channel.flush().await?;

        loop {
            let payload = self.channel.read_packet().await?;
            if payload.is_empty() {
                break; // end of file content
            }
            if tx.send(payload).await.is_err() {
                break;
            }
        }
        drop(tx);

        writer
            .await
            .map_err(|err| ServerError::Engine(format!("load writer panicked: {}", err)))?
            .map_err(ServerError::Io)?;
        let affected = loader
            .await
            .map_err(|err| ServerError::Engine(format!("load reader panicked: {}", err)))??;
        drop(pipe);

        self.send_ok(affected).await
    }
}

fn first_keyword(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

fn is_row_returning(keyword: &str) -> bool {
    matches!(
        keyword,
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC" | "PRAGMA"
    )
}

fn result_columns(fields: &[Field]) -> Vec<WireColumn> {
    fields
        .iter()
        .map(|field| WireColumn {
            schema: String::new(),
            table: String::new(),
            name: field.name.clone(),
            spec: field.spec,
            not_null: !field.nullable,
            primary_key: field.primary_key,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::{first_keyword, is_row_returning};

    #[test]
    fn test_keywords() {
        assert_eq!(first_keyword("select * from t"), "SELECT");
        assert_eq!(first_keyword("  Insert into t values (1)"), "INSERT");
        assert!(is_row_returning("SELECT"));
        assert!(is_row_returning("SHOW"));
        assert!(!is_row_returning("INSERT"));
    }
}
