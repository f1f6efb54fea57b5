//! Per-connection PostgreSQL session: startup, simple and extended query,
//! COPY in both directions, multiplexed onto the pinned engine connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_native_tls::TlsAcceptor;
use tracing::{debug, info};

use catalog::bridge::{infer_fields, infer_result_fields, quote_ident, Field};
use catalog::types::TypeSpec;
use common::err::server_error::ServerError;
use common::err::SResult;
use common::pipe::PipeFile;
use engine::iface::{EnginePrepared, EngineRows};
use engine::pool::{ConnectionPool, PinnedConn};
use engine::value::EngineValue;
use translate::gucs::{Gucs, PersistentVars};
use translate::intercept::{self, ExtensionOps, Intercepted, SyntheticResult};
use translate::rewrite::rewrite_pg;

use common::auth::{AuthDecision, Authenticator};
use crate::codec::PgChannel;
use crate::copy::{self, CopyDirection, CopyLoader, CopyStatement};
use crate::messages::{self, FieldDescription, FrontendMessage, StartupAction};

/// Shared state handed to every session by the listener.
pub struct SessionContext {
    pub pool: Arc<ConnectionPool>,
    pub vars: Arc<dyn PersistentVars>,
    pub ops: Arc<dyn ExtensionOps>,
    pub auth: Arc<dyn Authenticator>,
    pub datadir: PathBuf,
    pub tls: Option<TlsAcceptor>,
}

pub struct PreparedStatement {
    pub sql: String,
    pub tag: String,
    pub empty: bool,
    pub intercepted: Option<Intercepted>,
    pub handle: Option<Box<dyn EnginePrepared>>,
    pub param_oids: Vec<u32>,
    pub fields: Vec<Field>,
}

pub struct Portal {
    pub statement: String,
    pub params: Vec<EngineValue>,
    pub result_formats: Vec<i16>,
    /// Open row stream of a suspended portal.
    pub rows: Option<Box<dyn EngineRows>>,
    pub rows_sent: u64,
}

pub struct PgSession {
    conn_id: u32,
    channel: PgChannel,
    out: BytesMut,
    ctx: Arc<SessionContext>,
    user: String,
    database: String,
    gucs: Gucs,
    secret: u32,
    engine: Option<PinnedConn>,
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
    txn_failed: bool,
}

impl PgSession {
    pub fn new(channel: PgChannel, conn_id: u32, ctx: Arc<SessionContext>) -> Self {
        PgSession {
            conn_id,
            channel,
            out: BytesMut::new(),
            ctx,
            user: String::new(),
            database: "main".to_string(),
            gucs: Gucs::new(),
            secret: rand::thread_rng().gen(),
            engine: None,
            statements: HashMap::new(),
            portals: HashMap::new(),
            txn_failed: false,
        }
    }

    /// Session task body. Errors returned here terminate the connection;
    /// everything recoverable is reported inline.
    pub async fn run(&mut self) -> SResult<()> {
        if !self.startup().await? {
            return Ok(());
        }
        info!(
            "pg session {} started (user '{}', database '{}')",
            self.conn_id, self.user, self.database
        );

        let mut discard_until_sync = false;
        loop {
            let (tag, payload) = match self.channel.read_frame().await {
                Ok(frame) => frame,
                Err(ServerError::Io(_)) => break, // client went away
                Err(err) => return Err(err),
            };
            let message = messages::parse_frontend(tag, &payload)?;

            if discard_until_sync
                && !matches!(message, FrontendMessage::Sync | FrontendMessage::Terminate)
            {
                continue;
            }

            match message {
                FrontendMessage::Terminate => break,
                FrontendMessage::Query(sql) => {
                    self.handle_query(&sql).await?;
                }
                FrontendMessage::Sync => {
                    discard_until_sync = false;
                    self.end_extended_sequence();
                    self.ready_for_query();
                    self.flush().await?;
                }
                FrontendMessage::Flush => {
                    self.flush().await?;
                }
                FrontendMessage::Parse {
                    name,
                    sql,
                    param_oids,
                } => {
                    if let Err(err) = self.on_parse(&name, &sql, param_oids) {
                        discard_until_sync = self.report_extended_error(err).await?;
                    }
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                } => {
                    if let Err(err) =
                        self.on_bind(&portal, &statement, &param_formats, params, result_formats)
                    {
                        discard_until_sync = self.report_extended_error(err).await?;
                    }
                }
                FrontendMessage::Describe { kind, name } => {
                    if let Err(err) = self.on_describe(kind, &name) {
                        discard_until_sync = self.report_extended_error(err).await?;
                    }
                }
                FrontendMessage::Execute { portal, max_rows } => {
                    if let Err(err) = self.on_execute(&portal, max_rows).await {
                        if err.closes_connection() {
                            return Err(err);
                        }
                        discard_until_sync = self.report_extended_error(err).await?;
                    }
                }
                FrontendMessage::Close { kind, name } => {
                    if let Err(err) = self.on_close(kind, &name) {
                        discard_until_sync = self.report_extended_error(err).await?;
                    }
                }
                FrontendMessage::CopyData(_)
                | FrontendMessage::CopyDone
                | FrontendMessage::CopyFail(_) => {
                    // copy sub-protocol outside a COPY; drop per protocol
                }
                FrontendMessage::PasswordMessage(_) => {
                    return Err(ServerError::Protocol(
                        "unexpected password message".to_string(),
                    ));
                }
            }
        }

        self.release();
        info!("pg session {} closed", self.conn_id);
        Ok(())
    }

    pub fn release(&mut self) {
        self.engine = None;
        self.ctx.pool.release(self.conn_id);
    }

    /// Startup negotiation. Returns false when the connection was a cancel
    /// request or failed authentication.
    async fn startup(&mut self) -> SResult<bool> {
        let params = loop {
            let payload = self.channel.read_startup_frame().await?;
            match messages::parse_startup(&payload)? {
                StartupAction::SslRequest => {
                    if let Some(tls) = self.ctx.tls.clone() {
                        self.channel.write_byte(b'S').await?;
                        self.channel.upgrade_tls(&tls).await?;
                    } else {
                        self.channel.write_byte(b'N').await?;
                    }
                }
                StartupAction::GssEncRequest => {
                    self.channel.write_byte(b'N').await?;
                }
                StartupAction::CancelRequest { pid, secret } => {
                    // best-effort: a pinned engine connection has no portable
                    // interrupt; log and drop the request connection
                    debug!("cancel request for backend {} (secret {:08x})", pid, secret);
                    return Ok(false);
                }
                StartupAction::Startup(params) => break params,
            }
        };

        self.user = params
            .get("user")
            .cloned()
            .ok_or_else(|| ServerError::Protocol("startup without user".to_string()))?;
        self.database = params
            .get("database")
            .cloned()
            .unwrap_or_else(|| self.user.clone());

        match self.ctx.auth.decision(&self.user) {
            AuthDecision::Trust => {}
            AuthDecision::CleartextPassword => {
                messages::authentication_cleartext(&mut self.out);
                self.flush().await?;
                let (tag, payload) = self.channel.read_frame().await?;
                let FrontendMessage::PasswordMessage(password) =
                    messages::parse_frontend(tag, &payload)?
                else {
                    return Err(ServerError::Protocol(
                        "expected password message".to_string(),
                    ));
                };
                if !self.ctx.auth.verify(&self.user, &password) {
                    let err = ServerError::AuthFailed(self.user.clone());
                    self.fatal_error(&err).await?;
                    return Ok(false);
                }
            }
        }

        match self.ctx.pool.acquire(self.conn_id, &self.database) {
            Ok(conn) => self.engine = Some(conn),
            Err(_) => {
                let err = ServerError::UnknownDatabase(self.database.clone());
                self.fatal_error(&err).await?;
                return Ok(false);
            }
        }

        messages::authentication_ok(&mut self.out);
        for name in [
            "server_version",
            "server_encoding",
            "client_encoding",
            "datestyle",
            "integer_datetimes",
            "standard_conforming_strings",
        ] {
            if let Some(value) = self.gucs.get(name) {
                messages::parameter_status(&mut self.out, name, &value);
            }
        }
        messages::backend_key_data(&mut self.out, self.conn_id, self.secret);
        self.ready_for_query();
        self.flush().await?;
        Ok(true)
    }

    fn engine(&self) -> SResult<PinnedConn> {
        self.engine
            .clone()
            .ok_or_else(|| ServerError::Engine("no engine connection".to_string()))
    }

    async fn flush(&mut self) -> SResult<()> {
        self.channel.flush_out(&mut self.out).await
    }

    pub async fn fatal_error(&mut self, err: &ServerError) -> SResult<()> {
        messages::error_response(&mut self.out, "FATAL", err.pg_code(), &err.to_string());
        self.flush().await
    }

    fn ready_for_query(&mut self) {
        let status = if self.txn_failed {
            messages::TXN_FAILED
        } else if self.in_transaction() {
            messages::TXN_OPEN
        } else {
            messages::TXN_IDLE
        };
        messages::ready_for_query(&mut self.out, status);
    }

    fn in_transaction(&self) -> bool {
        match &self.engine {
            Some(conn) => match conn.try_lock() {
                Ok(guard) => guard.in_transaction(),
                Err(_) => true, // a statement is mid-flight
            },
            None => false,
        }
    }

    /// Report an error inside an extended-query sequence and start the
    /// drain-until-Sync behavior.
    async fn report_extended_error(&mut self, err: ServerError) -> SResult<bool> {
        if self.in_transaction() {
            self.txn_failed = true;
        }
        messages::error_response(&mut self.out, "ERROR", err.pg_code(), &err.to_string());
        self.flush().await?;
        Ok(true)
    }

    fn end_extended_sequence(&mut self) {
        // the unnamed portal lives until Sync; named ones until txn end
        self.portals.remove("");
        if !self.in_transaction() {
            self.portals.clear();
        }
    }

    //////////////////////
    // Simple query
    //////////////////////

    async fn handle_query(&mut self, sql: &str) -> SResult<()> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            messages::empty_query_response(&mut self.out);
            self.ready_for_query();
            return self.flush().await;
        }

        for statement in statements {
            match self.execute_simple(&statement).await {
                Ok(()) => {}
                Err(err) if err.closes_connection() => return Err(err),
                Err(err) => {
                    if self.in_transaction() {
                        self.txn_failed = true;
                    }
                    messages::error_response(
                        &mut self.out,
                        "ERROR",
                        err.pg_code(),
                        &err.to_string(),
                    );
                    break;
                }
            }
        }
        self.ready_for_query();
        self.flush().await
    }

    async fn execute_simple(&mut self, sql: &str) -> SResult<()> {
        if self.txn_failed && !is_txn_exit(sql) {
            return Err(ServerError::sql(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        if let Some(parsed) = copy::parse_copy(sql) {
            let stmt = parsed?;
            return match stmt.direction {
                CopyDirection::FromStdin => self.copy_in(stmt).await,
                CopyDirection::ToStdout => self.copy_out(stmt).await,
            };
        }

        if let Some(intercepted) = intercept::inspect(sql) {
            let result = self.answer_intercepted(&intercepted)?;
            self.send_synthetic(&result);
            return Ok(());
        }

        let tag = statement_tag(sql);
        match tag.as_str() {
            "BEGIN" => {
                let conn = self.engine()?;
                let mut guard = conn.lock().await;
                if !guard.in_transaction() {
                    guard.begin()?;
                }
                drop(guard);
                messages::command_complete(&mut self.out, "BEGIN");
                Ok(())
            }
            "COMMIT" | "ROLLBACK" => {
                let conn = self.engine()?;
                let mut guard = conn.lock().await;
                if guard.in_transaction() {
                    if tag == "COMMIT" && !self.txn_failed {
                        guard.commit()?;
                    } else {
                        guard.rollback()?;
                    }
                }
                drop(guard);
                self.txn_failed = false;
                self.portals.clear();
                messages::command_complete(&mut self.out, &tag);
                Ok(())
            }
            _ => {
                let rewritten = rewrite_pg(sql);
                if is_row_returning(&tag) {
                    self.run_query_to_wire(&rewritten, &tag).await
                } else {
                    let conn = self.engine()?;
                    let mut guard = conn.lock().await;
                    let affected = guard.execute(&rewritten)?;
                    drop(guard);
                    messages::command_complete(&mut self.out, &complete_tag(&tag, affected));
                    Ok(())
                }
            }
        }
    }

    async fn run_query_to_wire(&mut self, sql: &str, tag: &str) -> SResult<()> {
        let conn = self.engine()?;
        let mut guard = conn.lock().await;
        let mut rows = guard.query(sql)?;
        let fields = infer_result_fields(rows.columns())?;
        messages::row_description(&mut self.out, &wire_fields(&fields, &[]));

        let mut count = 0u64;
        loop {
            let Some(row) = rows.next_row()? else { break };
            let cells = encode_row(&fields, &row, &[])?;
            messages::data_row(&mut self.out, &cells);
            count += 1;
        }
        drop(rows);
        drop(guard);
        messages::command_complete(&mut self.out, &complete_tag(tag, count));
        Ok(())
    }

    fn answer_intercepted(&mut self, intercepted: &Intercepted) -> SResult<SyntheticResult> {
        match intercepted {
            Intercepted::RecoveryProbe => Ok(SyntheticResult::recovery_probe()),
            Intercepted::WalLsnProbe => Ok(SyntheticResult::wal_probe(self.ctx.ops.wal_position())),
            Intercepted::ShowVar(name) => {
                let value = self
                    .gucs
                    .get(name)
                    .or_else(|| self.ctx.vars.get(name))
                    .unwrap_or_default();
                Ok(SyntheticResult::single_text(name, &value, "SHOW"))
            }
            Intercepted::ShowAll => Ok(SyntheticResult::show_all(self.gucs.show_all())),
            Intercepted::SetVar {
                name,
                value,
                persist,
            } => {
                if *persist {
                    self.ctx.vars.set(name, value, "string")?;
                }
                self.gucs.set(name, value);
                Ok(SyntheticResult::command("SET"))
            }
            Intercepted::ResetVar(name) => {
                self.gucs.reset(name);
                Ok(SyntheticResult::command("RESET"))
            }
            Intercepted::SetIsolation => Ok(SyntheticResult::command("SET")),
            Intercepted::Backup(request) => {
                self.ctx.ops.backup(request)?;
                Ok(SyntheticResult::command("BACKUP"))
            }
            Intercepted::CreateSubscription(request) => {
                self.ctx.ops.create_subscription(request)?;
                Ok(SyntheticResult::command("CREATE SUBSCRIPTION"))
            }
        }
    }

    fn send_synthetic(&mut self, result: &SyntheticResult) {
        if !result.columns.is_empty() {
            let fields: Vec<FieldDescription> = result
                .columns
                .iter()
                .map(|c| {
                    let spec =
                        TypeSpec::from_engine_name(&c.type_name).unwrap_or(TypeSpec::Varchar);
                    FieldDescription {
                        name: c.name.clone(),
                        type_oid: spec.pg_oid(),
                        typlen: spec.pg_typlen(),
                        format: 0,
                    }
                })
                .collect();
            messages::row_description(&mut self.out, &fields);
            for row in &result.rows {
                let cells: Vec<Option<Vec<u8>>> = row
                    .iter()
                    .map(|v| v.render_text().map(String::into_bytes))
                    .collect();
                messages::data_row(&mut self.out, &cells);
            }
        }
        messages::command_complete(&mut self.out, &result.tag);
    }

    //////////////////////
    // Extended query
    //////////////////////

    fn on_parse(&mut self, name: &str, sql: &str, param_oids: Vec<u32>) -> SResult<()> {
        // the unnamed statement does not survive any subsequent Parse
        self.statements.remove("");
        if !name.is_empty() && self.statements.contains_key(name) {
            return Err(ServerError::sql(
                "42P05",
                format!("prepared statement \"{}\" already exists", name),
            ));
        }

        let trimmed = sql.trim();
        let statement = if trimmed.is_empty() {
            PreparedStatement {
                sql: String::new(),
                tag: String::new(),
                empty: true,
                intercepted: None,
                handle: None,
                param_oids,
                fields: vec![],
            }
        } else if let Some(intercepted) = intercept::inspect(trimmed) {
            let fields = fields_for_intercepted(&intercepted);
            PreparedStatement {
                sql: trimmed.to_string(),
                tag: statement_tag(trimmed),
                empty: false,
                intercepted: Some(intercepted),
                handle: None,
                param_oids,
                fields,
            }
        } else {
            let rewritten = rewrite_pg(trimmed);
            let conn = self.engine()?;
            let mut guard = conn
                .try_lock()
                .map_err(|_| ServerError::Engine("engine connection busy".to_string()))?;
            let handle = guard.prepare(&rewritten)?;
            drop(guard);

            let mut param_oids = param_oids;
            while param_oids.len() < handle.parameter_count() {
                param_oids.push(catalog::types::pg_oid::TEXT);
            }
            let fields = infer_result_fields(handle.columns())?;
            PreparedStatement {
                sql: rewritten,
                tag: statement_tag(trimmed),
                empty: false,
                intercepted: None,
                handle: Some(handle),
                param_oids,
                fields,
            }
        };

        self.statements.insert(name.to_string(), statement);
        messages::parse_complete(&mut self.out);
        Ok(())
    }

    fn on_bind(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: &[i16],
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> SResult<()> {
        let stmt = self.statements.get(statement).ok_or_else(|| {
            ServerError::sql(
                "26000",
                format!("prepared statement \"{}\" does not exist", statement),
            )
        })?;

        let mut decoded = Vec::with_capacity(params.len());
        for (idx, param) in params.into_iter().enumerate() {
            let oid = stmt.param_oids.get(idx).copied().unwrap_or(0);
            let spec = if oid == 0 {
                TypeSpec::Varchar
            } else {
                TypeSpec::from_pg_oid(oid)?
            };
            let value = match param {
                None => EngineValue::Null,
                Some(bytes) => match resolve_format(param_formats, idx) {
                    0 => spec.decode_text(std::str::from_utf8(&bytes)?)?,
                    1 => decode_binary_param(&spec, &bytes)?,
                    other => {
                        return Err(ServerError::Protocol(format!(
                            "unknown parameter format {}",
                            other
                        )))
                    }
                },
            };
            decoded.push(value);
        }

        // the unnamed portal is destroyed by the next Bind
        self.portals.insert(
            portal.to_string(),
            Portal {
                statement: statement.to_string(),
                params: decoded,
                result_formats,
                rows: None,
                rows_sent: 0,
            },
        );
        messages::bind_complete(&mut self.out);
        Ok(())
    }

    fn on_describe(&mut self, kind: u8, name: &str) -> SResult<()> {
        match kind {
            b'S' => {
                let stmt = self.statements.get(name).ok_or_else(|| {
                    ServerError::sql(
                        "26000",
                        format!("prepared statement \"{}\" does not exist", name),
                    )
                })?;
                messages::parameter_description(&mut self.out, &stmt.param_oids);
                if stmt.fields.is_empty() {
                    messages::no_data(&mut self.out);
                } else {
                    // format codes are unknown before Bind and forced to zero
                    let fields = wire_fields(&stmt.fields, &[]);
                    messages::row_description(&mut self.out, &fields);
                }
                Ok(())
            }
            b'P' => {
                let portal = self.portals.get(name).ok_or_else(|| {
                    ServerError::sql("34000", format!("portal \"{}\" does not exist", name))
                })?;
                let stmt = self.statements.get(&portal.statement).ok_or_else(|| {
                    ServerError::sql("26000", "portal references a closed statement")
                })?;
                if stmt.fields.is_empty() {
                    messages::no_data(&mut self.out);
                } else {
                    let fields = wire_fields(&stmt.fields, &portal.result_formats);
                    messages::row_description(&mut self.out, &fields);
                }
                Ok(())
            }
            other => Err(ServerError::Protocol(format!(
                "bad describe kind 0x{:02x}",
                other
            ))),
        }
    }

    async fn on_execute(&mut self, portal_name: &str, max_rows: i32) -> SResult<()> {
        if !self.portals.contains_key(portal_name) {
            return Err(ServerError::sql(
                "34000",
                format!("portal \"{}\" does not exist", portal_name),
            ));
        }

        // empty portal: executing yields the empty-query response
        let (is_empty, intercepted, statement_name) = {
            let portal = self.portals.get(portal_name).unwrap();
            let stmt = self.statements.get(&portal.statement).ok_or_else(|| {
                ServerError::sql("26000", "portal references a closed statement")
            })?;
            (
                stmt.empty,
                stmt.intercepted.clone(),
                portal.statement.clone(),
            )
        };

        if is_empty {
            messages::empty_query_response(&mut self.out);
            return Ok(());
        }

        if let Some(intercepted) = intercepted {
            let result = self.answer_intercepted(&intercepted)?;
            for row in &result.rows {
                let cells: Vec<Option<Vec<u8>>> = row
                    .iter()
                    .map(|v| v.render_text().map(String::into_bytes))
                    .collect();
                messages::data_row(&mut self.out, &cells);
            }
            messages::command_complete(&mut self.out, &result.tag);
            return Ok(());
        }

        let portal = self.portals.get_mut(portal_name).unwrap();
        let stmt = self.statements.get_mut(&statement_name).unwrap();

        if stmt.fields.is_empty() {
            // no result set: run through the compiled handle
            let handle = stmt
                .handle
                .as_mut()
                .ok_or_else(|| ServerError::Engine("statement has no handle".to_string()))?;
            let affected = handle.execute(&portal.params)?;
            messages::command_complete(&mut self.out, &complete_tag(&stmt.tag, affected));
            if stmt.tag == "COMMIT" || stmt.tag == "ROLLBACK" {
                self.txn_failed = false;
            }
            return Ok(());
        }

        let mut rows = match portal.rows.take() {
            Some(rows) => rows,
            None => {
                let handle = stmt
                    .handle
                    .as_mut()
                    .ok_or_else(|| ServerError::Engine("statement has no handle".to_string()))?;
                handle.query(&portal.params)?
            }
        };

        let limit = if max_rows <= 0 {
            u64::MAX
        } else {
            max_rows as u64
        };
        let mut sent = 0u64;
        let mut suspended = false;
        while sent < limit {
            let Some(row) = rows.next_row()? else { break };
            let cells = encode_row(&stmt.fields, &row, &portal.result_formats)?;
            messages::data_row(&mut self.out, &cells);
            sent += 1;
        }
        portal.rows_sent += sent;
        if sent == limit {
            // more rows may remain; keep the stream for the next Execute
            portal.rows = Some(rows);
            suspended = true;
        }

        if suspended {
            messages::portal_suspended(&mut self.out);
        } else {
            let total = portal.rows_sent;
            messages::command_complete(&mut self.out, &complete_tag(&stmt.tag, total));
        }
        Ok(())
    }

    fn on_close(&mut self, kind: u8, name: &str) -> SResult<()> {
        match kind {
            b'S' => {
                self.statements.remove(name);
                // closing a statement closes portals bound to it
                self.portals.retain(|_, p| p.statement != name);
            }
            b'P' => {
                self.portals.remove(name);
            }
            other => {
                return Err(ServerError::Protocol(format!(
                    "bad close kind 0x{:02x}",
                    other
                )))
            }
        }
        messages::close_complete(&mut self.out);
        Ok(())
    }

    //////////////////////
    // COPY
    //////////////////////

    async fn copy_in(&mut self, stmt: CopyStatement) -> SResult<()> {
        let schema = stmt
            .schema
            .clone()
            .unwrap_or_else(|| self.current_schema());
        let conn = self.engine()?;

        let mut fields = {
            let mut guard = conn.lock().await;
            let columns = guard.table_columns(&schema, &stmt.table)?;
            infer_fields(&columns)?
        };
        if !stmt.columns.is_empty() {
            let mut selected = Vec::with_capacity(stmt.columns.len());
            for name in &stmt.columns {
                let field = fields
                    .iter()
                    .find(|f| &f.name == name)
                    .ok_or_else(|| {
                        ServerError::sql(
                            "42703",
                            format!("column \"{}\" of relation \"{}\" does not exist", name, stmt.table),
                        )
                    })?
                    .clone();
                selected.push(field);
            }
            fields = selected;
        }

        messages::copy_in_response(&mut self.out, fields.len() as i16);
        self.flush().await?;

        let mut loader = CopyLoader::new(&stmt);
        let outcome = loop {
            let (tag, payload) = self.channel.read_frame().await?;
            match messages::parse_frontend(tag, &payload)? {
                FrontendMessage::CopyData(chunk) => {
                    if let Err(err) = loader.feed(&chunk) {
                        break Err(err);
                    }
                }
                FrontendMessage::CopyDone => break Ok(loader.finish()?),
                FrontendMessage::CopyFail(reason) => {
                    break Err(ServerError::sql(
                        "57014",
                        format!("COPY from stdin failed: {}", reason),
                    ))
                }
                FrontendMessage::Flush | FrontendMessage::Sync => {}
                FrontendMessage::Terminate => {
                    return Err(ServerError::Protocol(
                        "connection terminated during COPY".to_string(),
                    ))
                }
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected message during COPY: {:?}",
                        other
                    )))
                }
            }
        };

        let text_rows = outcome?;
        let mut decoded = Vec::with_capacity(text_rows.len());
        for text_row in &text_rows {
            let mut row = Vec::with_capacity(fields.len());
            for (idx, field) in fields.iter().enumerate() {
                let value = match text_row.get(idx).and_then(|c| c.as_ref()) {
                    None => EngineValue::Null,
                    Some(text) => field.spec.decode_text(text)?,
                };
                row.push(value);
            }
            decoded.push(row);
        }

        let count = decoded.len() as u64;
        {
            let mut guard = conn.lock().await;
            if stmt.columns.is_empty() {
                let mut appender = guard.appender(&schema, &stmt.table)?;
                for row in &decoded {
                    appender.append_row(row)?;
                }
                appender.flush()?;
            } else {
                // partial column list: write explicit inserts
                let cols: Vec<String> = stmt.columns.iter().map(|c| quote_ident(c)).collect();
                for row in &decoded {
                    let values: Vec<String> = row.iter().map(|v| v.sql_literal()).collect();
                    guard.execute(&format!(
                        "INSERT INTO {}.{} ({}) VALUES ({})",
                        quote_ident(&schema),
                        quote_ident(&stmt.table),
                        cols.join(", "),
                        values.join(", "),
                    ))?;
                }
            }
        }

        messages::command_complete(&mut self.out, &format!("COPY {}", count));
        Ok(())
    }

    async fn copy_out(&mut self, stmt: CopyStatement) -> SResult<()> {
        let schema = stmt
            .schema
            .clone()
            .unwrap_or_else(|| self.current_schema());
        let target = format!("{}.{}", quote_ident(&schema), quote_ident(&stmt.table));
        let conn = self.engine()?;

        let ncols = {
            let mut guard = conn.lock().await;
            guard.table_columns(&schema, &stmt.table)?.len()
        };

        let pipe = PipeFile::create(&self.ctx.datadir, "copyout")?;
        let engine_sql = copy::copy_to_engine_sql(&stmt, &target, &pipe.path_string());

        // producer: the engine writes the file; consumer: we stream it out
        let writer_conn = conn.clone();
        let writer = tokio::task::spawn_blocking(move || -> SResult<u64> {
            let mut guard = writer_conn.blocking_lock();
            guard.execute(&engine_sql)
        });

        let (tx, mut rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(8);
        let read_path = pipe.path().to_path_buf();
        let reader = tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let file = std::fs::File::open(&read_path);
            let mut file = match file {
                Ok(f) => f,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            };
            let mut buf = [0u8; 64 * 1024];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                }
            }
        });

        messages::copy_out_response(&mut self.out, ncols as i16);
        self.flush().await?;

        let mut lines = 0u64;
        let mut failed: Option<ServerError> = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(data) => {
                    lines += data.iter().filter(|b| **b == b'\n').count() as u64;
                    messages::copy_data(&mut self.out, &data);
                    self.flush().await?;
                }
                Err(err) => {
                    failed = Some(err.into());
                    break;
                }
            }
        }

        let _ = reader.await;
        match writer.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => failed = failed.or(Some(err)),
            Err(join_err) => {
                failed = failed.or(Some(ServerError::Engine(format!(
                    "copy writer panicked: {}",
                    join_err
                ))))
            }
        }
        drop(pipe);

        if let Some(err) = failed {
            return Err(err);
        }
        messages::copy_done(&mut self.out);
        messages::command_complete(&mut self.out, &format!("COPY {}", lines));
        Ok(())
    }

    fn current_schema(&self) -> String {
        self.gucs
            .get("search_path")
            .unwrap_or_else(|| "main".to_string())
            .split(',')
            .next()
            .unwrap_or("main")
            .trim()
            .to_string()
    }
}

//////////////////////
// Helpers
//////////////////////

pub fn wire_fields(fields: &[Field], formats: &[i16]) -> Vec<FieldDescription> {
    fields
        .iter()
        .enumerate()
        .map(|(idx, field)| FieldDescription {
            name: field.name.clone(),
            type_oid: field.spec.pg_oid(),
            typlen: field.spec.pg_typlen(),
            format: resolve_format(formats, idx),
        })
        .collect()
}

pub fn resolve_format(formats: &[i16], idx: usize) -> i16 {
    match formats.len() {
        0 => 0,
        1 => formats[0],
        _ => formats.get(idx).copied().unwrap_or(0),
    }
}

/// Encode one row for the wire, honoring per-column format codes.
pub fn encode_row(
    fields: &[Field],
    row: &[EngineValue],
    formats: &[i16],
) -> SResult<Vec<Option<Vec<u8>>>> {
    let mut cells = Vec::with_capacity(row.len());
    for (idx, value) in row.iter().enumerate() {
        if value.is_null() {
            cells.push(None);
            continue;
        }
        let format = resolve_format(formats, idx);
        let spec = fields.get(idx).map(|f| f.spec).unwrap_or(TypeSpec::Varchar);
        let bytes = if format == 1 {
            encode_binary(&spec, value)?
        } else {
            value.render_text().unwrap_or_default().into_bytes()
        };
        cells.push(Some(bytes));
    }
    Ok(cells)
}

fn encode_binary(spec: &TypeSpec, value: &EngineValue) -> SResult<Vec<u8>> {
    use catalog::types::pg_oid;

    let bytes = match (spec.pg_oid(), value) {
        (pg_oid::BOOL, EngineValue::Bool(v)) => vec![u8::from(*v)],
        (pg_oid::INT2, EngineValue::Int(v)) => (*v as i16).to_be_bytes().to_vec(),
        (pg_oid::INT4, EngineValue::Int(v)) => (*v as i32).to_be_bytes().to_vec(),
        (pg_oid::INT8, EngineValue::Int(v)) => v.to_be_bytes().to_vec(),
        (pg_oid::INT8, EngineValue::UInt(v)) => (*v as i64).to_be_bytes().to_vec(),
        (pg_oid::FLOAT4, EngineValue::Float(v)) => (*v as f32).to_be_bytes().to_vec(),
        (pg_oid::FLOAT8, EngineValue::Float(v)) => v.to_be_bytes().to_vec(),
        (pg_oid::BYTEA, EngineValue::Bytes(v)) => v.clone(),
        (pg_oid::TEXT | pg_oid::VARCHAR, _) | (_, EngineValue::Text(_)) => {
            value.render_text().unwrap_or_default().into_bytes()
        }
        _ => {
            return Err(ServerError::Unsupported(format!(
                "binary result format for {}",
                spec.engine_name()
            )))
        }
    };
    Ok(bytes)
}

fn decode_binary_param(spec: &TypeSpec, bytes: &[u8]) -> SResult<EngineValue> {
    use catalog::types::pg_oid;

    let short = || ServerError::Protocol("short binary parameter".to_string());
    let value = match spec.pg_oid() {
        pg_oid::BOOL => EngineValue::Bool(*bytes.first().ok_or_else(short)? != 0),
        pg_oid::INT2 => {
            EngineValue::Int(i16::from_be_bytes(bytes.try_into().map_err(|_| short())?) as i64)
        }
        pg_oid::INT4 => {
            EngineValue::Int(i32::from_be_bytes(bytes.try_into().map_err(|_| short())?) as i64)
        }
        pg_oid::INT8 => {
            EngineValue::Int(i64::from_be_bytes(bytes.try_into().map_err(|_| short())?))
        }
        pg_oid::FLOAT4 => {
            EngineValue::Float(f32::from_be_bytes(bytes.try_into().map_err(|_| short())?) as f64)
        }
        pg_oid::FLOAT8 => {
            EngineValue::Float(f64::from_be_bytes(bytes.try_into().map_err(|_| short())?))
        }
        pg_oid::BYTEA => EngineValue::Bytes(bytes.to_vec()),
        _ => EngineValue::Text(String::from_utf8(bytes.to_vec())?),
    };
    Ok(value)
}

/// Result fields a recognized statement would produce, for Describe before
/// Execute.
fn fields_for_intercepted(intercepted: &Intercepted) -> Vec<Field> {
    let result = match intercepted {
        Intercepted::RecoveryProbe => Some(SyntheticResult::recovery_probe()),
        Intercepted::WalLsnProbe => Some(SyntheticResult::wal_probe(0)),
        Intercepted::ShowVar(name) => Some(SyntheticResult::single_text(name, "", "SHOW")),
        Intercepted::ShowAll => Some(SyntheticResult::show_all(vec![])),
        _ => None,
    };
    match result {
        Some(result) => infer_result_fields(&result.columns).unwrap_or_default(),
        None => vec![],
    }
}

/// Uppercased command tag of a statement.
pub fn statement_tag(sql: &str) -> String {
    let mut words = sql.split_whitespace();
    let first = words.next().unwrap_or("").to_ascii_uppercase();
    match first.as_str() {
        "CREATE" | "DROP" | "ALTER" => {
            let second = words.next().unwrap_or("").to_ascii_uppercase();
            format!("{} {}", first, second)
        }
        "START" => "BEGIN".to_string(),
        "END" => "COMMIT".to_string(),
        "ABORT" => "ROLLBACK".to_string(),
        _ => first,
    }
}

fn is_row_returning(tag: &str) -> bool {
    matches!(
        tag,
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "TABLE" | "PRAGMA"
    )
}

fn is_txn_exit(sql: &str) -> bool {
    matches!(statement_tag(sql).as_str(), "COMMIT" | "ROLLBACK")
}

fn complete_tag(tag: &str, count: u64) -> String {
    match tag {
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "TABLE" | "PRAGMA" => {
            format!("SELECT {}", count)
        }
        "INSERT" => format!("INSERT 0 {}", count),
        "UPDATE" | "DELETE" | "COPY" | "FETCH" | "MOVE" => format!("{} {}", tag, count),
        other => other.to_string(),
    }
}

/// Split a simple-protocol query string on top-level semicolons.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '-' if !in_single && !in_double && chars.peek() == Some(&'-') => {
                // line comment runs to end of line
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            ';' if !in_single && !in_double => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
mod test {
    use catalog::bridge::infer_result_fields;
    use engine::iface::EngineColumn;
    use engine::value::EngineValue;

    use super::{
        complete_tag, encode_row, resolve_format, split_statements, statement_tag,
    };

    #[test]
    fn test_split_statements() {
        assert_eq!(
            split_statements("SELECT 1; SELECT 2;"),
            vec!["SELECT 1".to_string(), "SELECT 2".to_string()]
        );
        assert_eq!(
            split_statements("SELECT 'a;b'; -- trailing; comment\nSELECT 2"),
            vec!["SELECT 'a;b'".to_string(), "SELECT 2".to_string()]
        );
        assert!(split_statements("   ").is_empty());
    }

    #[test]
    fn test_statement_tags() {
        assert_eq!(statement_tag("select * from t"), "SELECT");
        assert_eq!(statement_tag("CREATE TABLE t (a int)"), "CREATE TABLE");
        assert_eq!(statement_tag("start transaction"), "BEGIN");
        assert_eq!(statement_tag("end"), "COMMIT");
        assert_eq!(complete_tag("INSERT", 3), "INSERT 0 3");
        assert_eq!(complete_tag("SELECT", 2), "SELECT 2");
        assert_eq!(complete_tag("CREATE TABLE", 0), "CREATE TABLE");
    }

    #[test]
    fn test_resolve_format() {
        assert_eq!(resolve_format(&[], 5), 0);
        assert_eq!(resolve_format(&[1], 5), 1);
        assert_eq!(resolve_format(&[0, 1], 1), 1);
        assert_eq!(resolve_format(&[0, 1], 7), 0);
    }

    #[test]
    fn test_encode_row_binary_and_text() {
        let fields = infer_result_fields(&[
            EngineColumn::new("id", "INTEGER"),
            EngineColumn::new("name", "VARCHAR"),
        ])
        .unwrap();

        let cells = encode_row(
            &fields,
            &[EngineValue::Int(7), EngineValue::Text("x".to_string())],
            &[],
        )
        .unwrap();
        assert_eq!(cells[0].as_deref(), Some(b"7".as_slice()));

        let cells = encode_row(
            &fields,
            &[EngineValue::Int(7), EngineValue::Null],
            &[1, 1],
        )
        .unwrap();
        assert_eq!(cells[0].as_deref(), Some(7i32.to_be_bytes().as_slice()));
        assert_eq!(cells[1], None);
    }
}
