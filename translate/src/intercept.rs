//! Decides, per incoming statement, whether the engine can execute it or
//! whether the front-end must synthesize a reply. The locally-answered set
//! is fixed: recovery/WAL probes, recognized GUCs, isolation changes, and
//! the extension DDL recognized by regex.

use lazy_static::lazy_static;
use regex::Regex;

use engine::iface::EngineColumn;
use engine::value::EngineValue;

use crate::gucs::unquote_value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub database: String,
    pub uri: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSubscriptionRequest {
    pub name: String,
    pub connection_string: String,
    pub publication: String,
}

/// Actions behind the extension DDL, implemented by the composition root
/// (subscription supervisor + object-storage collaborator).
pub trait ExtensionOps: Send + Sync {
    fn create_subscription(&self, request: &CreateSubscriptionRequest)
        -> common::err::SResult<()>;

    fn backup(&self, request: &BackupRequest) -> common::err::SResult<()>;

    /// Highest replicated WAL position, for the WAL probes.
    fn wal_position(&self) -> u64;
}

/// Classification of a statement the engine must not see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercepted {
    RecoveryProbe,
    WalLsnProbe,
    ShowVar(String),
    ShowAll,
    SetVar {
        name: String,
        value: String,
        persist: bool,
    },
    ResetVar(String),
    SetIsolation,
    Backup(BackupRequest),
    CreateSubscription(CreateSubscriptionRequest),
}

lazy_static! {
    static ref RE_RECOVERY: Regex =
        Regex::new(r"(?is)^\s*select\s+(pg_catalog\.)?pg_is_in_recovery\s*\(\s*\)\s*;?\s*$")
            .unwrap();
    static ref RE_WAL: Regex = Regex::new(
        r"(?is)^\s*select\s+(pg_catalog\.)?(pg_current_wal_lsn|pg_last_wal_replay_lsn)\s*\(\s*\)\s*;?\s*$"
    )
    .unwrap();
    static ref RE_SET_ISOLATION: Regex = Regex::new(
        r"(?is)^\s*set\s+(session\s+characteristics\s+as\s+)?transaction\s+(isolation\s+level\s+(read\s+committed|read\s+uncommitted|repeatable\s+read|serializable)|read\s+(only|write))\s*;?\s*$"
    )
    .unwrap();
    static ref RE_SET: Regex = Regex::new(
        r#"(?is)^\s*set\s+(?P<scope>session\s+|local\s+|global\s+|persist\s+)?(?P<name>[a-zA-Z_][a-zA-Z0-9_.]*)\s*(=|\s+to\s+)\s*(?P<value>.+?)\s*;?\s*$"#
    )
    .unwrap();
    static ref RE_RESET: Regex =
        Regex::new(r"(?is)^\s*reset\s+(?P<name>[a-zA-Z_][a-zA-Z0-9_.]*)\s*;?\s*$").unwrap();
    static ref RE_SHOW: Regex =
        Regex::new(r"(?is)^\s*show\s+(?P<what>[a-zA-Z_][a-zA-Z0-9_. ]*?)\s*;?\s*$").unwrap();
    static ref RE_BACKUP: Regex = Regex::new(
        r"(?is)^\s*backup\s+database\s+(?P<db>[a-zA-Z_][a-zA-Z0-9_]*)\s+to\s+'(?P<uri>[^']+)'(?:\s+endpoint\s*=\s*'(?P<endpoint>[^']*)')?(?:\s+access_key_id\s*=\s*'(?P<akid>[^']*)')?(?:\s+secret_access_key\s*=\s*'(?P<secret>[^']*)')?\s*;?\s*$"
    )
    .unwrap();
    static ref RE_CREATE_SUBSCRIPTION: Regex = Regex::new(
        r"(?is)^\s*create\s+subscription\s+(?P<name>[a-zA-Z_][a-zA-Z0-9_]*)\s+connection\s+'(?P<conn>[^']+)'\s+publication\s+(?P<pub>[a-zA-Z_][a-zA-Z0-9_]*)\s*;?\s*$"
    )
    .unwrap();
}

/// Classify one statement. `None` means the engine executes it (possibly
/// after rewriting).
pub fn inspect(sql: &str) -> Option<Intercepted> {
    if RE_RECOVERY.is_match(sql) {
        return Some(Intercepted::RecoveryProbe);
    }
    if RE_WAL.is_match(sql) {
        return Some(Intercepted::WalLsnProbe);
    }
    if RE_SET_ISOLATION.is_match(sql) {
        return Some(Intercepted::SetIsolation);
    }
    if let Some(caps) = RE_BACKUP.captures(sql) {
        return Some(Intercepted::Backup(BackupRequest {
            database: caps["db"].to_string(),
            uri: caps["uri"].to_string(),
            endpoint: caps.name("endpoint").map(|m| m.as_str().to_string()),
            access_key_id: caps.name("akid").map(|m| m.as_str().to_string()),
            secret_access_key: caps.name("secret").map(|m| m.as_str().to_string()),
        }));
    }
    if let Some(caps) = RE_CREATE_SUBSCRIPTION.captures(sql) {
        return Some(Intercepted::CreateSubscription(CreateSubscriptionRequest {
            name: caps["name"].to_string(),
            connection_string: caps["conn"].to_string(),
            publication: caps["pub"].to_string(),
        }));
    }
    if let Some(caps) = RE_SET.captures(sql) {
        let name = caps["name"].to_ascii_lowercase();
        let persist = caps
            .name("scope")
            .map(|m| m.as_str().trim().eq_ignore_ascii_case("persist"))
            .unwrap_or(false);
        if crate::gucs::Gucs::is_recognized(&name) || persist {
            return Some(Intercepted::SetVar {
                name,
                value: unquote_value(&caps["value"]),
                persist,
            });
        }
        return None;
    }
    if let Some(caps) = RE_RESET.captures(sql) {
        let name = caps["name"].to_ascii_lowercase();
        if crate::gucs::Gucs::is_recognized(&name) {
            return Some(Intercepted::ResetVar(name));
        }
        return None;
    }
    if let Some(caps) = RE_SHOW.captures(sql) {
        let what = caps["what"].trim().to_ascii_lowercase();
        if what == "all" {
            return Some(Intercepted::ShowAll);
        }
        if what == "transaction isolation level" {
            return Some(Intercepted::ShowVar("transaction_isolation".to_string()));
        }
        if crate::gucs::Gucs::is_recognized(&what) {
            return Some(Intercepted::ShowVar(what));
        }
        return None;
    }
    None
}

/// A synthesized reply: zero or more rows plus a command tag.
#[derive(Debug)]
pub struct SyntheticResult {
    pub columns: Vec<EngineColumn>,
    pub rows: Vec<Vec<EngineValue>>,
    pub tag: String,
}

impl SyntheticResult {
    pub fn command(tag: &str) -> Self {
        SyntheticResult {
            columns: vec![],
            rows: vec![],
            tag: tag.to_string(),
        }
    }

    pub fn single_text(column: &str, value: &str, tag: &str) -> Self {
        SyntheticResult {
            columns: vec![EngineColumn::new(column, "VARCHAR")],
            rows: vec![vec![EngineValue::Text(value.to_string())]],
            tag: tag.to_string(),
        }
    }

    pub fn recovery_probe() -> Self {
        SyntheticResult {
            columns: vec![EngineColumn::new("pg_is_in_recovery", "BOOLEAN")],
            rows: vec![vec![EngineValue::Bool(false)]],
            tag: "SELECT 1".to_string(),
        }
    }

    pub fn wal_probe(lsn: u64) -> Self {
        let text = format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF);
        SyntheticResult {
            columns: vec![EngineColumn::new("pg_current_wal_lsn", "VARCHAR")],
            rows: vec![vec![EngineValue::Text(text)]],
            tag: "SELECT 1".to_string(),
        }
    }

    pub fn show_all(vars: Vec<(String, String)>) -> Self {
        SyntheticResult {
            columns: vec![
                EngineColumn::new("name", "VARCHAR"),
                EngineColumn::new("setting", "VARCHAR"),
                EngineColumn::new("description", "VARCHAR"),
            ],
            rows: vars
                .into_iter()
                .map(|(name, value)| {
                    vec![
                        EngineValue::Text(name),
                        EngineValue::Text(value),
                        EngineValue::Null,
                    ]
                })
                .collect(),
            tag: "SHOW".to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{inspect, Intercepted};

    #[test]
    fn test_probes() {
        assert_eq!(
            inspect("SELECT pg_is_in_recovery();"),
            Some(Intercepted::RecoveryProbe)
        );
        assert_eq!(
            inspect("select pg_catalog.pg_current_wal_lsn()"),
            Some(Intercepted::WalLsnProbe)
        );
    }

    #[test]
    fn test_set_show_reset() {
        assert_eq!(
            inspect("SET TimeZone = 'UTC'"),
            Some(Intercepted::SetVar {
                name: "timezone".to_string(),
                value: "UTC".to_string(),
                persist: false,
            })
        );
        assert_eq!(
            inspect("set session extra_float_digits to 3"),
            Some(Intercepted::SetVar {
                name: "extra_float_digits".to_string(),
                value: "3".to_string(),
                persist: false,
            })
        );
        assert_eq!(
            inspect("SET PERSIST sql_mode = 'STRICT'"),
            Some(Intercepted::SetVar {
                name: "sql_mode".to_string(),
                value: "STRICT".to_string(),
                persist: true,
            })
        );
        assert_eq!(
            inspect("SHOW search_path"),
            Some(Intercepted::ShowVar("search_path".to_string()))
        );
        assert_eq!(inspect("SHOW ALL"), Some(Intercepted::ShowAll));
        assert_eq!(
            inspect("RESET timezone"),
            Some(Intercepted::ResetVar("timezone".to_string()))
        );
        // unrecognized names are forwarded
        assert_eq!(inspect("SET duckish_knob = 1"), None);
        assert_eq!(inspect("SHOW created_tables"), None);
    }

    #[test]
    fn test_isolation() {
        assert_eq!(
            inspect("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            Some(Intercepted::SetIsolation)
        );
        assert_eq!(
            inspect("set session characteristics as transaction read only;"),
            Some(Intercepted::SetIsolation)
        );
    }

    #[test]
    fn test_extension_ddl() {
        match inspect(
            "BACKUP DATABASE mydb TO 's3://bucket/path' ENDPOINT='http://minio:9000' ACCESS_KEY_ID='ak' SECRET_ACCESS_KEY='sk'",
        ) {
            Some(Intercepted::Backup(req)) => {
                assert_eq!(req.database, "mydb");
                assert_eq!(req.uri, "s3://bucket/path");
                assert_eq!(req.endpoint.as_deref(), Some("http://minio:9000"));
                assert_eq!(req.secret_access_key.as_deref(), Some("sk"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        match inspect("CREATE SUBSCRIPTION sub1 CONNECTION 'host=p dbname=db' PUBLICATION pub1") {
            Some(Intercepted::CreateSubscription(req)) => {
                assert_eq!(req.name, "sub1");
                assert_eq!(req.connection_string, "host=p dbname=db");
                assert_eq!(req.publication, "pub1");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_plain_sql_not_intercepted() {
        assert_eq!(inspect("SELECT * FROM t"), None);
        assert_eq!(inspect("INSERT INTO t VALUES (1)"), None);
        assert_eq!(inspect("UPDATE t SET x = 1 WHERE id = 2"), None);
    }
}
