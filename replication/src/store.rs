//! Persistent, crash-safe record of per-subscription progress and
//! configuration, kept inside the engine itself so it commits atomically
//! with the delta flush.

use std::sync::Mutex;

use tracing::info;

use common::err::server_error::ServerError;
use common::err::SResult;
use engine::iface::EngineConn;
use engine::value::{quote_literal, EngineValue};
use translate::gucs::PersistentVars;

use crate::lsn::Lsn;

pub const RESERVED_SCHEMA: &str = "__sys";

/// One row of `__sys.subscriptions`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRow {
    pub name: String,
    pub connection_string: String,
    pub publication: String,
    pub last_commit_lsn: Lsn,
    pub enabled: bool,
}

/// Create the reserved schema and its tables. Failure here is fatal to the
/// process at startup.
pub fn ensure_reserved_schema(conn: &mut dyn EngineConn) -> SResult<()> {
    conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", RESERVED_SCHEMA))?;
    conn.execute(&format!(
        "CREATE TABLE IF NOT EXISTS {}.subscriptions (\
         name VARCHAR PRIMARY KEY, \
         connection_string VARCHAR NOT NULL, \
         publication VARCHAR NOT NULL, \
         last_commit_lsn UBIGINT NOT NULL DEFAULT 0, \
         enabled BOOLEAN NOT NULL DEFAULT TRUE)",
        RESERVED_SCHEMA
    ))?;
    conn.execute(&format!(
        "CREATE TABLE IF NOT EXISTS {}.lsn_positions (\
         publication VARCHAR PRIMARY KEY, \
         last_commit_lsn UBIGINT NOT NULL)",
        RESERVED_SCHEMA
    ))?;
    conn.execute(&format!(
        "CREATE TABLE IF NOT EXISTS {}.persistent_variables (\
         name VARCHAR PRIMARY KEY, \
         value VARCHAR NOT NULL, \
         vtype VARCHAR NOT NULL)",
        RESERVED_SCHEMA
    ))?;
    Ok(())
}

pub fn load_subscriptions(conn: &mut dyn EngineConn) -> SResult<Vec<SubscriptionRow>> {
    let mut rows = conn.query(&format!(
        "SELECT name, connection_string, publication, last_commit_lsn, enabled \
         FROM {}.subscriptions ORDER BY name",
        RESERVED_SCHEMA
    ))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next_row()? {
        out.push(decode_subscription_row(&row)?);
    }
    Ok(out)
}

fn decode_subscription_row(row: &[EngineValue]) -> SResult<SubscriptionRow> {
    let text = |idx: usize| -> SResult<String> {
        match row.get(idx) {
            Some(EngineValue::Text(s)) => Ok(s.clone()),
            other => Err(ServerError::Engine(format!(
                "unexpected subscription cell {:?}",
                other
            ))),
        }
    };
    let lsn = match row.get(3) {
        Some(EngineValue::UInt(v)) => Lsn(*v),
        Some(EngineValue::Int(v)) if *v >= 0 => Lsn(*v as u64),
        other => {
            return Err(ServerError::Engine(format!(
                "unexpected lsn cell {:?}",
                other
            )))
        }
    };
    let enabled = matches!(row.get(4), Some(EngineValue::Bool(true)));
    Ok(SubscriptionRow {
        name: text(0)?,
        connection_string: text(1)?,
        publication: text(2)?,
        last_commit_lsn: lsn,
        enabled,
    })
}

pub fn upsert_subscription(conn: &mut dyn EngineConn, row: &SubscriptionRow) -> SResult<()> {
    conn.execute(&format!(
        "INSERT OR REPLACE INTO {}.subscriptions \
         (name, connection_string, publication, last_commit_lsn, enabled) \
         VALUES ({}, {}, {}, {}, {})",
        RESERVED_SCHEMA,
        quote_literal(&row.name),
        quote_literal(&row.connection_string),
        quote_literal(&row.publication),
        row.last_commit_lsn.0,
        if row.enabled { "TRUE" } else { "FALSE" },
    ))?;
    info!("subscription '{}' saved", row.name);
    Ok(())
}

pub fn set_enabled(conn: &mut dyn EngineConn, name: &str, enabled: bool) -> SResult<()> {
    conn.execute(&format!(
        "UPDATE {}.subscriptions SET enabled = {} WHERE name = {}",
        RESERVED_SCHEMA,
        if enabled { "TRUE" } else { "FALSE" },
        quote_literal(name),
    ))?;
    Ok(())
}

/// Persist replication progress. Runs inside the flush transaction so
/// progress is never ahead of applied data.
pub fn write_progress(
    conn: &mut dyn EngineConn,
    name: &str,
    publication: &str,
    lsn: Lsn,
) -> SResult<()> {
    conn.execute(&format!(
        "UPDATE {}.subscriptions SET last_commit_lsn = {} WHERE name = {}",
        RESERVED_SCHEMA,
        lsn.0,
        quote_literal(name),
    ))?;
    conn.execute(&format!(
        "INSERT OR REPLACE INTO {}.lsn_positions (publication, last_commit_lsn) VALUES ({}, {})",
        RESERVED_SCHEMA,
        quote_literal(publication),
        lsn.0,
    ))?;
    Ok(())
}

pub fn read_progress(conn: &mut dyn EngineConn, name: &str) -> SResult<Lsn> {
    let mut rows = conn.query(&format!(
        "SELECT last_commit_lsn FROM {}.subscriptions WHERE name = {}",
        RESERVED_SCHEMA,
        quote_literal(name),
    ))?;
    match rows.next_row()? {
        Some(row) => match row.first() {
            Some(EngineValue::UInt(v)) => Ok(Lsn(*v)),
            Some(EngineValue::Int(v)) if *v >= 0 => Ok(Lsn(*v as u64)),
            _ => Ok(Lsn::ZERO),
        },
        None => Ok(Lsn::ZERO),
    }
}

/// Persistent-variables table behind the `PersistentVars` seam used by the
/// wire sessions. Owns a dedicated engine connection.
pub struct VarStore {
    conn: Mutex<Box<dyn EngineConn>>,
}

impl VarStore {
    pub fn new(conn: Box<dyn EngineConn>) -> Self {
        VarStore {
            conn: Mutex::new(conn),
        }
    }
}

impl PersistentVars for VarStore {
    fn get(&self, name: &str) -> Option<String> {
        let mut conn = self.conn.lock().unwrap();
        let mut rows = conn
            .query(&format!(
                "SELECT value FROM {}.persistent_variables WHERE name = {}",
                RESERVED_SCHEMA,
                quote_literal(name),
            ))
            .ok()?;
        match rows.next_row().ok()? {
            Some(row) => match row.first() {
                Some(EngineValue::Text(s)) => Some(s.clone()),
                _ => None,
            },
            None => None,
        }
    }

    fn set(&self, name: &str, value: &str, vtype: &str) -> SResult<()> {
        let mut conn = self.conn.lock().unwrap();
        conn.execute(&format!(
            "INSERT OR REPLACE INTO {}.persistent_variables (name, value, vtype) VALUES ({}, {}, {})",
            RESERVED_SCHEMA,
            quote_literal(name),
            quote_literal(value),
            quote_literal(vtype),
        ))?;
        Ok(())
    }

    fn reset(&self, name: &str) -> SResult<()> {
        let mut conn = self.conn.lock().unwrap();
        conn.execute(&format!(
            "DELETE FROM {}.persistent_variables WHERE name = {}",
            RESERVED_SCHEMA,
            quote_literal(name),
        ))?;
        Ok(())
    }

    fn all(&self) -> Vec<(String, String)> {
        let mut conn = self.conn.lock().unwrap();
        let Ok(mut rows) = conn.query(&format!(
            "SELECT name, value FROM {}.persistent_variables ORDER BY name",
            RESERVED_SCHEMA
        )) else {
            return vec![];
        };
        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next_row() {
            if let (Some(EngineValue::Text(name)), Some(EngineValue::Text(value))) =
                (row.first(), row.get(1))
            {
                out.push((name.clone(), value.clone()));
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use engine::iface::{EngineColumn, EngineConnector};
    use engine::mock::MockConnector;
    use engine::value::EngineValue;
    use translate::gucs::PersistentVars;

    use super::{
        ensure_reserved_schema, load_subscriptions, read_progress, upsert_subscription,
        write_progress, SubscriptionRow, VarStore,
    };
    use crate::lsn::Lsn;

    #[test]
    fn test_schema_and_progress() {
        let connector = MockConnector::new();
        let mut conn = connector.connect("main").unwrap();
        ensure_reserved_schema(conn.as_mut()).unwrap();

        let row = SubscriptionRow {
            name: "sub1".to_string(),
            connection_string: "host=p dbname=db".to_string(),
            publication: "pub1".to_string(),
            last_commit_lsn: Lsn::ZERO,
            enabled: true,
        };
        upsert_subscription(conn.as_mut(), &row).unwrap();
        write_progress(conn.as_mut(), "sub1", "pub1", Lsn(42)).unwrap();

        let log = connector.log().join("\n");
        assert!(log.contains("CREATE TABLE IF NOT EXISTS __sys.subscriptions"));
        assert!(log.contains("UPDATE __sys.subscriptions SET last_commit_lsn = 42"));
        assert!(log.contains("INSERT OR REPLACE INTO __sys.lsn_positions"));
    }

    #[test]
    fn test_load_and_read() {
        let connector = MockConnector::new();
        connector.state.lock().unwrap().canned(
            "SELECT name, connection_string, publication, last_commit_lsn, enabled \
             FROM __sys.subscriptions ORDER BY name",
            vec![],
            vec![vec![
                EngineValue::Text("sub1".to_string()),
                EngineValue::Text("host=p".to_string()),
                EngineValue::Text("pub1".to_string()),
                EngineValue::UInt(7),
                EngineValue::Bool(true),
            ]],
        );
        connector.state.lock().unwrap().canned(
            "SELECT last_commit_lsn FROM __sys.subscriptions WHERE name = 'sub1'",
            vec![EngineColumn::new("last_commit_lsn", "UBIGINT")],
            vec![vec![EngineValue::UInt(7)]],
        );

        let mut conn = connector.connect("main").unwrap();
        let subs = load_subscriptions(conn.as_mut()).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].last_commit_lsn, Lsn(7));
        assert!(subs[0].enabled);

        assert_eq!(read_progress(conn.as_mut(), "sub1").unwrap(), Lsn(7));
        // absent subscription reads as cold start
        assert_eq!(read_progress(conn.as_mut(), "nope").unwrap(), Lsn::ZERO);
    }

    #[test]
    fn test_var_store() {
        let connector = MockConnector::new();
        connector.state.lock().unwrap().canned(
            "SELECT value FROM __sys.persistent_variables WHERE name = 'sql_mode'",
            vec![EngineColumn::new("value", "VARCHAR")],
            vec![vec![EngineValue::Text("STRICT".to_string())]],
        );

        let store = VarStore::new(connector.connect("main").unwrap());
        store.set("sql_mode", "STRICT", "string").unwrap();
        assert_eq!(store.get("sql_mode"), Some("STRICT".to_string()));
        assert_eq!(store.get("missing"), None);
        store.reset("sql_mode").unwrap();

        let log = connector.log().join("\n");
        assert!(log.contains("INSERT OR REPLACE INTO __sys.persistent_variables"));
        assert!(log.contains("DELETE FROM __sys.persistent_variables"));
    }
}
