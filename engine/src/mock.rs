//! Recording engine used by tests: statements are appended to a script log,
//! query results are canned per SQL text, appended rows are kept per table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::err::server_error::ServerError;
use common::err::SResult;

use crate::iface::{
    CatalogColumn, CatalogIndex, EngineAppender, EngineColumn, EngineConn, EngineConnector,
    EnginePrepared, EngineRows, VecRows,
};
use crate::value::EngineValue;

#[derive(Default)]
pub struct MockState {
    /// Every statement seen, in order, across all connections.
    pub log: Vec<String>,
    /// Canned result sets keyed by exact SQL text.
    pub results: HashMap<String, (Vec<EngineColumn>, Vec<Vec<EngineValue>>)>,
    /// Rows fed through appenders, keyed by `schema.table`.
    pub appended: HashMap<String, Vec<Vec<EngineValue>>>,
    /// Catalog metadata keyed by (schema, table).
    pub meta: HashMap<(String, String), Vec<CatalogColumn>>,
    pub indexes: HashMap<(String, String), Vec<CatalogIndex>>,
    /// SQL texts that fail with an engine error when executed.
    pub poison: Vec<String>,
}

impl MockState {
    pub fn canned(&mut self, sql: &str, columns: Vec<EngineColumn>, rows: Vec<Vec<EngineValue>>) {
        self.results.insert(sql.to_string(), (columns, rows));
    }
}

#[derive(Clone)]
pub struct MockConnector {
    pub state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        MockConnector {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        MockConnector::new()
    }
}

impl EngineConnector for MockConnector {
    fn connect(&self, database: &str) -> SResult<Box<dyn EngineConn>> {
        let _ = database;
        Ok(Box::new(MockConn {
            state: self.state.clone(),
            in_txn: false,
        }))
    }
}

pub struct MockConn {
    state: Arc<Mutex<MockState>>,
    in_txn: bool,
}

impl MockConn {
    fn record(&self, sql: &str) -> SResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.poison.iter().any(|p| sql.contains(p.as_str())) {
            state.log.push(format!("!{}", sql));
            return Err(ServerError::Engine(format!("poisoned: {}", sql)));
        }
        state.log.push(sql.to_string());
        Ok(())
    }
}

impl EngineConn for MockConn {
    fn execute(&mut self, sql: &str) -> SResult<u64> {
        self.record(sql)?;
        Ok(0)
    }

    fn query(&mut self, sql: &str) -> SResult<Box<dyn EngineRows>> {
        self.record(sql)?;
        let state = self.state.lock().unwrap();
        match state.results.get(sql) {
            Some((columns, rows)) => Ok(Box::new(VecRows::new(columns.clone(), rows.clone()))),
            None => Ok(Box::new(VecRows::empty())),
        }
    }

    fn prepare(&mut self, sql: &str) -> SResult<Box<dyn EnginePrepared>> {
        let state = self.state.lock().unwrap();
        let columns = state
            .results
            .get(sql)
            .map(|(columns, _)| columns.clone())
            .unwrap_or_default();
        // engine placeholders are `?` or `$n`
        let parameter_count = sql.matches('?').count()
            + (1..=9)
                .filter(|n| sql.contains(&format!("${}", n)))
                .count();
        Ok(Box::new(MockPrepared {
            state: self.state.clone(),
            sql: sql.to_string(),
            columns,
            parameter_count,
        }))
    }

    fn begin(&mut self) -> SResult<()> {
        self.record("BEGIN")?;
        self.in_txn = true;
        Ok(())
    }

    fn commit(&mut self) -> SResult<()> {
        self.record("COMMIT")?;
        self.in_txn = false;
        Ok(())
    }

    fn rollback(&mut self) -> SResult<()> {
        self.record("ROLLBACK")?;
        self.in_txn = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_txn
    }

    fn appender(&mut self, schema: &str, table: &str) -> SResult<Box<dyn EngineAppender>> {
        self.record(&format!("APPEND {}.{}", schema, table))?;
        Ok(Box::new(MockAppender {
            state: self.state.clone(),
            key: format!("{}.{}", schema, table),
        }))
    }

    fn schemas(&mut self) -> SResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut schemas: Vec<String> = state.meta.keys().map(|(s, _)| s.clone()).collect();
        schemas.sort();
        schemas.dedup();
        Ok(schemas)
    }

    fn tables(&mut self, schema: &str) -> SResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut tables: Vec<String> = state
            .meta
            .keys()
            .filter(|(s, _)| s == schema)
            .map(|(_, t)| t.clone())
            .collect();
        tables.sort();
        Ok(tables)
    }

    fn table_columns(&mut self, schema: &str, table: &str) -> SResult<Vec<CatalogColumn>> {
        let state = self.state.lock().unwrap();
        state
            .meta
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| {
                ServerError::sql("42P01", format!("table {}.{} does not exist", schema, table))
            })
    }

    fn table_indexes(&mut self, schema: &str, table: &str) -> SResult<Vec<CatalogIndex>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .indexes
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn close(&mut self) -> SResult<()> {
        self.state.lock().unwrap().log.push("CLOSE".to_string());
        Ok(())
    }
}

pub struct MockPrepared {
    state: Arc<Mutex<MockState>>,
    sql: String,
    columns: Vec<EngineColumn>,
    parameter_count: usize,
}

impl EnginePrepared for MockPrepared {
    fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    fn columns(&self) -> &[EngineColumn] {
        &self.columns
    }

    fn query(&mut self, params: &[EngineValue]) -> SResult<Box<dyn EngineRows>> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("EXEC[{}] {}", params.len(), self.sql));
        match state.results.get(&self.sql) {
            Some((columns, rows)) => Ok(Box::new(VecRows::new(columns.clone(), rows.clone()))),
            None => Ok(Box::new(VecRows::empty())),
        }
    }

    fn execute(&mut self, params: &[EngineValue]) -> SResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("EXEC[{}] {}", params.len(), self.sql));
        Ok(1)
    }
}

pub struct MockAppender {
    state: Arc<Mutex<MockState>>,
    key: String,
}

impl EngineAppender for MockAppender {
    fn append_row(&mut self, row: &[EngineValue]) -> SResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .appended
            .entry(self.key.clone())
            .or_default()
            .push(row.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> SResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::MockConnector;
    use crate::iface::{EngineColumn, EngineConnector};
    use crate::value::EngineValue;

    #[test]
    fn test_canned_query() {
        let connector = MockConnector::new();
        connector.state.lock().unwrap().canned(
            "SELECT 1",
            vec![EngineColumn::new("one", "INTEGER")],
            vec![vec![EngineValue::Int(1)]],
        );

        let mut conn = connector.connect("main").unwrap();
        let mut rows = conn.query("SELECT 1").unwrap();
        assert_eq!(rows.next_row().unwrap(), Some(vec![EngineValue::Int(1)]));
        assert_eq!(connector.log(), vec!["SELECT 1".to_string()]);
    }

    #[test]
    fn test_poison() {
        let connector = MockConnector::new();
        connector
            .state
            .lock()
            .unwrap()
            .poison
            .push("boom".to_string());

        let mut conn = connector.connect("main").unwrap();
        assert!(conn.execute("SELECT boom").is_err());
    }
}
