//! Columnar append-only buffer of pending row changes, one per replicated
//! table, and the merge that folds a buffer into the engine under the
//! caller's transaction.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tracing::debug;

use catalog::bridge::quote_ident;
use catalog::types::BuilderKind;
use common::err::server_error::ServerError;
use common::err::SResult;
use engine::iface::EngineConn;
use engine::value::EngineValue;

use crate::relation::RelationDescriptor;

pub const ACTION_DELETE: u8 = 0;
pub const ACTION_UPDATE: u8 = 1;
pub const ACTION_INSERT: u8 = 2;

/// Transaction coordinates attached to every buffered row.
#[derive(Debug, Clone, Copy)]
pub struct TxnInfo<'a> {
    pub tag: &'a str,
    pub server: &'a str,
    pub group: &'a str,
    /// Upstream transaction LSN; all rows of one transaction carry the same.
    pub seq: u64,
    /// Monotonically increasing within an upstream transaction.
    pub stmt_ord: u64,
}

/// Dictionary-encoded string column for the txn metadata columns, which
/// repeat heavily within a batch.
#[derive(Debug, Default)]
pub struct DictColumn {
    dict: Vec<String>,
    codes: Vec<u32>,
}

impl DictColumn {
    pub fn append(&mut self, value: &str) {
        let code = match self.dict.iter().position(|v| v == value) {
            Some(pos) => pos as u32,
            None => {
                self.dict.push(value.to_string());
                (self.dict.len() - 1) as u32
            }
        };
        self.codes.push(code);
    }

    pub fn get(&self, row: usize) -> &str {
        &self.dict[self.codes[row] as usize]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// One typed column of buffered values.
#[derive(Debug)]
pub enum ColumnData {
    Bool(Vec<Option<bool>>),
    Int(Vec<Option<i64>>),
    UInt(Vec<Option<u64>>),
    Float(Vec<Option<f64>>),
    Decimal(Vec<Option<String>>),
    Text(Vec<Option<String>>),
    Bytes(Vec<Option<Vec<u8>>>),
    Date(Vec<Option<NaiveDate>>),
    Time(Vec<Option<NaiveTime>>),
    Timestamp(Vec<Option<NaiveDateTime>>),
}

impl ColumnData {
    pub fn new(kind: BuilderKind) -> Self {
        match kind {
            BuilderKind::Bool => ColumnData::Bool(vec![]),
            BuilderKind::Int => ColumnData::Int(vec![]),
            BuilderKind::UInt => ColumnData::UInt(vec![]),
            BuilderKind::Float => ColumnData::Float(vec![]),
            BuilderKind::Decimal => ColumnData::Decimal(vec![]),
            BuilderKind::Text => ColumnData::Text(vec![]),
            BuilderKind::Bytes => ColumnData::Bytes(vec![]),
            BuilderKind::Date => ColumnData::Date(vec![]),
            BuilderKind::Time => ColumnData::Time(vec![]),
            BuilderKind::Timestamp => ColumnData::Timestamp(vec![]),
        }
    }

    /// Append one cell, returning an estimate of the bytes consumed.
    pub fn push(&mut self, value: EngineValue) -> SResult<usize> {
        let bytes = match (self, value) {
            (ColumnData::Bool(v), EngineValue::Bool(b)) => {
                v.push(Some(b));
                1
            }
            (ColumnData::Bool(v), EngineValue::Null) => {
                v.push(None);
                1
            }
            (ColumnData::Int(v), EngineValue::Int(i)) => {
                v.push(Some(i));
                8
            }
            (ColumnData::Int(v), EngineValue::Null) => {
                v.push(None);
                8
            }
            (ColumnData::UInt(v), EngineValue::UInt(u)) => {
                v.push(Some(u));
                8
            }
            (ColumnData::UInt(v), EngineValue::Int(i)) if i >= 0 => {
                v.push(Some(i as u64));
                8
            }
            (ColumnData::UInt(v), EngineValue::Null) => {
                v.push(None);
                8
            }
            (ColumnData::Float(v), EngineValue::Float(f)) => {
                v.push(Some(f));
                8
            }
            (ColumnData::Float(v), EngineValue::Null) => {
                v.push(None);
                8
            }
            (ColumnData::Decimal(v), EngineValue::Decimal(d)) => {
                let len = d.len();
                v.push(Some(d));
                len
            }
            (ColumnData::Decimal(v), EngineValue::Null) => {
                v.push(None);
                4
            }
            (ColumnData::Text(v), EngineValue::Text(t)) => {
                let len = t.len();
                v.push(Some(t));
                len
            }
            (ColumnData::Text(v), EngineValue::Null) => {
                v.push(None);
                4
            }
            (ColumnData::Bytes(v), EngineValue::Bytes(b)) => {
                let len = b.len();
                v.push(Some(b));
                len
            }
            (ColumnData::Bytes(v), EngineValue::Null) => {
                v.push(None);
                4
            }
            (ColumnData::Date(v), EngineValue::Date(d)) => {
                v.push(Some(d));
                4
            }
            (ColumnData::Date(v), EngineValue::Null) => {
                v.push(None);
                4
            }
            (ColumnData::Time(v), EngineValue::Time(t)) => {
                v.push(Some(t));
                8
            }
            (ColumnData::Time(v), EngineValue::Null) => {
                v.push(None);
                8
            }
            (ColumnData::Timestamp(v), EngineValue::Timestamp(ts)) => {
                v.push(Some(ts));
                8
            }
            (ColumnData::Timestamp(v), EngineValue::Null) => {
                v.push(None);
                8
            }
            (_, other) => {
                return Err(ServerError::Protocol(format!(
                    "value {:?} does not fit column builder",
                    other
                )))
            }
        };
        Ok(bytes)
    }

    pub fn get(&self, row: usize) -> EngineValue {
        match self {
            ColumnData::Bool(v) => v[row].map(EngineValue::Bool).unwrap_or(EngineValue::Null),
            ColumnData::Int(v) => v[row].map(EngineValue::Int).unwrap_or(EngineValue::Null),
            ColumnData::UInt(v) => v[row].map(EngineValue::UInt).unwrap_or(EngineValue::Null),
            ColumnData::Float(v) => v[row].map(EngineValue::Float).unwrap_or(EngineValue::Null),
            ColumnData::Decimal(v) => v[row]
                .clone()
                .map(EngineValue::Decimal)
                .unwrap_or(EngineValue::Null),
            ColumnData::Text(v) => v[row]
                .clone()
                .map(EngineValue::Text)
                .unwrap_or(EngineValue::Null),
            ColumnData::Bytes(v) => v[row]
                .clone()
                .map(EngineValue::Bytes)
                .unwrap_or(EngineValue::Null),
            ColumnData::Date(v) => v[row].map(EngineValue::Date).unwrap_or(EngineValue::Null),
            ColumnData::Time(v) => v[row].map(EngineValue::Time).unwrap_or(EngineValue::Null),
            ColumnData::Timestamp(v) => v[row]
                .map(EngineValue::Timestamp)
                .unwrap_or(EngineValue::Null),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::UInt(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Decimal(v) => v.len(),
            ColumnData::Text(v) => v.len(),
            ColumnData::Bytes(v) => v.len(),
            ColumnData::Date(v) => v.len(),
            ColumnData::Time(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffered changes for one (namespace, table).
#[derive(Debug)]
pub struct TableDelta {
    pub rel: RelationDescriptor,
    actions: Vec<u8>,
    txn_tags: DictColumn,
    txn_servers: DictColumn,
    txn_groups: DictColumn,
    txn_seqs: Vec<u64>,
    txn_stmt_ords: Vec<u64>,
    columns: Vec<ColumnData>,
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    pub bytes: usize,
}

impl TableDelta {
    pub fn new(rel: RelationDescriptor) -> Self {
        let columns = rel
            .columns
            .iter()
            .map(|c| ColumnData::new(c.spec.builder_kind()))
            .collect();
        TableDelta {
            rel,
            actions: vec![],
            txn_tags: DictColumn::default(),
            txn_servers: DictColumn::default(),
            txn_groups: DictColumn::default(),
            txn_seqs: vec![],
            txn_stmt_ords: vec![],
            columns,
            insert_count: 0,
            update_count: 0,
            delete_count: 0,
            bytes: 0,
        }
    }

    pub fn append(&mut self, action: u8, txn: TxnInfo<'_>, row: Vec<EngineValue>) -> SResult<()> {
        self.actions.push(action);
        self.txn_tags.append(txn.tag);
        self.txn_servers.append(txn.server);
        self.txn_groups.append(txn.group);
        self.txn_seqs.push(txn.seq);
        self.txn_stmt_ords.push(txn.stmt_ord);
        self.bytes += 32;

        for (idx, value) in row.into_iter().enumerate() {
            let column = self.columns.get_mut(idx).ok_or_else(|| {
                ServerError::Protocol(format!(
                    "row wider than relation {} schema",
                    self.rel.rel_id
                ))
            })?;
            self.bytes += column.push(value)?;
        }

        match action {
            ACTION_DELETE => self.delete_count += 1,
            ACTION_UPDATE => self.update_count += 1,
            _ => self.insert_count += 1,
        }
        Ok(())
    }

    /// An update arriving without any old tuple still counts as a delete so
    /// the merge keeps its UPSERT+DELETE shape.
    pub fn mark_synthetic_delete(&mut self) {
        self.delete_count += 1;
    }

    pub fn row_count(&self) -> usize {
        self.actions.len()
    }

    fn augmented_row(&self, row: usize) -> Vec<EngineValue> {
        let mut out = Vec::with_capacity(self.columns.len() + 6);
        out.push(EngineValue::Int(self.actions[row] as i64));
        out.push(EngineValue::Text(self.txn_tags.get(row).to_string()));
        out.push(EngineValue::Text(self.txn_servers.get(row).to_string()));
        out.push(EngineValue::Text(self.txn_groups.get(row).to_string()));
        out.push(EngineValue::UInt(self.txn_seqs[row]));
        out.push(EngineValue::UInt(self.txn_stmt_ords[row]));
        for column in &self.columns {
            out.push(column.get(row));
        }
        out
    }

    fn user_row(&self, row: usize) -> Vec<EngineValue> {
        self.columns.iter().map(|c| c.get(row)).collect()
    }
}

/// All pending changes since the last flush, keyed by relation id.
#[derive(Debug, Default)]
pub struct Delta {
    pub tables: HashMap<u32, TableDelta>,
    tmp_seq: u64,
}

impl Delta {
    pub fn new() -> Self {
        Delta::default()
    }

    pub fn table_mut(&mut self, rel: &RelationDescriptor) -> &mut TableDelta {
        self.tables
            .entry(rel.rel_id)
            .or_insert_with(|| TableDelta::new(rel.clone()))
    }

    pub fn remove(&mut self, rel_id: u32) -> Option<TableDelta> {
        self.tables.remove(&rel_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.tables.values().any(|t| t.row_count() > 0 || t.delete_count > 0)
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.row_count()).sum()
    }

    pub fn byte_size(&self) -> usize {
        self.tables.values().map(|t| t.bytes).sum()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    /// Merge every buffered table into the engine. The caller holds the
    /// surrounding transaction; LSN bookkeeping happens in the same
    /// transaction, after this returns.
    pub fn merge_into(&mut self, conn: &mut dyn EngineConn) -> SResult<()> {
        let mut rel_ids: Vec<u32> = self.tables.keys().copied().collect();
        rel_ids.sort_unstable();
        for rel_id in rel_ids {
            self.tmp_seq += 1;
            let table = self.tables.get(&rel_id).unwrap();
            merge_table(conn, table, self.tmp_seq)?;
        }
        Ok(())
    }
}

/// Merge one table's buffer. Zero deletes takes the plain-insert fast path;
/// otherwise rows land in a temp table and are folded with one UPSERT and
/// one DELETE, ordered by (txn_seq, stmt ordinal, action).
fn merge_table(conn: &mut dyn EngineConn, table: &TableDelta, tmp_seq: u64) -> SResult<()> {
    if table.row_count() == 0 {
        return Ok(());
    }

    debug!(
        "merging {} rows into {} (inserts={} updates={} deletes={})",
        table.row_count(),
        table.rel.full_name(),
        table.insert_count,
        table.update_count,
        table.delete_count
    );

    if table.delete_count == 0 {
        let mut appender = conn.appender(&table.rel.namespace, &table.rel.table)?;
        for row in 0..table.row_count() {
            appender.append_row(&table.user_row(row))?;
        }
        appender.flush()?;
        return Ok(());
    }

    let tmp_name = format!("delta_{}_{}", table.rel.rel_id, tmp_seq);
    let mut tmp_cols = vec![
        "action UTINYINT".to_string(),
        "txn_tag VARCHAR".to_string(),
        "txn_server VARCHAR".to_string(),
        "txn_group VARCHAR".to_string(),
        "txn_seq UBIGINT".to_string(),
        "txn_stmt_ord UBIGINT".to_string(),
    ];
    for field in &table.rel.columns {
        tmp_cols.push(format!("{} {}", quote_ident(&field.name), field.spec.engine_name()));
    }
    conn.execute(&format!(
        "CREATE TEMP TABLE {} ({})",
        quote_ident(&tmp_name),
        tmp_cols.join(", ")
    ))?;

    let mut appender = conn.appender("temp", &tmp_name)?;
    for row in 0..table.row_count() {
        appender.append_row(&table.augmented_row(row))?;
    }
    appender.flush()?;

    let keys: Vec<String> = table
        .rel
        .key_columns()
        .iter()
        .map(|k| quote_ident(k))
        .collect();
    let user_cols: Vec<String> = table
        .rel
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect();
    let target = table.rel.full_name().to_string();
    let ranked = format!(
        "SELECT *, row_number() OVER (PARTITION BY {keys} ORDER BY txn_seq DESC, txn_stmt_ord DESC, action DESC) AS rn FROM temp.{tmp}",
        keys = keys.join(", "),
        tmp = quote_ident(&tmp_name),
    );

    conn.execute(&format!(
        "INSERT OR REPLACE INTO {target} SELECT {cols} FROM ({ranked}) WHERE rn = 1 AND action <> {del}",
        target = target,
        cols = user_cols.join(", "),
        ranked = ranked,
        del = ACTION_DELETE,
    ))?;

    let key_match: Vec<String> = keys
        .iter()
        .map(|k| format!("d.{k} = {target}.{k}", k = k, target = target))
        .collect();
    conn.execute(&format!(
        "DELETE FROM {target} WHERE EXISTS (SELECT 1 FROM ({ranked}) d WHERE d.rn = 1 AND d.action = {del} AND {key_match})",
        target = target,
        ranked = ranked,
        del = ACTION_DELETE,
        key_match = key_match.join(" AND "),
    ))?;

    conn.execute(&format!("DROP TABLE temp.{}", quote_ident(&tmp_name)))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use catalog::types::pg_oid;
    use engine::iface::EngineConnector;
    use engine::mock::MockConnector;
    use engine::value::EngineValue;

    use super::{Delta, TxnInfo, ACTION_DELETE, ACTION_INSERT};
    use crate::pgoutput::RelationColumn;
    use crate::relation::RelationDescriptor;

    fn rel() -> RelationDescriptor {
        RelationDescriptor::from_message(
            16384,
            "public",
            "t",
            &[
                RelationColumn {
                    flags: 1,
                    name: "id".to_string(),
                    type_oid: pg_oid::INT4,
                    type_modifier: -1,
                },
                RelationColumn {
                    flags: 0,
                    name: "name".to_string(),
                    type_oid: pg_oid::TEXT,
                    type_modifier: -1,
                },
            ],
        )
        .unwrap()
    }

    fn txn(seq: u64, ord: u64) -> TxnInfo<'static> {
        TxnInfo {
            tag: "sub1",
            server: "primary",
            group: "pub1",
            seq,
            stmt_ord: ord,
        }
    }

    #[test]
    fn test_insert_only_fast_path() {
        let rel = rel();
        let mut delta = Delta::new();
        let table = delta.table_mut(&rel);
        table
            .append(
                ACTION_INSERT,
                txn(10, 0),
                vec![EngineValue::Int(1), EngineValue::Text("a".to_string())],
            )
            .unwrap();
        table
            .append(
                ACTION_INSERT,
                txn(10, 1),
                vec![EngineValue::Int(2), EngineValue::Text("b".to_string())],
            )
            .unwrap();
        assert!(delta.is_dirty());
        assert_eq!(delta.row_count(), 2);

        let connector = MockConnector::new();
        let mut conn = connector.connect("main").unwrap();
        delta.merge_into(conn.as_mut()).unwrap();

        // appender straight into the target, no temp table, no DELETE
        let log = connector.log();
        assert!(log.iter().any(|l| l == "APPEND public.t"));
        assert!(!log.iter().any(|l| l.contains("CREATE TEMP TABLE")));

        let state = connector.state.lock().unwrap();
        let appended = state.appended.get("public.t").unwrap();
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0][0], EngineValue::Int(1));
    }

    #[test]
    fn test_merge_with_deletes() {
        let rel = rel();
        let mut delta = Delta::new();
        let table = delta.table_mut(&rel);
        table
            .append(
                ACTION_DELETE,
                txn(10, 0),
                vec![EngineValue::Int(1), EngineValue::Null],
            )
            .unwrap();
        table
            .append(
                ACTION_INSERT,
                txn(10, 0),
                vec![EngineValue::Int(1), EngineValue::Text("new".to_string())],
            )
            .unwrap();

        let connector = MockConnector::new();
        let mut conn = connector.connect("main").unwrap();
        delta.merge_into(conn.as_mut()).unwrap();

        let log = connector.log().join("\n");
        assert!(log.contains("CREATE TEMP TABLE"));
        assert!(log.contains("INSERT OR REPLACE INTO \"public\".\"t\""));
        assert!(log.contains("ORDER BY txn_seq DESC, txn_stmt_ord DESC, action DESC"));
        assert!(log.contains("DELETE FROM \"public\".\"t\" WHERE EXISTS"));
        assert!(log.contains("DROP TABLE temp."));

        // augmented rows carry action + txn metadata ahead of user columns
        let state = connector.state.lock().unwrap();
        let appended = state.appended.values().next().unwrap();
        assert_eq!(appended[0][0], EngineValue::Int(0)); // delete action
        assert_eq!(appended[0][4], EngineValue::UInt(10)); // txn_seq
        assert_eq!(appended[1][0], EngineValue::Int(2)); // insert action
    }

    #[test]
    fn test_synthetic_delete_forces_merge_path() {
        let rel = rel();
        let mut delta = Delta::new();
        let table = delta.table_mut(&rel);
        table.mark_synthetic_delete();
        table
            .append(
                ACTION_INSERT,
                txn(11, 0),
                vec![EngineValue::Int(3), EngineValue::Text("c".to_string())],
            )
            .unwrap();
        assert_eq!(table.delete_count, 1);

        let connector = MockConnector::new();
        let mut conn = connector.connect("main").unwrap();
        delta.merge_into(conn.as_mut()).unwrap();

        let log = connector.log().join("\n");
        assert!(log.contains("CREATE TEMP TABLE"));
    }
}
