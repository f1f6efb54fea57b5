use catalog::bridge::{quote_ident, FullTableName};
use catalog::types::TypeSpec;
use common::err::server_error::ServerError;
use common::err::SResult;
use engine::value::EngineValue;

use crate::pgoutput::{RelationColumn, TupleCell};

/// Cached schema for a replicated table, built from each Relation message.
/// Installed on first sight, replaced on subsequent sight (which also
/// forces a delta flush upstream of this type).
#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    pub rel_id: u32,
    pub namespace: String,
    pub table: String,
    pub columns: Vec<RelationField>,
    /// Ordered indices of the replica-identity key columns.
    pub key_indices: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct RelationField {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    pub key: bool,
    pub spec: TypeSpec,
}

impl RelationDescriptor {
    pub fn from_message(
        rel_id: u32,
        namespace: &str,
        table: &str,
        columns: &[RelationColumn],
    ) -> SResult<Self> {
        let mut fields = Vec::with_capacity(columns.len());
        let mut key_indices = Vec::new();
        for (idx, column) in columns.iter().enumerate() {
            if column.is_key() {
                key_indices.push(idx);
            }
            fields.push(RelationField {
                name: column.name.clone(),
                type_oid: column.type_oid,
                type_modifier: column.type_modifier,
                key: column.is_key(),
                spec: TypeSpec::from_pg_oid(column.type_oid)?,
            });
        }
        Ok(RelationDescriptor {
            rel_id,
            namespace: namespace.to_string(),
            table: table.to_string(),
            columns: fields,
            key_indices,
        })
    }

    pub fn full_name(&self) -> FullTableName {
        FullTableName::new(self.namespace.clone(), self.table.clone())
    }

    /// Key column names; a table without a replica identity key degrades to
    /// matching on every column.
    pub fn key_columns(&self) -> Vec<&str> {
        if self.key_indices.is_empty() {
            self.columns.iter().map(|c| c.name.as_str()).collect()
        } else {
            self.key_indices
                .iter()
                .map(|i| self.columns[*i].name.as_str())
                .collect()
        }
    }

    /// Engine DDL emitted when the relation is first seen or replaced.
    pub fn create_table_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.spec.engine_name()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.full_name(),
            cols.join(", ")
        )
    }

    pub fn create_schema_sql(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.namespace))
    }

    /// Decode one tuple cell for column `idx` into an engine value.
    /// Unchanged-TOAST cells decode to Null; the merge path never reads
    /// them because the action ordering retains the stored row.
    pub fn decode_cell(&self, idx: usize, cell: &TupleCell) -> SResult<EngineValue> {
        let field = self.columns.get(idx).ok_or_else(|| {
            ServerError::Protocol(format!(
                "tuple cell {} out of range for relation {}",
                idx, self.rel_id
            ))
        })?;
        match cell {
            TupleCell::Null | TupleCell::Unchanged => Ok(EngineValue::Null),
            TupleCell::Text(data) => {
                let text = std::str::from_utf8(data)?;
                field.spec.decode_text(text)
            }
            TupleCell::Binary(data) => Ok(EngineValue::Bytes(data.clone())),
        }
    }

    pub fn decode_tuple(&self, cells: &[TupleCell]) -> SResult<Vec<EngineValue>> {
        let mut row = Vec::with_capacity(self.columns.len());
        for (idx, cell) in cells.iter().enumerate() {
            row.push(self.decode_cell(idx, cell)?);
        }
        // a short tuple pads with nulls after a column was added upstream
        while row.len() < self.columns.len() {
            row.push(EngineValue::Null);
        }
        Ok(row)
    }
}

#[cfg(test)]
mod test {
    use catalog::types::pg_oid;

    use super::RelationDescriptor;
    use crate::pgoutput::{RelationColumn, TupleCell};

    fn descriptor() -> RelationDescriptor {
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

    #[test]
    fn test_descriptor() {
        let rel = descriptor();
        assert_eq!(rel.key_indices, vec![0]);
        assert_eq!(rel.key_columns(), vec!["id"]);
        assert_eq!(
            rel.create_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"public\".\"t\" (\"id\" INTEGER, \"name\" VARCHAR)"
        );
    }

    #[test]
    fn test_decode_tuple() {
        use engine::value::EngineValue;

        let rel = descriptor();
        let row = rel
            .decode_tuple(&[
                TupleCell::Text(b"7".to_vec()),
                TupleCell::Text(b"abc".to_vec()),
            ])
            .unwrap();
        assert_eq!(
            row,
            vec![EngineValue::Int(7), EngineValue::Text("abc".to_string())]
        );

        // short tuples pad with nulls
        let row = rel.decode_tuple(&[TupleCell::Text(b"7".to_vec())]).unwrap();
        assert_eq!(row[1], EngineValue::Null);
    }
}
