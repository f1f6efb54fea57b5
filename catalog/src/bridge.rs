//! Mapping between client-visible schema metadata and the engine catalog:
//! identifier quoting, index-name mangling, and the column comments that
//! carry source-dialect type hints so SHOW CREATE TABLE round-trips.

use std::fmt;

use serde::{Deserialize, Serialize};

use common::err::SResult;
use engine::iface::{CatalogColumn, EngineColumn, EngineConn};

use crate::types::TypeSpec;

/// Separator between table and index in engine-side index names. Index names
/// are only unique per table on the client surfaces, but global per schema in
/// the engine.
const INDEX_SEP: &str = "$$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTableName {
    pub schema: String,
    pub table: String,
}

impl FullTableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        FullTableName {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for FullTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Quote an identifier for engine SQL. Quoting is unconditional so replicated
/// names never collide with keywords.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn encode_index_name(table: &str, index: &str) -> String {
    format!("{}{}{}", table, INDEX_SEP, index)
}

/// Reverse of `encode_index_name`. A bare name without the separator maps to
/// itself: the table was created outside the bridge.
pub fn decode_index_name(engine_name: &str) -> (Option<&str>, &str) {
    match engine_name.split_once(INDEX_SEP) {
        Some((table, index)) => (Some(table), index),
        None => (None, engine_name),
    }
}

/// Column comment payload. Only columns created through the MySQL surface
/// carry a hint; anything else in the comment is preserved untouched.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct CommentHint {
    #[serde(skip_serializing_if = "Option::is_none")]
    mysql_type: Option<String>,
}

pub fn encode_type_comment(mysql_def: &str) -> String {
    serde_json::to_string(&CommentHint {
        mysql_type: Some(mysql_def.to_string()),
    })
    .unwrap_or_default()
}

/// Decode a comment written by `encode_type_comment`. Absent or foreign
/// comments yield None.
pub fn decode_type_comment(comment: Option<&str>) -> Option<String> {
    let comment = comment?;
    let hint: CommentHint = serde_json::from_str(comment).ok()?;
    hint.mysql_type
}

/// One client-visible field, inferred from engine metadata.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub spec: TypeSpec,
    pub nullable: bool,
    pub primary_key: bool,
    /// MySQL definition recovered from the comment hint, if any.
    pub mysql_hint: Option<String>,
}

impl Field {
    /// MySQL DDL fragment for SHOW CREATE TABLE.
    pub fn mysql_def(&self) -> String {
        match &self.mysql_hint {
            Some(hint) => hint.clone(),
            None => self.spec.mysql_def(),
        }
    }
}

/// Walk driver-reported column types into the tagged type map.
pub fn infer_fields(columns: &[CatalogColumn]) -> SResult<Vec<Field>> {
    let mut fields = Vec::with_capacity(columns.len());
    for column in columns {
        fields.push(Field {
            name: column.name.clone(),
            spec: TypeSpec::from_engine_name(&column.type_name)?,
            nullable: column.nullable,
            primary_key: column.primary_key,
            mysql_hint: decode_type_comment(column.comment.as_deref()),
        });
    }
    Ok(fields)
}

/// Same inference for bare result-set descriptors (no comments available).
pub fn infer_result_fields(columns: &[EngineColumn]) -> SResult<Vec<Field>> {
    let mut fields = Vec::with_capacity(columns.len());
    for column in columns {
        fields.push(Field {
            name: column.name.clone(),
            spec: TypeSpec::from_engine_name(&column.type_name)?,
            nullable: column.nullable,
            primary_key: false,
            mysql_hint: None,
        });
    }
    Ok(fields)
}

/// Render the SHOW CREATE TABLE definition for a table, using the comment
/// hints where present so MySQL-created types round-trip.
pub fn show_create_table(
    conn: &mut dyn EngineConn,
    schema: &str,
    table: &str,
) -> SResult<String> {
    let columns = conn.table_columns(schema, table)?;
    let fields = infer_fields(&columns)?;
    let indexes = conn.table_indexes(schema, table)?;

    let mut lines: Vec<String> = Vec::new();
    let mut key_columns: Vec<String> = Vec::new();
    for field in &fields {
        let mut line = format!("  `{}` {}", field.name, field.mysql_def());
        if !field.nullable {
            line.push_str(" NOT NULL");
        }
        lines.push(line);
        if field.primary_key {
            key_columns.push(format!("`{}`", field.name));
        }
    }
    if !key_columns.is_empty() {
        lines.push(format!("  PRIMARY KEY ({})", key_columns.join(",")));
    }
    for index in &indexes {
        let (_, index_name) = decode_index_name(&index.name);
        let cols: Vec<String> = index.columns.iter().map(|c| format!("`{}`", c)).collect();
        let kind = if index.unique { "UNIQUE KEY" } else { "KEY" };
        lines.push(format!("  {} `{}` ({})", kind, index_name, cols.join(",")));
    }

    Ok(format!(
        "CREATE TABLE `{}` (\n{}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        table,
        lines.join(",\n")
    ))
}

#[cfg(test)]
mod test {
    use engine::iface::CatalogColumn;

    use super::{
        decode_index_name, decode_type_comment, encode_index_name, encode_type_comment,
        infer_fields, quote_ident, FullTableName,
    };
    use crate::types::TypeSpec;

    #[test]
    fn test_quote() {
        assert_eq!(quote_ident("t"), "\"t\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            FullTableName::new("db", "t").to_string(),
            "\"db\".\"t\""
        );
    }

    #[test]
    fn test_index_names() {
        let mangled = encode_index_name("orders", "by_customer");
        assert_eq!(mangled, "orders$$by_customer");
        assert_eq!(decode_index_name(&mangled), (Some("orders"), "by_customer"));
        assert_eq!(decode_index_name("plain"), (None, "plain"));
    }

    #[test]
    fn test_comment_round_trip() {
        let comment = encode_type_comment("varchar(255)");
        assert_eq!(
            decode_type_comment(Some(&comment)),
            Some("varchar(255)".to_string())
        );
        assert_eq!(decode_type_comment(Some("free text note")), None);
        assert_eq!(decode_type_comment(None), None);
    }

    #[test]
    fn test_infer_fields_uses_hint() {
        let columns = vec![
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
                comment: Some(encode_type_comment("varchar(64)")),
                primary_key: false,
            },
        ];
        let fields = infer_fields(&columns).unwrap();
        assert_eq!(fields[0].spec, TypeSpec::Integer);
        assert_eq!(fields[0].mysql_def(), "int");
        assert_eq!(fields[1].mysql_def(), "varchar(64)");
    }
}
