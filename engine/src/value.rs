use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// One cell travelling between the wire layers, the delta buffer and the
/// engine. Engine type, MySQL type, PostgreSQL OID and columnar builder kind
/// form a closed set, so a tagged variant is used throughout instead of a
/// trait hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Exact numerics travel as text, the engine parses them.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
}

impl EngineValue {
    pub fn is_null(&self) -> bool {
        matches!(self, EngineValue::Null)
    }

    /// Wire-text rendering, shared by both protocols' text result formats.
    pub fn render_text(&self) -> Option<String> {
        match self {
            EngineValue::Null => None,
            EngineValue::Bool(v) => Some(if *v { "t".to_string() } else { "f".to_string() }),
            EngineValue::Int(v) => Some(v.to_string()),
            EngineValue::UInt(v) => Some(v.to_string()),
            EngineValue::Float(v) => Some(v.to_string()),
            EngineValue::Decimal(v) => Some(v.clone()),
            EngineValue::Text(v) => Some(v.clone()),
            EngineValue::Bytes(v) => Some(format!("\\x{}", hex::encode(v))),
            EngineValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            EngineValue::Time(v) => Some(v.format("%H:%M:%S%.f").to_string()),
            EngineValue::Timestamp(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        }
    }

    /// Escape into an engine SQL literal. Used where a statement cannot be
    /// prepared, e.g. the subscription store bookkeeping.
    pub fn sql_literal(&self) -> String {
        match self {
            EngineValue::Null => "NULL".to_string(),
            EngineValue::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
            EngineValue::Int(v) => v.to_string(),
            EngineValue::UInt(v) => v.to_string(),
            EngineValue::Float(v) => v.to_string(),
            EngineValue::Decimal(v) => v.clone(),
            EngineValue::Text(v) => quote_literal(v),
            EngineValue::Bytes(v) => format!("'\\x{}'::BLOB", hex::encode(v)),
            EngineValue::Date(v) => format!("DATE '{}'", v.format("%Y-%m-%d")),
            EngineValue::Time(v) => format!("TIME '{}'", v.format("%H:%M:%S%.f")),
            EngineValue::Timestamp(v) => {
                format!("TIMESTAMP '{}'", v.format("%Y-%m-%d %H:%M:%S%.6f"))
            }
        }
    }
}

pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
