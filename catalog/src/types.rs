use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use common::err::server_error::ServerError;
use common::err::SResult;
use engine::value::EngineValue;

/// MySQL wire protocol column type identifiers, as sent in column
/// definition packets and binary result rows.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MysqlType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    Varchar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
}

/// Kind of columnar builder the delta buffer allocates for a column.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    Bool,
    Int,
    UInt,
    Float,
    Decimal,
    Text,
    Bytes,
    Date,
    Time,
    Timestamp,
}

/// PostgreSQL type OIDs surfaced in RowDescription / ParameterDescription.
pub mod pg_oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
}

/// The bidirectional type map. One tagged variant covers the engine type,
/// the MySQL column type, the PostgreSQL OID and the delta builder kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSpec {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    UTinyInt,
    USmallInt,
    UInteger,
    UBigInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Varchar,
    Blob,
    Date,
    Time,
    Timestamp,
    TimestampTz,
}

impl TypeSpec {
    /// Map an engine driver-reported type name. Parameterized names carry
    /// their arguments, e.g. `DECIMAL(10,2)`.
    pub fn from_engine_name(name: &str) -> SResult<TypeSpec> {
        let upper = name.trim().to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("DECIMAL") {
            let (precision, scale) = parse_decimal_args(rest)?;
            return Ok(TypeSpec::Decimal { precision, scale });
        }
        if let Some(rest) = upper.strip_prefix("NUMERIC") {
            let (precision, scale) = parse_decimal_args(rest)?;
            return Ok(TypeSpec::Decimal { precision, scale });
        }
        let spec = match upper.as_str() {
            "BOOLEAN" | "BOOL" => TypeSpec::Boolean,
            "TINYINT" | "INT1" => TypeSpec::TinyInt,
            "SMALLINT" | "INT2" | "SHORT" => TypeSpec::SmallInt,
            "INTEGER" | "INT" | "INT4" | "SIGNED" => TypeSpec::Integer,
            "BIGINT" | "INT8" | "LONG" => TypeSpec::BigInt,
            "UTINYINT" => TypeSpec::UTinyInt,
            "USMALLINT" => TypeSpec::USmallInt,
            "UINTEGER" => TypeSpec::UInteger,
            "UBIGINT" => TypeSpec::UBigInt,
            "FLOAT" | "FLOAT4" | "REAL" => TypeSpec::Float,
            "DOUBLE" | "FLOAT8" => TypeSpec::Double,
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "BPCHAR" => TypeSpec::Varchar,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => TypeSpec::Blob,
            "DATE" => TypeSpec::Date,
            "TIME" => TypeSpec::Time,
            "TIMESTAMP" | "DATETIME" => TypeSpec::Timestamp,
            "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" => TypeSpec::TimestampTz,
            _ => {
                return Err(ServerError::Unsupported(format!(
                    "engine type '{}'",
                    name
                )))
            }
        };
        Ok(spec)
    }

    pub fn engine_name(&self) -> String {
        match self {
            TypeSpec::Boolean => "BOOLEAN".to_string(),
            TypeSpec::TinyInt => "TINYINT".to_string(),
            TypeSpec::SmallInt => "SMALLINT".to_string(),
            TypeSpec::Integer => "INTEGER".to_string(),
            TypeSpec::BigInt => "BIGINT".to_string(),
            TypeSpec::UTinyInt => "UTINYINT".to_string(),
            TypeSpec::USmallInt => "USMALLINT".to_string(),
            TypeSpec::UInteger => "UINTEGER".to_string(),
            TypeSpec::UBigInt => "UBIGINT".to_string(),
            TypeSpec::Float => "FLOAT".to_string(),
            TypeSpec::Double => "DOUBLE".to_string(),
            TypeSpec::Decimal { precision, scale } => {
                format!("DECIMAL({},{})", precision, scale)
            }
            TypeSpec::Varchar => "VARCHAR".to_string(),
            TypeSpec::Blob => "BLOB".to_string(),
            TypeSpec::Date => "DATE".to_string(),
            TypeSpec::Time => "TIME".to_string(),
            TypeSpec::Timestamp => "TIMESTAMP".to_string(),
            TypeSpec::TimestampTz => "TIMESTAMP WITH TIME ZONE".to_string(),
        }
    }

    pub fn from_pg_oid(oid: u32) -> SResult<TypeSpec> {
        let spec = match oid {
            pg_oid::BOOL => TypeSpec::Boolean,
            pg_oid::INT2 => TypeSpec::SmallInt,
            pg_oid::INT4 => TypeSpec::Integer,
            pg_oid::INT8 => TypeSpec::BigInt,
            pg_oid::FLOAT4 => TypeSpec::Float,
            pg_oid::FLOAT8 => TypeSpec::Double,
            pg_oid::NUMERIC => TypeSpec::Decimal {
                precision: 38,
                scale: 9,
            },
            pg_oid::TEXT | pg_oid::VARCHAR => TypeSpec::Varchar,
            pg_oid::BYTEA => TypeSpec::Blob,
            pg_oid::DATE => TypeSpec::Date,
            pg_oid::TIME => TypeSpec::Time,
            pg_oid::TIMESTAMP => TypeSpec::Timestamp,
            pg_oid::TIMESTAMPTZ => TypeSpec::TimestampTz,
            // replicated columns of an unmapped type degrade to text
            _ => TypeSpec::Varchar,
        };
        Ok(spec)
    }

    pub fn pg_oid(&self) -> u32 {
        match self {
            TypeSpec::Boolean => pg_oid::BOOL,
            TypeSpec::TinyInt | TypeSpec::SmallInt | TypeSpec::UTinyInt => pg_oid::INT2,
            TypeSpec::Integer | TypeSpec::USmallInt => pg_oid::INT4,
            TypeSpec::BigInt | TypeSpec::UInteger => pg_oid::INT8,
            TypeSpec::UBigInt => pg_oid::NUMERIC,
            TypeSpec::Float => pg_oid::FLOAT4,
            TypeSpec::Double => pg_oid::FLOAT8,
            TypeSpec::Decimal { .. } => pg_oid::NUMERIC,
            TypeSpec::Varchar => pg_oid::VARCHAR,
            TypeSpec::Blob => pg_oid::BYTEA,
            TypeSpec::Date => pg_oid::DATE,
            TypeSpec::Time => pg_oid::TIME,
            TypeSpec::Timestamp => pg_oid::TIMESTAMP,
            TypeSpec::TimestampTz => pg_oid::TIMESTAMPTZ,
        }
    }

    /// `pg_type.typlen` for the wire descriptor; -1 is varlena.
    pub fn pg_typlen(&self) -> i16 {
        match self {
            TypeSpec::Boolean | TypeSpec::TinyInt | TypeSpec::UTinyInt => 1,
            TypeSpec::SmallInt | TypeSpec::USmallInt => 2,
            TypeSpec::Integer | TypeSpec::UInteger | TypeSpec::Float => 4,
            TypeSpec::BigInt | TypeSpec::Double | TypeSpec::Date | TypeSpec::Time => 8,
            TypeSpec::Timestamp | TypeSpec::TimestampTz => 8,
            _ => -1,
        }
    }

    pub fn mysql_type(&self) -> MysqlType {
        match self {
            TypeSpec::Boolean | TypeSpec::TinyInt | TypeSpec::UTinyInt => MysqlType::Tiny,
            TypeSpec::SmallInt | TypeSpec::USmallInt => MysqlType::Short,
            TypeSpec::Integer | TypeSpec::UInteger => MysqlType::Long,
            TypeSpec::BigInt | TypeSpec::UBigInt => MysqlType::LongLong,
            TypeSpec::Float => MysqlType::Float,
            TypeSpec::Double => MysqlType::Double,
            TypeSpec::Decimal { .. } => MysqlType::NewDecimal,
            TypeSpec::Varchar => MysqlType::VarString,
            TypeSpec::Blob => MysqlType::Blob,
            TypeSpec::Date => MysqlType::Date,
            TypeSpec::Time => MysqlType::Time,
            TypeSpec::Timestamp | TypeSpec::TimestampTz => MysqlType::DateTime,
        }
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            TypeSpec::UTinyInt | TypeSpec::USmallInt | TypeSpec::UInteger | TypeSpec::UBigInt
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, TypeSpec::Blob)
    }

    /// MySQL DDL rendering, used by SHOW CREATE TABLE when no comment hint
    /// is present.
    pub fn mysql_def(&self) -> String {
        match self {
            TypeSpec::Boolean => "tinyint(1)".to_string(),
            TypeSpec::TinyInt => "tinyint".to_string(),
            TypeSpec::SmallInt => "smallint".to_string(),
            TypeSpec::Integer => "int".to_string(),
            TypeSpec::BigInt => "bigint".to_string(),
            TypeSpec::UTinyInt => "tinyint unsigned".to_string(),
            TypeSpec::USmallInt => "smallint unsigned".to_string(),
            TypeSpec::UInteger => "int unsigned".to_string(),
            TypeSpec::UBigInt => "bigint unsigned".to_string(),
            TypeSpec::Float => "float".to_string(),
            TypeSpec::Double => "double".to_string(),
            TypeSpec::Decimal { precision, scale } => {
                format!("decimal({},{})", precision, scale)
            }
            TypeSpec::Varchar => "text".to_string(),
            TypeSpec::Blob => "blob".to_string(),
            TypeSpec::Date => "date".to_string(),
            TypeSpec::Time => "time".to_string(),
            TypeSpec::Timestamp => "datetime".to_string(),
            TypeSpec::TimestampTz => "timestamp".to_string(),
        }
    }

    /// Parse a MySQL column definition, either from client DDL or from a
    /// column-comment hint. Display widths and charsets are accepted and
    /// dropped.
    pub fn from_mysql_def(def: &str) -> SResult<TypeSpec> {
        let lower = def.trim().to_ascii_lowercase();
        let unsigned = lower.contains("unsigned");
        let base = lower
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or("");

        if base == "decimal" || base == "numeric" {
            let rest = lower
                .find('(')
                .map(|i| &lower[i..])
                .unwrap_or("(10,0)");
            let (precision, scale) = parse_decimal_args(rest)?;
            return Ok(TypeSpec::Decimal { precision, scale });
        }

        let spec = match base {
            "bool" | "boolean" => TypeSpec::Boolean,
            "tinyint" => {
                if lower.starts_with("tinyint(1)") {
                    TypeSpec::Boolean
                } else if unsigned {
                    TypeSpec::UTinyInt
                } else {
                    TypeSpec::TinyInt
                }
            }
            "smallint" => {
                if unsigned {
                    TypeSpec::USmallInt
                } else {
                    TypeSpec::SmallInt
                }
            }
            "int" | "integer" | "mediumint" => {
                if unsigned {
                    TypeSpec::UInteger
                } else {
                    TypeSpec::Integer
                }
            }
            "bigint" => {
                if unsigned {
                    TypeSpec::UBigInt
                } else {
                    TypeSpec::BigInt
                }
            }
            "float" => TypeSpec::Float,
            "double" | "real" => TypeSpec::Double,
            "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum"
            | "set" | "json" => TypeSpec::Varchar,
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
                TypeSpec::Blob
            }
            "date" => TypeSpec::Date,
            "time" => TypeSpec::Time,
            "datetime" => TypeSpec::Timestamp,
            "timestamp" => TypeSpec::TimestampTz,
            "year" => TypeSpec::SmallInt,
            _ => {
                return Err(ServerError::Unsupported(format!(
                    "mysql type '{}'",
                    def
                )))
            }
        };
        Ok(spec)
    }

    /// Decode a wire-text value (PostgreSQL text format, also used by the
    /// replication tuple cells) into an engine cell.
    pub fn decode_text(&self, text: &str) -> SResult<EngineValue> {
        let bad = |what: &str| ServerError::Parse(format!("bad {} value '{}'", what, text));
        let value = match self {
            TypeSpec::Boolean => match text {
                "t" | "true" | "TRUE" | "1" | "on" => EngineValue::Bool(true),
                "f" | "false" | "FALSE" | "0" | "off" => EngineValue::Bool(false),
                _ => return Err(bad("boolean")),
            },
            TypeSpec::TinyInt | TypeSpec::SmallInt | TypeSpec::Integer | TypeSpec::BigInt => {
                EngineValue::Int(text.parse::<i64>().map_err(|_| bad("integer"))?)
            }
            TypeSpec::UTinyInt
            | TypeSpec::USmallInt
            | TypeSpec::UInteger
            | TypeSpec::UBigInt => {
                EngineValue::UInt(text.parse::<u64>().map_err(|_| bad("unsigned"))?)
            }
            TypeSpec::Float | TypeSpec::Double => {
                EngineValue::Float(text.parse::<f64>().map_err(|_| bad("float"))?)
            }
            TypeSpec::Decimal { .. } => EngineValue::Decimal(text.to_string()),
            TypeSpec::Varchar => EngineValue::Text(text.to_string()),
            TypeSpec::Blob => {
                let bytes = match text.strip_prefix("\\x") {
                    Some(hex_text) => hex::decode(hex_text).map_err(|_| bad("bytea"))?,
                    None => text.as_bytes().to_vec(),
                };
                EngineValue::Bytes(bytes)
            }
            TypeSpec::Date => EngineValue::Date(
                NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| bad("date"))?,
            ),
            TypeSpec::Time => EngineValue::Time(
                NaiveTime::parse_from_str(text, "%H:%M:%S%.f").map_err(|_| bad("time"))?,
            ),
            TypeSpec::Timestamp => EngineValue::Timestamp(
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|_| bad("timestamp"))?,
            ),
            TypeSpec::TimestampTz => {
                match DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
                    Ok(ts) => EngineValue::Timestamp(ts.naive_utc()),
                    Err(_) => EngineValue::Timestamp(
                        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                            .map_err(|_| bad("timestamptz"))?,
                    ),
                }
            }
        };
        Ok(value)
    }

    pub fn builder_kind(&self) -> BuilderKind {
        match self {
            TypeSpec::Boolean => BuilderKind::Bool,
            TypeSpec::TinyInt | TypeSpec::SmallInt | TypeSpec::Integer | TypeSpec::BigInt => {
                BuilderKind::Int
            }
            TypeSpec::UTinyInt | TypeSpec::USmallInt | TypeSpec::UInteger | TypeSpec::UBigInt => {
                BuilderKind::UInt
            }
            TypeSpec::Float | TypeSpec::Double => BuilderKind::Float,
            TypeSpec::Decimal { .. } => BuilderKind::Decimal,
            TypeSpec::Varchar => BuilderKind::Text,
            TypeSpec::Blob => BuilderKind::Bytes,
            TypeSpec::Date => BuilderKind::Date,
            TypeSpec::Time => BuilderKind::Time,
            TypeSpec::Timestamp | TypeSpec::TimestampTz => BuilderKind::Timestamp,
        }
    }
}

fn parse_decimal_args(rest: &str) -> SResult<(u8, u8)> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Ok((10, 0));
    }
    let inner = rest
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .ok_or_else(|| ServerError::Parse(format!("bad decimal arguments '{}'", rest)))?;
    let mut parts = inner.split(',');
    let precision: u8 = parts
        .next()
        .unwrap_or("10")
        .trim()
        .parse()
        .map_err(|_| ServerError::Parse(format!("bad decimal precision '{}'", inner)))?;
    let scale: u8 = match parts.next() {
        Some(s) => s
            .trim()
            .parse()
            .map_err(|_| ServerError::Parse(format!("bad decimal scale '{}'", inner)))?,
        None => 0,
    };
    Ok((precision, scale))
}

#[cfg(test)]
mod test {
    use super::{pg_oid, MysqlType, TypeSpec};

    #[test]
    fn test_engine_round_trip() {
        for name in [
            "BOOLEAN",
            "TINYINT",
            "SMALLINT",
            "INTEGER",
            "BIGINT",
            "UBIGINT",
            "FLOAT",
            "DOUBLE",
            "VARCHAR",
            "BLOB",
            "DATE",
            "TIME",
            "TIMESTAMP",
        ] {
            let spec = TypeSpec::from_engine_name(name).unwrap();
            assert_eq!(spec.engine_name(), name);
        }

        let spec = TypeSpec::from_engine_name("DECIMAL(12,3)").unwrap();
        assert_eq!(
            spec,
            TypeSpec::Decimal {
                precision: 12,
                scale: 3
            }
        );
        assert_eq!(spec.engine_name(), "DECIMAL(12,3)");
    }

    #[test]
    fn test_mysql_defs() {
        assert_eq!(
            TypeSpec::from_mysql_def("bigint unsigned").unwrap(),
            TypeSpec::UBigInt
        );
        assert_eq!(
            TypeSpec::from_mysql_def("tinyint(1)").unwrap(),
            TypeSpec::Boolean
        );
        assert_eq!(
            TypeSpec::from_mysql_def("varchar(255)").unwrap(),
            TypeSpec::Varchar
        );
        assert_eq!(
            TypeSpec::from_mysql_def("decimal(8,2)").unwrap(),
            TypeSpec::Decimal {
                precision: 8,
                scale: 2
            }
        );
        assert_eq!(TypeSpec::Integer.mysql_type(), MysqlType::Long);
    }

    #[test]
    fn test_pg_oids() {
        assert_eq!(TypeSpec::from_pg_oid(pg_oid::INT4).unwrap(), TypeSpec::Integer);
        assert_eq!(TypeSpec::Varchar.pg_oid(), pg_oid::VARCHAR);
        assert_eq!(TypeSpec::Varchar.pg_typlen(), -1);
        assert_eq!(TypeSpec::BigInt.pg_typlen(), 8);
        // unknown OIDs degrade to text rather than failing the stream
        assert_eq!(TypeSpec::from_pg_oid(3802).unwrap(), TypeSpec::Varchar);
    }

    #[test]
    fn test_decode_text() {
        use engine::value::EngineValue;

        assert_eq!(
            TypeSpec::Boolean.decode_text("t").unwrap(),
            EngineValue::Bool(true)
        );
        assert_eq!(
            TypeSpec::BigInt.decode_text("-12").unwrap(),
            EngineValue::Int(-12)
        );
        assert_eq!(
            TypeSpec::Blob.decode_text("\\xdead").unwrap(),
            EngineValue::Bytes(vec![0xde, 0xad])
        );
        assert_eq!(
            TypeSpec::Date.decode_text("2024-02-29").unwrap(),
            EngineValue::Date(chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert!(TypeSpec::Integer.decode_text("abc").is_err());
    }

    #[test]
    fn test_mysql_type_codes() {
        assert_eq!(u8::from(MysqlType::NewDecimal), 0xf6);
        assert_eq!(MysqlType::try_from(0x08u8).unwrap(), MysqlType::LongLong);
    }
}
