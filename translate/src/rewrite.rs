//! Dialect translation: rewrites client SQL into engine SQL. Pure functions
//! over the statement text; every rewrite is idempotent so a statement can
//! pass through the layer more than once.

use lazy_static::lazy_static;
use regex::Regex;

use common::err::SResult;
use engine::iface::EngineConn;

/// Reserved catalog functions answered by macros installed at startup.
const CATALOG_MACROS: &[&str] = &[
    "pg_get_userbyid",
    "pg_table_is_visible",
    "pg_get_expr",
    "pg_get_indexdef",
    "pg_total_relation_size",
    "obj_description",
    "col_description",
];

/// Reserved catalog tables backed by views in the reserved schema.
const CATALOG_TABLES: &[&str] = &[
    "pg_stat_user_tables",
    "pg_stat_activity",
    "pg_replication_slots",
];

lazy_static! {
    static ref RE_REG_CAST: Regex =
        Regex::new(r"(?i)::\s*(regclass|regproc|regtype|regnamespace)\b").unwrap();
    static ref RE_SET_CONFIG: Regex = Regex::new(
        r"(?is)^\s*select\s+pg_catalog\.set_config\('search_path'.*\)\s*;?\s*$"
    )
    .unwrap();
}

/// Rewrite a statement arriving on the PostgreSQL port.
pub fn rewrite_pg(sql: &str) -> String {
    // tautological search_path probe emitted by common drivers
    if RE_SET_CONFIG.is_match(sql) {
        return "SELECT ''".to_string();
    }

    let mut out = sql.to_string();

    // reserved catalog schemas -> reserved engine schema
    for table in CATALOG_TABLES {
        out = out.replace(
            &format!("pg_catalog.{}", table),
            &format!("__sys.{}", table),
        );
    }

    // reserved catalog functions -> locally defined macros
    for func in CATALOG_MACROS {
        let qualified = format!("pg_catalog.{}(", func);
        let local = format!("__sys.{}(", func);
        out = out.replace(&qualified, &local);
        out = replace_unqualified_call(&out, func);
    }

    // the engine has no reg* types
    out = RE_REG_CAST.replace_all(&out, "::varchar").into_owned();

    rewrite_any_op(&out)
}

/// Rewrite a statement arriving on the MySQL port.
pub fn rewrite_mysql(sql: &str) -> String {
    let mut out = strip_version_comments(sql);
    out = backticks_to_quotes(&out);
    rewrite_any_op(&out)
}

/// `x = ANY(expr)` -> `list_contains(expr, x)`. The left-hand side is the
/// token immediately before the operator; the argument is matched with
/// balanced parentheses so nested calls survive.
pub fn rewrite_any_op(sql: &str) -> String {
    lazy_static! {
        static ref RE_ANY: Regex = Regex::new(r"(?i)=\s*ANY\s*\(").unwrap();
    }

    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    loop {
        let Some(m) = RE_ANY.find(rest) else {
            out.push_str(rest);
            return out;
        };

        // token before `=` is the lhs
        let before = rest[..m.start()].trim_end();
        let lhs_start = before
            .rfind(|c: char| !(c.is_alphanumeric() || "_.$\"'".contains(c)))
            .map(|i| i + 1)
            .unwrap_or(0);
        let lhs = &before[lhs_start..];
        if lhs.is_empty() {
            // not an expression position; emit as-is and continue after it
            out.push_str(&rest[..m.end()]);
            rest = &rest[m.end()..];
            continue;
        }

        // balanced-paren scan for the ANY argument
        let arg_start = m.end();
        let mut depth = 1usize;
        let mut arg_end = None;
        for (i, c) in rest[arg_start..].char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        arg_end = Some(arg_start + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(arg_end) = arg_end else {
            out.push_str(rest);
            return out;
        };

        let arg = rest[arg_start..arg_end].trim();
        out.push_str(&before[..lhs_start]);
        out.push_str(&format!("list_contains({}, {})", arg, lhs));
        rest = &rest[arg_end + 1..];
    }
}

/// MySQL `/*!40100 ... */` version comments execute their body.
fn strip_version_comments(sql: &str) -> String {
    lazy_static! {
        static ref RE_VERSION: Regex = Regex::new(r"/\*![0-9]{5}([^*]*)\*/").unwrap();
    }
    RE_VERSION.replace_all(sql, "$1").into_owned()
}

/// Backquoted identifiers become double-quoted for the engine. Backticks
/// inside string literals are left alone.
fn backticks_to_quotes(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '`' if !in_string => out.push('"'),
            _ => out.push(c),
        }
    }
    out
}

fn replace_unqualified_call(sql: &str, func: &str) -> String {
    let needle = format!("{}(", func);
    let target = format!("__sys.{}(", func);
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find(&needle) {
        // not a call of `func` when it is qualified or a suffix of a longer
        // identifier
        let prefix = &rest[..pos];
        let skip = prefix.ends_with('.')
            || prefix
                .chars()
                .last()
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false);
        out.push_str(prefix);
        if skip {
            out.push_str(&needle);
        } else {
            out.push_str(&target);
        }
        rest = &rest[pos + needle.len()..];
    }
    out.push_str(rest);
    out
}

/// Install the reserved schema's macros and catalog views. Run once per
/// engine database at startup, and again after a restore.
pub fn install_macros(conn: &mut dyn EngineConn) -> SResult<()> {
    conn.execute("CREATE SCHEMA IF NOT EXISTS __sys")?;
    conn.execute("CREATE OR REPLACE MACRO __sys.pg_get_userbyid(id) AS 'postgres'")?;
    conn.execute("CREATE OR REPLACE MACRO __sys.pg_table_is_visible(id) AS TRUE")?;
    conn.execute("CREATE OR REPLACE MACRO __sys.pg_get_expr(expr, rel) AS NULL")?;
    conn.execute("CREATE OR REPLACE MACRO __sys.pg_get_indexdef(id) AS NULL")?;
    conn.execute("CREATE OR REPLACE MACRO __sys.pg_total_relation_size(id) AS 0")?;
    conn.execute("CREATE OR REPLACE MACRO __sys.obj_description(id, cat) AS NULL")?;
    conn.execute("CREATE OR REPLACE MACRO __sys.col_description(id, col) AS NULL")?;
    conn.execute(
        "CREATE OR REPLACE VIEW __sys.pg_stat_user_tables AS \
         SELECT 0::BIGINT AS relid, schema_name AS schemaname, table_name AS relname, \
         0::BIGINT AS seq_scan, 0::BIGINT AS n_live_tup \
         FROM information_schema.tables",
    )?;
    conn.execute(
        "CREATE OR REPLACE VIEW __sys.pg_stat_activity AS \
         SELECT 0::INTEGER AS pid, 'active' AS state, NULL::VARCHAR AS query WHERE FALSE",
    )?;
    conn.execute(
        "CREATE OR REPLACE VIEW __sys.pg_replication_slots AS \
         SELECT NULL::VARCHAR AS slot_name, NULL::VARCHAR AS plugin WHERE FALSE",
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{rewrite_any_op, rewrite_mysql, rewrite_pg};

    #[test]
    fn test_any_op() {
        assert_eq!(
            rewrite_any_op("SELECT * FROM t WHERE id = ANY(ARRAY[1,2,3])"),
            "SELECT * FROM t WHERE list_contains(ARRAY[1,2,3], id)"
        );
        assert_eq!(
            rewrite_any_op("WHERE a.oid = ANY($1) AND b = 2"),
            "WHERE list_contains($1, a.oid) AND b = 2"
        );
        // untouched when no ANY
        assert_eq!(rewrite_any_op("SELECT any(x) FROM t"), "SELECT any(x) FROM t");
    }

    #[test]
    fn test_catalog_rewrites() {
        let sql = "SELECT pg_catalog.pg_get_userbyid(c.relowner) FROM pg_catalog.pg_stat_user_tables";
        let out = rewrite_pg(sql);
        assert_eq!(
            out,
            "SELECT __sys.pg_get_userbyid(c.relowner) FROM __sys.pg_stat_user_tables"
        );
    }

    #[test]
    fn test_reg_casts() {
        assert_eq!(
            rewrite_pg("SELECT 'pg_class'::regclass"),
            "SELECT 'pg_class'::varchar"
        );
    }

    #[test]
    fn test_unqualified_macro_call_boundaries() {
        assert_eq!(
            rewrite_pg("SELECT obj_description(1, 'pg_class')"),
            "SELECT __sys.obj_description(1, 'pg_class')"
        );
        // longer identifiers sharing a suffix are untouched
        assert_eq!(
            rewrite_pg("SELECT shobj_description(1, 'x')"),
            "SELECT shobj_description(1, 'x')"
        );
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "SELECT * FROM t WHERE id = ANY(ARRAY[1,2,3])",
            "SELECT pg_catalog.pg_get_userbyid(1)",
            "SELECT obj_description(1, 'pg_class')",
            "SELECT 'x'::regtype",
        ];
        for sql in inputs {
            let once = rewrite_pg(sql);
            let twice = rewrite_pg(&once);
            assert_eq!(once, twice, "not idempotent for {}", sql);
        }
    }

    #[test]
    fn test_mysql_rewrites() {
        assert_eq!(
            rewrite_mysql("SELECT `a` FROM `db`.`t` WHERE x = 'tick `'"),
            "SELECT \"a\" FROM \"db\".\"t\" WHERE x = 'tick `'"
        );
        assert_eq!(
            rewrite_mysql("/*!40100 SET NAMES utf8 */"),
            " SET NAMES utf8 "
        );
        let once = rewrite_mysql("SELECT `a` FROM t");
        assert_eq!(rewrite_mysql(&once), once);
    }
}
