//! COPY statement recognition and the incremental loaders feeding
//! CopyData chunks into buffered rows. Rows may be split across chunks;
//! the loader keeps the partial tail between feeds.

use lazy_static::lazy_static;
use regex::Regex;

use common::err::server_error::ServerError;
use common::err::SResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormat {
    Csv,
    /// Tab-delimited with `\N` nulls.
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    FromStdin,
    ToStdout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyStatement {
    pub direction: CopyDirection,
    pub schema: Option<String>,
    pub table: String,
    pub columns: Vec<String>,
    pub format: CopyFormat,
    pub delimiter: char,
    pub null_str: String,
    pub header: bool,
}

lazy_static! {
    static ref RE_COPY: Regex = Regex::new(
        r#"(?is)^\s*copy\s+(?P<table>(("[^"]+"|[a-zA-Z_][\w$]*)\.)?("[^"]+"|[a-zA-Z_][\w$]*))\s*(\((?P<cols>[^)]*)\))?\s+(?P<dir>from\s+stdin|to\s+stdout)\s*(?P<opts>.*?)\s*;?\s*$"#
    )
    .unwrap();
    static ref RE_OPT_DELIMITER: Regex =
        Regex::new(r#"(?i)delimiter\s+e?'(?P<d>\\t|[^'])'"#).unwrap();
    static ref RE_OPT_NULL: Regex = Regex::new(r#"(?i)null\s+'(?P<n>[^']*)'"#).unwrap();
}

fn unquote(ident: &str) -> String {
    let trimmed = ident.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    }
}

/// Recognize `COPY ... FROM STDIN` / `COPY ... TO STDOUT`. Returns None for
/// anything else (including file-target COPY, which goes to the engine).
pub fn parse_copy(sql: &str) -> Option<SResult<CopyStatement>> {
    let caps = RE_COPY.captures(sql)?;

    let direction = if caps["dir"].to_ascii_lowercase().starts_with("from") {
        CopyDirection::FromStdin
    } else {
        CopyDirection::ToStdout
    };

    let table_ref = &caps["table"];
    let (schema, table) = match split_qualified(table_ref) {
        (Some(schema), table) => (Some(unquote(&schema)), unquote(&table)),
        (None, table) => (None, unquote(&table)),
    };

    let columns: Vec<String> = caps
        .name("cols")
        .map(|m| {
            m.as_str()
                .split(',')
                .map(unquote)
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let opts = caps.name("opts").map(|m| m.as_str()).unwrap_or("");
    let opts_lower = opts.to_ascii_lowercase();

    if opts_lower.contains("binary") {
        return Some(Err(ServerError::Unsupported(
            "COPY binary format".to_string(),
        )));
    }

    let format = if opts_lower.contains("csv") {
        CopyFormat::Csv
    } else {
        CopyFormat::Text
    };
    let mut delimiter = match format {
        CopyFormat::Csv => ',',
        CopyFormat::Text => '\t',
    };
    if let Some(d) = RE_OPT_DELIMITER.captures(opts) {
        let raw = &d["d"];
        delimiter = if raw == "\\t" {
            '\t'
        } else {
            raw.chars().next().unwrap_or(delimiter)
        };
    }
    let null_str = RE_OPT_NULL
        .captures(opts)
        .map(|c| c["n"].to_string())
        .unwrap_or_else(|| match format {
            CopyFormat::Csv => String::new(),
            CopyFormat::Text => "\\N".to_string(),
        });
    let header = opts_lower.contains("header")
        && !opts_lower.contains("header false")
        && !opts_lower.contains("header 0");

    Some(Ok(CopyStatement {
        direction,
        schema,
        table,
        columns,
        format,
        delimiter,
        null_str,
        header,
    }))
}

fn split_qualified(name: &str) -> (Option<String>, String) {
    // split on the dot outside double quotes
    let mut in_quotes = false;
    for (idx, c) in name.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => {
                return (
                    Some(name[..idx].to_string()),
                    name[idx + 1..].to_string(),
                )
            }
            _ => {}
        }
    }
    (None, name.to_string())
}

/// Incremental line-based loader for COPY FROM STDIN.
#[derive(Debug)]
pub struct CopyLoader {
    format: CopyFormat,
    delimiter: char,
    null_str: String,
    skip_header: bool,
    partial: Vec<u8>,
    rows: Vec<Vec<Option<String>>>,
    done: bool,
}

impl CopyLoader {
    pub fn new(stmt: &CopyStatement) -> Self {
        CopyLoader {
            format: stmt.format,
            delimiter: stmt.delimiter,
            null_str: stmt.null_str.clone(),
            skip_header: stmt.header,
            partial: Vec::new(),
            rows: Vec::new(),
            done: false,
        }
    }

    /// Feed one CopyData chunk. Complete lines are parsed immediately, the
    /// trailing fragment is kept for the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> SResult<()> {
        if self.done {
            return Ok(());
        }
        self.partial.extend_from_slice(chunk);
        loop {
            let Some(pos) = self.partial.iter().position(|b| *b == b'\n') else {
                return Ok(());
            };
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.take_line(&line[..line.len() - 1])?;
            if self.done {
                return Ok(());
            }
        }
    }

    /// CopyDone: flush any unterminated final line.
    pub fn finish(mut self) -> SResult<Vec<Vec<Option<String>>>> {
        if !self.partial.is_empty() && !self.done {
            let line = std::mem::take(&mut self.partial);
            self.take_line(&line)?;
        }
        Ok(self.rows)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn take_line(&mut self, line: &[u8]) -> SResult<()> {
        let mut line = line;
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return Ok(());
        }
        if line == b"\\." {
            self.done = true;
            return Ok(());
        }
        if self.skip_header {
            self.skip_header = false;
            return Ok(());
        }
        let text = std::str::from_utf8(line)?;
        let row = match self.format {
            CopyFormat::Csv => parse_csv_line(text, self.delimiter, &self.null_str)?,
            CopyFormat::Text => parse_text_line(text, self.delimiter, &self.null_str),
        };
        self.rows.push(row);
        Ok(())
    }
}

fn parse_csv_line(line: &str, delimiter: char, null_str: &str) -> SResult<Vec<Option<String>>> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
            was_quoted = true;
        } else if c == delimiter {
            cells.push(finish_csv_cell(
                std::mem::take(&mut current),
                std::mem::take(&mut was_quoted),
                null_str,
            ));
        } else {
            current.push(c);
        }
    }
    if in_quotes {
        return Err(ServerError::Parse("unterminated quoted CSV value".to_string()));
    }
    cells.push(finish_csv_cell(current, was_quoted, null_str));
    Ok(cells)
}

fn finish_csv_cell(value: String, was_quoted: bool, null_str: &str) -> Option<String> {
    if !was_quoted && value == null_str {
        None
    } else {
        Some(value)
    }
}

fn parse_text_line(line: &str, delimiter: char, null_str: &str) -> Vec<Option<String>> {
    line.split(delimiter)
        .map(|cell| {
            if cell == null_str {
                None
            } else {
                Some(unescape_text(cell))
            }
        })
        .collect()
}

fn unescape_text(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    let mut chars = cell.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Engine-side statement for a COPY TO STDOUT, writing into the FIFO the
/// session streams from.
pub fn copy_to_engine_sql(stmt: &CopyStatement, target: &str, pipe_path: &str) -> String {
    let delimiter = if stmt.delimiter == '\t' {
        "\\t".to_string()
    } else {
        stmt.delimiter.to_string()
    };
    format!(
        "COPY {} TO '{}' (FORMAT CSV, HEADER {}, DELIMITER '{}', NULL '{}')",
        target,
        pipe_path.replace('\'', "''"),
        stmt.header,
        delimiter,
        stmt.null_str.replace('\'', "''"),
    )
}

#[cfg(test)]
mod test {
    use super::{parse_copy, CopyDirection, CopyFormat, CopyLoader};

    #[test]
    fn test_parse_copy_forms() {
        let stmt = parse_copy("COPY t FROM STDIN WITH (FORMAT CSV)")
            .unwrap()
            .unwrap();
        assert_eq!(stmt.direction, CopyDirection::FromStdin);
        assert_eq!(stmt.table, "t");
        assert_eq!(stmt.format, CopyFormat::Csv);
        assert_eq!(stmt.delimiter, ',');

        let stmt = parse_copy("copy public.\"My Table\" (a, b) from stdin")
            .unwrap()
            .unwrap();
        assert_eq!(stmt.schema.as_deref(), Some("public"));
        assert_eq!(stmt.table, "My Table");
        assert_eq!(stmt.columns, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stmt.format, CopyFormat::Text);
        assert_eq!(stmt.delimiter, '\t');
        assert_eq!(stmt.null_str, "\\N");

        let stmt = parse_copy("COPY t TO STDOUT (FORMAT CSV, HEADER)")
            .unwrap()
            .unwrap();
        assert_eq!(stmt.direction, CopyDirection::ToStdout);
        assert!(stmt.header);

        assert!(parse_copy("SELECT 1").is_none());
        assert!(parse_copy("COPY t FROM 'file.csv'").is_none());
        assert!(parse_copy("COPY t FROM STDIN WITH (FORMAT BINARY)")
            .unwrap()
            .is_err());
    }

    #[test]
    fn test_loader_row_split_across_chunks() {
        let stmt = parse_copy("COPY t FROM STDIN WITH (FORMAT CSV)")
            .unwrap()
            .unwrap();
        let mut loader = CopyLoader::new(&stmt);
        // one row split across three chunks, plus two complete rows
        loader.feed(b"1,al").unwrap();
        loader.feed(b"ice\n2,b").unwrap();
        loader.feed(b"ob\n3,carol\n").unwrap();
        let rows = loader.finish().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![Some("1".to_string()), Some("alice".to_string())]);
        assert_eq!(rows[2], vec![Some("3".to_string()), Some("carol".to_string())]);
    }

    #[test]
    fn test_loader_csv_quoting_and_nulls() {
        let stmt = parse_copy("COPY t FROM STDIN WITH (FORMAT CSV)")
            .unwrap()
            .unwrap();
        let mut loader = CopyLoader::new(&stmt);
        loader.feed(b"1,\"a,b\"\n2,\n3,\"\"\n").unwrap();
        let rows = loader.finish().unwrap();
        assert_eq!(rows[0][1], Some("a,b".to_string()));
        // unquoted empty is CSV null, quoted empty is the empty string
        assert_eq!(rows[1][1], None);
        assert_eq!(rows[2][1], Some(String::new()));
    }

    #[test]
    fn test_loader_text_format() {
        let stmt = parse_copy("COPY t FROM STDIN").unwrap().unwrap();
        let mut loader = CopyLoader::new(&stmt);
        loader.feed(b"1\t\\N\n2\ta\\tb\n\\.\nignored\n").unwrap();
        let rows = loader.finish().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], None);
        assert_eq!(rows[1][1], Some("a\tb".to_string()));
    }

    #[test]
    fn test_loader_final_line_without_newline() {
        let stmt = parse_copy("COPY t FROM STDIN WITH (FORMAT CSV)")
            .unwrap()
            .unwrap();
        let mut loader = CopyLoader::new(&stmt);
        loader.feed(b"1,a\n2,b").unwrap();
        let rows = loader.finish().unwrap();
        assert_eq!(rows.len(), 2);
    }
}
