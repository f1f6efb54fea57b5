use std::collections::HashMap;

use common::err::SResult;

/// Storage hook for variables that survive restarts. Backed by the
/// persistent-variables table in the reserved engine schema; the trait lives
/// here so sessions do not depend on the replication crate.
pub trait PersistentVars: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    fn set(&self, name: &str, value: &str, vtype: &str) -> SResult<()>;

    fn reset(&self, name: &str) -> SResult<()>;

    fn all(&self) -> Vec<(String, String)>;
}

/// Recognized GUCs and their defaults. SET/SHOW against anything outside
/// this set is forwarded to the engine untouched.
pub const GUC_DEFAULTS: &[(&str, &str)] = &[
    ("application_name", ""),
    ("client_encoding", "UTF8"),
    ("client_min_messages", "notice"),
    ("datestyle", "ISO, MDY"),
    ("default_transaction_isolation", "read committed"),
    ("extra_float_digits", "1"),
    ("integer_datetimes", "on"),
    ("intervalstyle", "postgres"),
    ("max_index_keys", "32"),
    ("search_path", "main"),
    ("server_encoding", "UTF8"),
    ("server_version", "16.3"),
    ("server_version_num", "160003"),
    ("standard_conforming_strings", "on"),
    ("statement_timeout", "0"),
    ("timezone", "UTC"),
    ("transaction_isolation", "read committed"),
];

/// Session-scoped GUC view: session overrides shadow defaults.
#[derive(Debug, Default)]
pub struct Gucs {
    session: HashMap<String, String>,
}

impl Gucs {
    pub fn new() -> Self {
        Gucs::default()
    }

    pub fn is_recognized(name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        GUC_DEFAULTS.iter().any(|(n, _)| *n == lower)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let lower = name.to_ascii_lowercase();
        if let Some(value) = self.session.get(&lower) {
            return Some(value.clone());
        }
        GUC_DEFAULTS
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, v)| v.to_string())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.session
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn reset(&mut self, name: &str) {
        self.session.remove(&name.to_ascii_lowercase());
    }

    /// SHOW ALL enumerates the recognized set with session overrides
    /// applied, ordered by name.
    pub fn show_all(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = GUC_DEFAULTS
            .iter()
            .map(|(n, v)| {
                let value = self
                    .session
                    .get(*n)
                    .cloned()
                    .unwrap_or_else(|| v.to_string());
                (n.to_string(), value)
            })
            .collect();
        all.sort();
        all
    }
}

/// Strip quotes from a SET value, matching the forms clients send:
/// `'x'`, `"x"`, bare words, and comma lists.
pub fn unquote_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 {
        let bytes = trimmed.as_bytes();
        if (bytes[0] == b'\'' && bytes[trimmed.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[trimmed.len() - 1] == b'"')
        {
            return trimmed[1..trimmed.len() - 1].replace("''", "'");
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod test {
    use super::{unquote_value, Gucs};

    #[test]
    fn test_session_overrides() {
        let mut gucs = Gucs::new();
        assert_eq!(gucs.get("server_version").unwrap(), "16.3");
        assert_eq!(gucs.get("TimeZone").unwrap(), "UTC");

        gucs.set("TimeZone", "America/New_York");
        assert_eq!(gucs.get("timezone").unwrap(), "America/New_York");

        gucs.reset("timezone");
        assert_eq!(gucs.get("timezone").unwrap(), "UTC");

        assert!(gucs.get("made_up_guc").is_none());
    }

    #[test]
    fn test_show_all_sorted() {
        let gucs = Gucs::new();
        let all = gucs.show_all();
        assert!(all.len() >= 10);
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote_value("'UTC'"), "UTC");
        assert_eq!(unquote_value("\"UTC\""), "UTC");
        assert_eq!(unquote_value("on"), "on");
        assert_eq!(unquote_value("'it''s'"), "it's");
    }
}
