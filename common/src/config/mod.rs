use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::err::server_error::ServerError;
use crate::err::SResult;

/// Runtime configuration, assembled from the CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address shared by both protocol ports.
    pub address: String,

    /// MySQL protocol port.
    pub port: u16,

    /// PostgreSQL protocol port.
    pub pg_port: u16,

    /// Unix socket path for the MySQL listener, empty to disable.
    pub socket: String,

    /// Directory holding the engine database and scratch files.
    pub datadir: String,

    /// Engine database file name inside `datadir`.
    pub db_file: String,

    pub loglevel: String,

    /// IANA zone name applied process-wide at startup, empty to skip.
    pub default_time_zone: String,

    /// Replica reporting identity, surfaced through SHOW-style probes.
    pub report_host: String,
    pub report_port: u16,
    pub report_user: String,
    pub report_password: String,

    /// PEM certificate / key pair enabling the PostgreSQL SSLRequest upgrade.
    pub cert_file: String,
    pub key_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0".to_string(),
            port: 3306,
            pg_port: 5432,
            socket: String::new(),
            datadir: ".".to_string(),
            db_file: "engine.db".to_string(),
            loglevel: "info".to_string(),
            default_time_zone: String::new(),
            report_host: String::new(),
            report_port: 3306,
            report_user: String::new(),
            report_password: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.datadir).join(&self.db_file)
    }

    pub fn mysql_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn pg_addr(&self) -> String {
        format!("{}:{}", self.address, self.pg_port)
    }

    pub fn ssl_configured(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }

    /// Apply `-default-time-zone` to the process. A zone that does not
    /// resolve is one of the fatal startup failures.
    pub fn apply_default_time_zone(&self) -> SResult<()> {
        if self.default_time_zone.is_empty() {
            return Ok(());
        }

        let zone = self.default_time_zone.as_str();
        let zoneinfo = Path::new("/usr/share/zoneinfo").join(zone);
        if !zone.contains("..") && zoneinfo.exists() {
            std::env::set_var("TZ", zone);
            return Ok(());
        }

        Err(ServerError::Config(format!(
            "unknown default time zone '{}'",
            zone
        )))
    }
}
