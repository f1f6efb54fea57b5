use std::io;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Error kinds the front-end distinguishes. Wire sessions decide from the
/// variant whether the connection survives (see `closes_connection`).
#[derive(Debug, Error)]
pub enum ServerError {
    //////////////////////
    // Wire protocol
    //////////////////////
    /// Malformed or out-of-order client message. The connection is dropped.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed for user '{0}'")]
    AuthFailed(String),

    #[error("unknown database '{0}'")]
    UnknownDatabase(String),

    //////////////////////
    // SQL / engine
    //////////////////////
    /// Engine-reported query error, surfaced to the client as a normal
    /// query error in its own dialect. The connection survives.
    #[error("{message}")]
    Sql { code: String, message: String },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    //////////////////////
    // Replication
    //////////////////////
    /// Transient stream failure, retried with reconnection.
    #[error("replication error: {0}")]
    Replication(String),

    /// Propagated to the supervisor, which disables the subscription.
    #[error("fatal replication error: {0}")]
    ReplicationFatal(String),

    //////////////////////
    // Decode / IO
    //////////////////////
    /// Byte stream ended inside a message.
    #[error("incomplete message: need {0} more bytes")]
    Incomplete(usize),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Utf8(#[from] Utf8Error),

    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    #[error("{0}")]
    String(String),
}

impl ServerError {
    pub fn sql(code: &str, message: impl Into<String>) -> Self {
        ServerError::Sql {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Whether the session must be terminated after reporting this error.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol(_)
                | ServerError::AuthFailed(_)
                | ServerError::UnknownDatabase(_)
                | ServerError::Io(_)
        )
    }

    /// SQLSTATE used when the error is reported on the PostgreSQL port.
    pub fn pg_code(&self) -> &str {
        match self {
            ServerError::Protocol(_) => "08P01",
            ServerError::AuthFailed(_) => "28P01",
            ServerError::UnknownDatabase(_) => "3D000",
            ServerError::Sql { code, .. } => code.as_str(),
            ServerError::Unsupported(_) => "0A000",
            ServerError::Parse(_) => "42601",
            _ => "XX000",
        }
    }

    /// (errno, sqlstate) used when the error is reported on the MySQL port.
    pub fn mysql_code(&self) -> (u16, &str) {
        match self {
            ServerError::AuthFailed(_) => (1045, "28000"),
            ServerError::UnknownDatabase(_) => (1049, "42000"),
            ServerError::Parse(_) => (1064, "42000"),
            ServerError::Unsupported(_) => (1235, "42000"),
            ServerError::Sql { .. } => (1105, "HY000"),
            _ => (2013, "HY000"),
        }
    }

    /// Transient replication failures are retried; everything else that can
    /// reach the consumer loop tears the subscription down.
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::Replication(_) => true,
            ServerError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::ServerError;

    #[test]
    fn test_codes() {
        let err = ServerError::UnknownDatabase("nope".to_string());
        assert_eq!(err.pg_code(), "3D000");
        assert_eq!(err.mysql_code().0, 1049);
        assert!(err.closes_connection());

        let err = ServerError::sql("42P01", "table does not exist");
        assert_eq!(err.pg_code(), "42P01");
        assert!(!err.closes_connection());
    }

    #[test]
    fn test_transient() {
        assert!(ServerError::Replication("socket closed".to_string()).is_transient());
        assert!(!ServerError::ReplicationFatal("bad slot".to_string()).is_transient());
    }
}
