//! Error types for the graphd client

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    /// DNS failure, refused or reset connection. Retryable; the address
    /// is recorded as failed in the pool.
    #[error("Connection error ({addr}): {reason}")]
    Connection { addr: String, reason: String },

    /// Time budget exhausted before or during I/O. A computed timeout of
    /// exactly zero is rejected pre-flight without touching the socket.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer closed the connection mid-frame, or a read/write failed on an
    /// established socket.
    #[error("Read/write error: {0}")]
    ReadWrite(String),

    /// The server node is writing a snapshot and cannot serve the request.
    /// Transient; retried on a different address.
    #[error("Server is snapshotting: {0}")]
    Snapshotting(String),

    /// The dateline token we sent references a server epoch that no longer
    /// exists. Triggers exactly one forced retry with the token cleared.
    #[error("Dateline not recognized by server: {0}")]
    DatelineInvalid(String),

    /// Generic protocol/query error reported by the server. Never retried;
    /// the query is assumed to be intrinsically unservable.
    #[error("Query error {code}: {message}")]
    Mql { code: String, message: String },

    /// Write attempted through a connector flagged read-only.
    #[error("Connector is read-only")]
    ReadOnly,

    /// Missing policy keys, no addresses supplied, unknown policy name.
    /// Fatal; raised at construction or registration, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed reply frame, invalid asof token, bad modifier syntax.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl GraphError {
    /// Get short code for diagnostics and log fields
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::Connection { .. } => "CONNECTION",
            GraphError::Timeout(_) => "TIMEOUT",
            GraphError::ReadWrite(_) => "READWRITE",
            GraphError::Snapshotting(_) => "SNAPSHOT",
            GraphError::DatelineInvalid(_) => "DATELINE",
            GraphError::Mql { .. } => "MQL",
            GraphError::ReadOnly => "READONLY",
            GraphError::Config(_) => "CONFIG",
            GraphError::Parse(_) => "PARSE",
        }
    }

    /// Whether the transmit loop may retry after this error.
    ///
    /// Dateline invalidation is handled separately (one forced retry at the
    /// call level, outside the policy schedule) and reports false here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GraphError::Connection { .. }
                | GraphError::Timeout(_)
                | GraphError::ReadWrite(_)
                | GraphError::Snapshotting(_)
        )
    }
}
