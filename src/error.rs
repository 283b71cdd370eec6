use std::path::PathBuf;

/// Errors reported by a [`Store`](crate::store::Store) implementation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or answered with an unexpected status.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused a document; transient, the record is retried.
    #[error("save failed: {reason}")]
    SaveFailed { reason: String },

    /// The session carries no valid token anymore.
    #[error("session expired or missing authentication token")]
    AuthExpired,

    /// Credentials were rejected while (re)establishing a session.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[cfg(feature = "couchdb")]
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl StoreError {
    pub fn save_failed(reason: impl Into<String>) -> Self {
        StoreError::SaveFailed { reason: reason.into() }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        StoreError::AuthFailed { reason: reason.into() }
    }

    /// Whether the failure points at an expired session rather than the
    /// document or the network.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, StoreError::AuthExpired)
    }
}

/// Errors surfaced by the [`Logger`](crate::logger::Logger) and its worker.
#[derive(thiserror::Error, Debug)]
pub enum LoggerError {
    /// Connecting, authenticating or creating the database failed; the
    /// logger is inert.
    #[error("logging store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("failed to spawn logging worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write uncommitted log events to {}: {source}", .path.display())]
    Dump {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode uncommitted log events: {0}")]
    Encode(#[from] serde_json::Error),

    /// A panic escaped while a single record was being delivered.
    #[error("unexpected fault while delivering log record: {0}")]
    UnexpectedFault(String),
}

/// Errors produced while building a [`DbConfig`](crate::config::DbConfig).
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unknown or unsupported DSN scheme")]
    UnknownScheme,

    #[error("malformed DSN: {0}")]
    InvalidDsn(String),

    #[error("invalid port {value:?}: {source}")]
    InvalidPort {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}
