//! Error types shared by the limiter, the database layer and the facade.

use crate::context::ContextError;

/// Result type for all crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by rate-limited and raw database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The rate limiter refused admission because the caller's context
    /// was cancelled or its deadline passed before a token was available.
    #[error("rate limit admission denied: {0}")]
    Admission(ContextError),

    /// The context ended while the database was working on the request.
    #[error(transparent)]
    Context(ContextError),

    #[error("database is closed")]
    Closed,

    #[error("statement is closed")]
    StatementClosed,

    #[error("no rows in result set")]
    NoRows,

    #[error("no such column: {0}")]
    ColumnNotFound(String),

    #[error("column index {index} out of range for {count} columns")]
    ColumnIndex { index: usize, count: usize },

    #[error("cannot read column {column} of type {found} as {expected}")]
    InvalidType {
        column: String,
        expected: &'static str,
        found: rusqlite::types::Type,
    },

    /// The rate limit is not finite and positive, and is not unlimited.
    #[error("invalid rate limit: {rate}. Rate must be positive or unlimited.")]
    InvalidRate { rate: f64 },

    /// The burst size is zero; such a limiter could never grant a token.
    #[error("invalid burst size: {burst}. Burst must be greater than zero.")]
    InvalidBurst { burst: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// True if the rate limiter denied admission for this operation.
    pub fn is_admission_denied(&self) -> bool {
        matches!(self, Error::Admission(_))
    }

    /// The context failure behind this error, whether it came from the
    /// limiter or from the database.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Error::Admission(e) | Error::Context(e) => Some(*e),
            _ => None,
        }
    }
}
