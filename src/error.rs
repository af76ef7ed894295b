//! Error taxonomy.
//!
//! Every kind carries a stable symbolic code and an HTTP-like status so
//! callers can map failures without string matching. Store failures are
//! surfaced unchanged to the read that triggered them; the node cache never
//! caches errors.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid transaction: {0}")]
    InvalidTx(String),

    #[error("invalid auth: {0}")]
    InvalidAuth(String),

    /// A requested artifact (db root, block, ledger) does not exist.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Store failure or corrupt blob. Fatal to the read that hit it.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// Invariant violation. Includes a diagnostic payload.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Stable symbolic code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidQuery(_) => "invalid-query",
            Error::InvalidTx(_) => "invalid-tx",
            Error::InvalidAuth(_) => "invalid-auth",
            Error::Unavailable(_) => "unavailable",
            Error::Storage(_) => "storage-error",
            Error::Timeout(_) => "timeout",
            Error::Connection(_) => "connection-error",
            Error::Unexpected(_) => "unexpected-error",
        }
    }

    /// HTTP-like status for this kind.
    pub fn status(&self) -> u16 {
        match self {
            Error::InvalidQuery(_) | Error::InvalidTx(_) => 400,
            Error::InvalidAuth(_) => 401,
            Error::Unavailable(_) => 404,
            Error::Storage(_) => 500,
            Error::Timeout(_) => 408,
            Error::Connection(_) => 500,
            Error::Unexpected(_) => 500,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Storage(format!("{e:#}"))
    }
}
