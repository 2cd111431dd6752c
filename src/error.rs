//! Error types shared across the pipeline.
//!
//! Two families: [`Error`] covers ingestion and store failures that callers
//! propagate with `?`, while [`SendError`] classifies notification-transport
//! failures so a pass can decide between "record and continue" and "abort
//! the rest of the pass" (see `notify`).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

// ---

/// Pipeline errors outside the notification transport.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error reading a feed file or the drop directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed feed file (bad delimiter, ragged rows, encoding).
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// A required feed column was absent from a source row.
    #[error("invalid feed record, missing column {0}")]
    MissingColumn(String),

    /// A feed column was present but could not be interpreted.
    #[error("invalid feed record, bad value in column {column}: {detail}")]
    InvalidColumn { column: String, detail: String },
}

/// Notification transport failures. `Disconnected` and `RateLimited` abort
/// the remainder of a pass; everything else is recorded against the one
/// record and the pass continues.
#[derive(Error, Debug)]
pub enum SendError {
    /// Contact info on the record cannot be delivered to (bad phone/email).
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Hard transport disconnect; nothing further will go through this pass.
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// Provider-side throttling signal.
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// Any other provider-specific delivery failure.
    #[error("send failed: {0}")]
    Other(String),
}

impl SendError {
    /// True when the failure poisons the whole pass rather than one record.
    pub fn aborts_pass(&self) -> bool {
        matches!(self, SendError::Disconnected(_) | SendError::RateLimited(_))
    }
}
