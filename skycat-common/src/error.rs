//! Common error types for SkyCat
//!
//! Errors fall into two propagation classes:
//! - per-detection ([`Error::InvalidMeasurement`]): recovered inside a session
//!   and reported in its outcome
//! - per-session (everything else): abort the image's transaction and are
//!   surfaced to the caller with a [`Error::reason_code`]

use thiserror::Error;

/// Common result type for SkyCat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across SkyCat crates
#[derive(Error, Debug)]
pub enum Error {
    /// Detection carries a degenerate or nonsensical measurement
    #[error("Invalid measurement for detection {detection_id}: {reason}")]
    InvalidMeasurement { detection_id: String, reason: String },

    /// Catalog or reference store could not be reached or failed a read/write
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Concurrent modification detected at commit time
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session cancelled before commit
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Image batch was already committed to the catalog
    #[error("Image already processed: {0}")]
    AlreadyProcessed(String),

    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error (broken invariant)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable reason code reported to the enclosing pipeline
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::InvalidMeasurement { .. } => "INVALID_MEASUREMENT",
            Error::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            #[cfg(feature = "sqlx")]
            Error::Database(_) => "STORE_UNAVAILABLE",
            Error::WriteConflict(_) => "WRITE_CONFLICT",
            Error::Config(_) => "CONFIGURATION_ERROR",
            Error::Cancelled(_) => "CANCELLED",
            Error::AlreadyProcessed(_) => "ALREADY_PROCESSED",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True if the caller should retry the session with a fresh search
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WriteConflict(_))
    }

    /// Classify a raw sqlx error raised by a catalog store operation
    ///
    /// SQLite reports both lock contention and a stale WAL read snapshot
    /// (`SQLITE_BUSY_SNAPSHOT`) as "database is locked"; both mean another
    /// session committed first.
    #[cfg(feature = "sqlx")]
    pub fn from_store(err: sqlx::Error) -> Self {
        let message = err.to_string();
        if message.contains("database is locked") || message.contains("database is busy") {
            Error::WriteConflict(message)
        } else {
            Error::StoreUnavailable(message)
        }
    }
}
