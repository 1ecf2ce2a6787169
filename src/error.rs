//! Error types for trueno-multiverse
//!
//! Only configuration and infrastructure problems are errors here. A universe
//! whose analysis procedure fails is recorded as an
//! [`ExecutionError`](crate::executor::ExecutionError) and an unreadable
//! artifact as an [`AggregationError`](crate::aggregate::AggregationError);
//! neither aborts the batch.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// trueno-multiverse error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed dimension set, constraint, run setting or config file.
    /// Fatal: raised before any universe is executed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A universe run was moved out of a terminal state (scheduler bug)
    #[error("Invalid state transition for universe {identity}: {from} -> {to}")]
    InvalidTransition {
        /// Universe identity
        identity: String,
        /// State the run was in
        from: String,
        /// Requested state
        to: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error while building or writing the consolidated dataset
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::Config`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
