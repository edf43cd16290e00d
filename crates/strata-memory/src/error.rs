//! Error taxonomy for the memory engine
//!
//! Store-level failures are converted into degraded results at the layer
//! boundary; only validation failures (writes) and total retrieval loss
//! (reads) cross the public facade as errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The canonical structured store could not be reached or a statement
    /// against it failed.
    #[error("structured store unavailable: {0}")]
    StorageUnavailable(String),

    /// The vector index file or ANN structure is unusable. Callers fall back
    /// to keyword retrieval.
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// The analytics store is unusable. Aggregates are rebuildable, so this
    /// never blocks reads or writes of canonical data.
    #[error("analytics store unavailable: {0}")]
    AnalyticsUnavailable(String),

    /// Every layer in the requested scope failed or timed out.
    #[error("all memory layers unavailable for this query")]
    AllLayersUnavailable,

    /// The input failed normalization and was rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl MemoryError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        MemoryError::StorageUnavailable(err.to_string())
    }

    pub fn index(err: impl std::fmt::Display) -> Self {
        MemoryError::IndexUnavailable(err.to_string())
    }

    pub fn analytics(err: impl std::fmt::Display) -> Self {
        MemoryError::AnalyticsUnavailable(err.to_string())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        MemoryError::Validation(msg.into())
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        MemoryError::StorageUnavailable(err.to_string())
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(err: r2d2::Error) -> Self {
        MemoryError::StorageUnavailable(format!("connection pool: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
