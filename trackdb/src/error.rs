//! Error type for the storage engine.

use thiserror::Error;
use trackdb_core::HistoryError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Argument, invalid-state and out-of-range failures.
    #[error(transparent)]
    History(#[from] HistoryError),
    /// Underlying SQLite or transaction failure.
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        StoreError::History(HistoryError::InvalidState(msg.into()))
    }

    pub fn is_argument_null(&self) -> bool {
        matches!(self, StoreError::History(HistoryError::ArgumentNull(_)))
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, StoreError::History(HistoryError::InvalidState(_)))
    }

    pub fn is_out_of_range(&self) -> bool {
        matches!(self, StoreError::History(HistoryError::OutOfRange { .. }))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
