//! Error types for awaitful-core.

use std::sync::PoisonError;

use thiserror::Error;

use crate::cell::CellId;

/// Result type for awaitful-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in awaitful-core.
#[derive(Debug, Error)]
pub enum Error {
    /// No cell is registered under this handle.
    #[error("cell not found: {0}")]
    CellNotFound(CellId),

    /// A cell read observed a rejected producer.
    #[error("{cell} rejected: {message}")]
    Rejected { cell: CellId, message: String },

    /// Payload could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP fetch failed before a cell existed to carry the failure.
    #[error("fetch of {url} failed: {message}")]
    Fetch { url: String, message: String },

    /// Websocket connection or send failure.
    #[error("socket error: {0}")]
    Socket(String),

    /// The owning scope was aborted.
    #[error("render loop aborted")]
    Aborted,

    /// A shared table lock was poisoned by a panicking task.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// A render function failed for a reason of its own.
    #[error("render failed: {0}")]
    Render(String),
}

impl Error {
    /// Build a render error from any displayable message.
    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }

    /// Whether this error came from a rejected cell.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Convert a poisoned lock into [`Error::LockPoisoned`].
pub(crate) fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::LockPoisoned(e.to_string())
}
