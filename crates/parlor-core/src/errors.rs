//! Errors reported by external collaborators (identity, channels, messages).

use thiserror::Error;

/// Failure inside a collaborator backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record kind (e.g. `"message"`).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },
    /// The write conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Reading a seed or data file failed.
    #[error("backend I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Backend data could not be (de)serialized.
    #[error("backend data is malformed: {0}")]
    Json(#[from] serde_json::Error),
    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error means the record is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
