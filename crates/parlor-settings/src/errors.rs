//! Why a parlor configuration could not be assembled.

use std::path::PathBuf;

use thiserror::Error;

/// A settings load failure. File failures carry the offending path so the
/// startup log points straight at it.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        /// File that failed.
        path: PathBuf,
        /// Underlying read error.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Malformed {
        /// File that failed.
        path: PathBuf,
        /// Parser error with line and column.
        #[source]
        source: serde_json::Error,
    },
    /// The merged document does not fit the settings schema, e.g. a string
    /// where a timeout is expected.
    #[error("settings do not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),
    /// Gateway tuning values that cannot work together.
    #[error("{field} {rule}")]
    Conflict {
        /// Dotted settings key, e.g. `gateway.botIdleTimeoutMs`.
        field: &'static str,
        /// What the value must satisfy.
        rule: &'static str,
    },
}

impl SettingsError {
    /// The dotted settings key a [`SettingsError::Conflict`] is about.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Conflict { field, .. } => Some(*field),
            _ => None,
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
