//! Error types for the note sync core.
//!
//! Transport failures arrive as [`GatewayError`] and are folded into
//! [`NoteSyncError`] so callers deal with a single taxonomy.

use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayError;

/// Result type alias for note sync operations
pub type NoteSyncResult<T> = Result<T, NoteSyncError>;

/// Main error type for note sync operations
#[derive(Error, Debug)]
pub enum NoteSyncError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    /// Transient transport failure, retried with backoff.
    #[error("Network error: {0}")]
    Network(String),

    /// Non-retryable rejection from the backend.
    #[error("Request rejected ({status}): {message}")]
    Semantic { status: u16, message: String },

    /// Server holds a newer version than the one the update was based on.
    #[error("Version conflict on note {note_id}: server is at version {remote_version}")]
    VersionConflict { note_id: Uuid, remote_version: i64 },

    #[error("Migration of note {note_id} failed: {message}")]
    MigrationItem { note_id: Uuid, message: String },

    #[error("Migration aborted: {0}")]
    MigrationFatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The note has an unresolved conflict and rejects further edits.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

impl NoteSyncError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        NoteSyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        NoteSyncError::DatabaseOperation(message.into())
    }

    /// Create a fatal migration error
    pub fn migration_fatal(message: impl Into<String>) -> Self {
        NoteSyncError::MigrationFatal(message.into())
    }

    /// Create a per-note migration error
    pub fn migration_item(note_id: Uuid, message: impl Into<String>) -> Self {
        NoteSyncError::MigrationItem {
            note_id,
            message: message.into(),
        }
    }

    /// True for failures worth retrying automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NoteSyncError::Network(_))
    }
}

impl From<GatewayError> for NoteSyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Network(msg) => NoteSyncError::Network(msg),
            GatewayError::Status { status, message } if status == 429 || status >= 500 => {
                NoteSyncError::Network(format!("HTTP {}: {}", status, message))
            }
            GatewayError::Status { status, message } => NoteSyncError::Semantic { status, message },
            GatewayError::VersionConflict(remote) => NoteSyncError::Conflict(format!(
                "remote note {} is at version {}",
                remote.id, remote.version
            )),
            GatewayError::Decode(msg) => NoteSyncError::Semantic {
                status: 0,
                message: msg,
            },
        }
    }
}
