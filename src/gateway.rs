//! Remote Gateway abstraction over the backend note API.
//!
//! The gateway is a thin request/response layer: it performs exactly one
//! HTTP exchange per call and leaves retries, queueing and conflict handling
//! to the sync queue. Implementations:
//! - [`crate::gateway_http::HttpGateway`] talks to the real backend
//! - tests use an in-memory fake with the same version semantics
//!
//! Endpoints consumed:
//! - `POST /notes` create, returns the stored note with its version
//! - `PUT /notes/{id}` version-conditioned update, `409 {remoteNote}` on mismatch
//! - `DELETE /notes/{id}`
//! - `GET /notes` list for the authenticated account

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Note;

/// A note as the server stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNote {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "content", default)]
    pub body: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl RemoteNote {
    /// Build the server-side view of a local note at a given version.
    pub fn from_note(id: impl Into<String>, note: &Note, version: i64) -> Self {
        Self {
            id: id.into(),
            title: note.title.clone(),
            body: note.body.clone(),
            color: note.color.clone(),
            tags: note.tags.clone(),
            created_at: Some(note.created_at),
            updated_at: note.updated_at,
            version,
        }
    }
}

/// Body of `POST /notes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteRequest {
    pub title: String,
    pub content: String,
    pub color: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreateNoteRequest {
    pub fn from_note(note: &Note) -> Self {
        Self {
            title: note.title.clone(),
            content: note.body.clone(),
            color: note.color.clone(),
            tags: note.tags.clone(),
            created_at: note.created_at,
            updated_at: note.updated_at,
        }
    }
}

/// Body of `PUT /notes/{id}`.
///
/// `version` is the server version the edit was based on; the server
/// rejects the update with 409 when it already holds something newer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNoteRequest {
    pub title: String,
    pub content: String,
    pub color: String,
    pub tags: Vec<String>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl UpdateNoteRequest {
    pub fn from_note(note: &Note, base_version: i64) -> Self {
        Self {
            title: note.title.clone(),
            content: note.body.clone(),
            color: note.color.clone(),
            tags: note.tags.clone(),
            updated_at: note.updated_at,
            version: base_version,
        }
    }
}

/// Body of a 409 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    pub remote_note: RemoteNote,
}

/// Errors produced by a single gateway exchange.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Connection, DNS or timeout failure
    Network(String),
    /// Non-success HTTP status other than 409
    Status { status: u16, message: String },
    /// The server rejected a conditional update and returned its copy
    VersionConflict(Box<RemoteNote>),
    /// Response body could not be decoded
    Decode(String),
}

impl GatewayError {
    /// Transient failures: network errors, rate limiting and server errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Network(_) => true,
            GatewayError::Status { status, .. } => *status == 429 || *status >= 500,
            GatewayError::VersionConflict(_) | GatewayError::Decode(_) => false,
        }
    }
}

impl std::error::Error for GatewayError {}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Network(msg) => write!(f, "Network error: {}", msg),
            GatewayError::Status { status, message } => write!(f, "HTTP {}: {}", status, message),
            GatewayError::VersionConflict(remote) => write!(
                f,
                "Version conflict: server holds version {} of {}",
                remote.version, remote.id
            ),
            GatewayError::Decode(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

/// Request/response access to the backend note API.
pub trait RemoteGateway: Send + Sync {
    /// Create a note; returns the server copy with its id and version.
    fn create_note(
        &self,
        request: &CreateNoteRequest,
    ) -> impl Future<Output = Result<RemoteNote, GatewayError>> + Send;

    /// Update a note if the server is still at `request.version`.
    ///
    /// Returns [`GatewayError::VersionConflict`] carrying the server copy otherwise.
    fn update_note(
        &self,
        remote_id: &str,
        request: &UpdateNoteRequest,
    ) -> impl Future<Output = Result<RemoteNote, GatewayError>> + Send;

    /// Delete a note. Deleting a note the server no longer has succeeds.
    fn delete_note(&self, remote_id: &str) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// List every note of the authenticated account.
    fn list_notes(&self) -> impl Future<Output = Result<Vec<RemoteNote>, GatewayError>> + Send;
}
