//! Data models for the note sync core.
//!
//! Note ids are UUIDv7 generated on the client and stay stable across
//! devices; the backend may assign its own id, kept in `remote_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::RemoteNote;

/// Color used when a note is created without one.
pub const DEFAULT_NOTE_COLOR: &str = "default";

/// Where a note stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Local changes not yet acknowledged by the server
    LocalOnly,
    /// A request for this note is in flight
    Syncing,
    /// Server holds exactly this version
    Synced,
    /// Server diverged; waiting for an explicit resolution
    Conflict,
    /// Propagation failed; waiting for a manual retry
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::LocalOnly => "local_only",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local_only" => Some(SyncStatus::LocalOnly),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "conflict" => Some(SyncStatus::Conflict),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// The authenticated account a session acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }
}

/// A note as stored on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    /// Owning account; None for anonymous notes that predate login
    pub owner_id: Option<String>,
    /// Id assigned by the server once it acknowledged a create
    pub remote_id: Option<String>,
    pub title: String,
    pub body: String,
    pub color: String,
    /// Ordered set: no duplicates, insertion order preserved
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every local mutation, never decreases
    pub version: i64,
    /// Last version the server acknowledged
    pub server_version: Option<i64>,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Tombstone flag; the row is purged once the delete is acknowledged
    pub deleted: bool,
}

impl Note {
    /// Create a new local note at version 1
    pub fn new(draft: NoteDraft, owner_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            remote_id: None,
            title: draft.title,
            body: draft.body,
            color: draft
                .color
                .unwrap_or_else(|| DEFAULT_NOTE_COLOR.to_string()),
            tags: normalize_tags(draft.tags),
            created_at: now,
            updated_at: now,
            version: 1,
            server_version: None,
            sync_status: SyncStatus::LocalOnly,
            last_sync_at: None,
            deleted: false,
        }
    }

    /// Get the note ID as a hex string
    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }

    /// True once the server has acknowledged a create for this note.
    pub fn is_acknowledged(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Compare the user-visible content of two notes.
    pub fn same_content(&self, other: &Note) -> bool {
        self.title == other.title
            && self.body == other.body
            && self.color == other.color
            && self.tags == other.tags
    }

    /// Compare the user-visible content against a server snapshot.
    pub fn same_content_as_remote(&self, remote: &RemoteNote) -> bool {
        self.title == remote.title
            && self.body == remote.body
            && self.color == remote.color
            && self.tags == normalize_tags(remote.tags.clone())
    }

    /// Record a local mutation: bump the version and queue for upload.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
        self.sync_status = SyncStatus::LocalOnly;
    }

    /// Apply the fields present in a patch as a local edit.
    pub fn apply_patch(&mut self, patch: NotePatch) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(body) = patch.body {
            self.body = body;
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(tags) = patch.tags {
            self.tags = normalize_tags(tags);
        }
        self.touch();
    }

    /// Reconcile with a server acknowledgment of this exact content.
    pub fn mark_synced(&mut self, remote: &RemoteNote, now: DateTime<Utc>) {
        self.remote_id = Some(remote.id.clone());
        self.server_version = Some(remote.version);
        self.version = self.version.max(remote.version);
        self.sync_status = SyncStatus::Synced;
        self.last_sync_at = Some(now);
    }

    /// Replace local content with the server snapshot.
    pub fn adopt_remote(&mut self, remote: &RemoteNote, now: DateTime<Utc>) {
        self.title = remote.title.clone();
        self.body = remote.body.clone();
        self.color = remote.color.clone();
        self.tags = normalize_tags(remote.tags.clone());
        self.updated_at = remote.updated_at;
        self.mark_synced(remote, now);
    }
}

/// Fields for a new note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDraft {
    pub title: String,
    pub body: String,
    pub color: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NoteDraft {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Partial update of a note; None leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub color: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl NotePatch {
    pub fn body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.color.is_none() && self.tags.is_none()
    }
}

/// Trim tags, drop empties and duplicates, keep first-seen order.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// How a conflict was (or is yet to be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    Unresolved,
    KeepLocal,
    KeepRemote,
    Merged,
}

impl ConflictResolution {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "unresolved" => Some(ConflictResolution::Unresolved),
            "keep_local" | "keeplocal" | "local" => Some(ConflictResolution::KeepLocal),
            "keep_remote" | "keepremote" | "remote" => Some(ConflictResolution::KeepRemote),
            "merged" | "merge" => Some(ConflictResolution::Merged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Unresolved => "unresolved",
            ConflictResolution::KeepLocal => "keep_local",
            ConflictResolution::KeepRemote => "keep_remote",
            ConflictResolution::Merged => "merged",
        }
    }
}

/// Divergent local and server versions of one note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub note_id: Uuid,
    pub local_snapshot: Note,
    pub remote_snapshot: RemoteNote,
    pub detected_at: DateTime<Utc>,
    pub resolution: ConflictResolution,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn new(local: Note, remote: RemoteNote) -> Self {
        Self {
            note_id: local.id,
            local_snapshot: local,
            remote_snapshot: remote,
            detected_at: Utc::now(),
            resolution: ConflictResolution::Unresolved,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution != ConflictResolution::Unresolved
    }
}

/// A note that could not be migrated in the last pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationIssue {
    pub note_id: Uuid,
    pub title: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Persistent progress of the legacy-to-account migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub in_progress: bool,
    pub total_notes: usize,
    pub processed_notes: usize,
    pub errors: Vec<MigrationIssue>,
    /// Notes waiting for a manual conflict decision
    pub conflicts: Vec<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub backup_id: Option<String>,
}

/// Ledger entry for a note whose propagation gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSync {
    pub id: Uuid,
    pub note_id: Uuid,
    pub scope: String,
    pub snapshot: Note,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Metadata of a stored pre-migration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub note_count: usize,
    /// SHA-256 of the stored payload, hex encoded
    pub checksum: String,
}
