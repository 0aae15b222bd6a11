//! Conflict detection and resolution.
//!
//! This module handles:
//! - Classifying a server rejection as a clean retry or a real conflict
//! - Persisting conflict records and suspending the note
//! - Resolving conflicts (keep local, keep remote, or merged)
//! - Merge suggestions and diff previews for the resolution UI

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{lock_db, Database, SharedDatabase};
use crate::error::{NoteSyncError, NoteSyncResult};
use crate::gateway::RemoteNote;
use crate::merge::{get_diff_preview, suggest_merge, MergeSuggestion};
use crate::models::{ConflictRecord, ConflictResolution, Note, NotePatch, SyncStatus};
use crate::validation::validate_patch;

/// How a version mismatch reported by the server should be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Server is not ahead of what this device last saw; rebase and resend
    RetryOverwrite,
    /// Server is ahead but holds identical content; accept its version
    AdoptServerVersion,
    /// Server is ahead with different content; needs an explicit decision
    Conflict(ConflictRecord),
}

/// Decide whether a server copy conflicts with the local note.
pub fn detect(local: &Note, remote: &RemoteNote) -> ConflictOutcome {
    let last_synced = local.server_version.unwrap_or(0);
    if remote.version <= last_synced {
        ConflictOutcome::RetryOverwrite
    } else if local.same_content_as_remote(remote) {
        ConflictOutcome::AdoptServerVersion
    } else {
        ConflictOutcome::Conflict(ConflictRecord::new(local.clone(), remote.clone()))
    }
}

/// Conflict manager for one identity scope
pub struct ConflictManager {
    db: SharedDatabase,
    scope: String,
}

impl ConflictManager {
    pub fn new(db: SharedDatabase, scope: impl Into<String>) -> Self {
        Self {
            db,
            scope: scope.into(),
        }
    }

    /// Persist a conflict and move the note into `Conflict`.
    pub fn record(&self, local: &Note, remote: &RemoteNote) -> NoteSyncResult<ConflictRecord> {
        let db = lock_db(&self.db)?;
        self.record_in(&db, local, remote)
    }

    /// Same as [`record`](Self::record) for a caller already holding the store.
    pub(crate) fn record_in(
        &self,
        db: &Database,
        local: &Note,
        remote: &RemoteNote,
    ) -> NoteSyncResult<ConflictRecord> {
        let mut note = local.clone();
        note.sync_status = SyncStatus::Conflict;
        let record = ConflictRecord::new(note.clone(), remote.clone());

        db.put_note(&self.scope, &note)?;
        db.save_conflict(&self.scope, &record)?;

        warn!(
            note_id = %note.id,
            local_version = note.version,
            remote_version = remote.version,
            "Conflict detected"
        );
        Ok(record)
    }

    /// Get the open conflict of a note
    pub fn get_conflict(&self, note_id: &Uuid) -> NoteSyncResult<Option<ConflictRecord>> {
        lock_db(&self.db)?.get_conflict(&self.scope, note_id)
    }

    pub fn list_conflicts(&self, include_resolved: bool) -> NoteSyncResult<Vec<ConflictRecord>> {
        lock_db(&self.db)?.list_conflicts(&self.scope, include_resolved)
    }

    pub fn unresolved_count(&self) -> NoteSyncResult<usize> {
        lock_db(&self.db)?.unresolved_conflict_count(&self.scope)
    }

    fn open_conflict(&self, note_id: &Uuid) -> NoteSyncResult<ConflictRecord> {
        self.get_conflict(note_id)?
            .ok_or_else(|| NoteSyncError::NotFound(format!("No open conflict for note {}", note_id)))
    }

    /// Resolve a conflict and return the note as stored afterwards.
    ///
    /// `KeepLocal` and `Merged` leave the note `LocalOnly`, rebased on the
    /// server version, ready to be enqueued. `KeepRemote` adopts the server
    /// copy and leaves the note `Synced`.
    pub fn resolve(
        &self,
        note_id: &Uuid,
        strategy: ConflictResolution,
        merged: Option<NotePatch>,
    ) -> NoteSyncResult<Note> {
        if let Some(patch) = &merged {
            validate_patch(patch)?;
        }

        let db = lock_db(&self.db)?;
        let record = db
            .get_conflict(&self.scope, note_id)?
            .ok_or_else(|| NoteSyncError::NotFound(format!("No open conflict for note {}", note_id)))?;
        let mut note = db
            .get_note(&self.scope, note_id)?
            .ok_or_else(|| NoteSyncError::NotFound(format!("Note {}", note_id)))?;
        let remote = &record.remote_snapshot;

        match strategy {
            ConflictResolution::Unresolved => {
                return Err(NoteSyncError::validation(
                    "strategy",
                    "must be keep_local, keep_remote or merged",
                ));
            }
            ConflictResolution::KeepLocal => {
                rebase_on(&mut note, remote);
                note.touch();
            }
            ConflictResolution::KeepRemote => {
                note.adopt_remote(remote, Utc::now());
            }
            ConflictResolution::Merged => {
                let patch = merged.ok_or_else(|| {
                    NoteSyncError::validation("merged", "required for merged resolution")
                })?;
                rebase_on(&mut note, remote);
                note.apply_patch(patch);
            }
        }

        db.put_note(&self.scope, &note)?;
        db.resolve_conflict_record(&self.scope, note_id, strategy)?;

        if let Some(mut status) = db.load_migration_status(&self.scope)? {
            if status.conflicts.contains(note_id) {
                status.conflicts.retain(|id| id != note_id);
                db.save_migration_status(&self.scope, &status)?;
            }
        }

        info!(note_id = %note_id, resolution = strategy.as_str(), "Conflict resolved");
        Ok(note)
    }

    /// Close the conflict of a note the user deleted; the tombstone wins.
    pub fn resolve_with_delete(&self, note_id: &Uuid) -> NoteSyncResult<Note> {
        let db = lock_db(&self.db)?;
        let record = db
            .get_conflict(&self.scope, note_id)?
            .ok_or_else(|| NoteSyncError::NotFound(format!("No open conflict for note {}", note_id)))?;
        let mut note = db
            .get_note(&self.scope, note_id)?
            .ok_or_else(|| NoteSyncError::NotFound(format!("Note {}", note_id)))?;

        rebase_on(&mut note, &record.remote_snapshot);
        note.deleted = true;
        note.touch();

        db.put_note(&self.scope, &note)?;
        db.resolve_conflict_record(&self.scope, note_id, ConflictResolution::KeepLocal)?;
        info!(note_id = %note_id, "Conflict resolved by deleting the note");
        Ok(note)
    }

    /// Suggest a merged version for the resolution UI
    pub fn suggest_merge(&self, note_id: &Uuid) -> NoteSyncResult<MergeSuggestion> {
        let record = self.open_conflict(note_id)?;
        Ok(suggest_merge(&record.local_snapshot, &record.remote_snapshot))
    }

    /// Get a diff of the local and server versions
    pub fn diff_preview(&self, note_id: &Uuid) -> NoteSyncResult<String> {
        let record = self.open_conflict(note_id)?;
        Ok(get_diff_preview(&record.local_snapshot, &record.remote_snapshot))
    }
}

/// Base the next update on the server copy so the conditional write succeeds.
fn rebase_on(note: &mut Note, remote: &RemoteNote) {
    note.remote_id = Some(remote.id.clone());
    note.server_version = Some(remote.version);
}
