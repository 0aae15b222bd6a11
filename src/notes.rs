//! Note Lifecycle Controller.
//!
//! Entry point for UI mutations. Every change is written to the store first,
//! stamped with a new version and `LocalOnly` status, and then handed to the
//! sync queue. This service never talks to the backend itself.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::conflicts::ConflictManager;
use crate::database::{lock_db, Database, SharedDatabase, LEGACY_SCOPE};
use crate::error::{NoteSyncError, NoteSyncResult};
use crate::gateway::RemoteGateway;
use crate::gateway_http::HttpGateway;
use crate::models::{ConflictResolution, FailedSync, Note, NoteDraft, NotePatch, SyncStatus};
use crate::sync_queue::SyncEngine;
use crate::validation::{validate_draft, validate_patch};

pub struct NoteService<G = HttpGateway> {
    db: SharedDatabase,
    scope: String,
    sync: Option<Arc<SyncEngine<G>>>,
    conflicts: ConflictManager,
}

impl<G: RemoteGateway> NoteService<G> {
    /// Service for the identity the sync engine belongs to.
    pub fn new(db: SharedDatabase, sync: Arc<SyncEngine<G>>) -> Self {
        let scope = sync.owner_id().to_string();
        Self {
            conflicts: ConflictManager::new(db.clone(), scope.clone()),
            db,
            scope,
            sync: Some(sync),
        }
    }

    /// Anonymous service: notes have no owner and never leave the device
    /// until migrated.
    pub fn local(db: SharedDatabase) -> Self {
        Self {
            conflicts: ConflictManager::new(db.clone(), LEGACY_SCOPE),
            db,
            scope: LEGACY_SCOPE.to_string(),
            sync: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.sync.is_none()
    }

    pub fn conflicts(&self) -> &ConflictManager {
        &self.conflicts
    }

    fn owner(&self) -> Option<String> {
        self.sync.as_ref().map(|s| s.owner_id().to_string())
    }

    fn enqueue(&self, note: &Note) {
        if let Some(sync) = &self.sync {
            sync.enqueue(note);
        }
    }

    pub fn create_note(&self, draft: NoteDraft) -> NoteSyncResult<Note> {
        validate_draft(&draft)?;
        let note = Note::new(draft, self.owner());
        lock_db(&self.db)?.put_note(&self.scope, &note)?;
        debug!(note_id = %note.id, "Note created");
        self.enqueue(&note);
        Ok(note)
    }

    /// Apply a patch as a new local version.
    ///
    /// Notes waiting for conflict resolution reject edits.
    pub fn update_note(&self, note_id: &Uuid, patch: NotePatch) -> NoteSyncResult<Note> {
        validate_patch(&patch)?;
        // One guard from read to write; an acknowledgment must not land between
        let note = {
            let db = lock_db(&self.db)?;
            let mut note = live_note(&db, &self.scope, note_id)?;
            if note.sync_status == SyncStatus::Conflict {
                return Err(NoteSyncError::Conflict(format!(
                    "Note {} has an unresolved conflict",
                    note_id
                )));
            }
            note.apply_patch(patch);
            db.put_note(&self.scope, &note)?;
            note
        };

        debug!(note_id = %note.id, version = note.version, "Note updated");
        self.enqueue(&note);
        Ok(note)
    }

    /// Tombstone a note; returns the tombstone.
    ///
    /// The row is purged once the delete reaches the server. Anonymous notes
    /// have nothing to propagate and are purged right away.
    pub fn delete_note(&self, note_id: &Uuid) -> NoteSyncResult<Note> {
        let tombstone = {
            let db = lock_db(&self.db)?;
            let mut note = live_note(&db, &self.scope, note_id)?;
            if note.sync_status == SyncStatus::Conflict {
                None
            } else {
                note.deleted = true;
                note.touch();
                if self.is_local() {
                    db.purge_note(&self.scope, note_id)?;
                } else {
                    db.put_note(&self.scope, &note)?;
                }
                Some(note)
            }
        };
        let note = match tombstone {
            Some(note) => note,
            None => self.conflicts.resolve_with_delete(note_id)?,
        };

        info!(note_id = %note_id, "Note deleted");
        self.enqueue(&note);
        Ok(note)
    }

    pub fn get_note(&self, note_id: &Uuid) -> NoteSyncResult<Option<Note>> {
        Ok(lock_db(&self.db)?
            .get_note(&self.scope, note_id)?
            .filter(|n| !n.deleted))
    }

    /// Live notes, most recently updated first
    pub fn list_notes(&self) -> NoteSyncResult<Vec<Note>> {
        lock_db(&self.db)?.list_notes(&self.scope, false)
    }

    /// Resolve a conflict and put the note back into the queue.
    pub fn resolve_conflict(
        &self,
        note_id: &Uuid,
        strategy: ConflictResolution,
        merged: Option<NotePatch>,
    ) -> NoteSyncResult<Note> {
        let note = self.conflicts.resolve(note_id, strategy, merged)?;
        if note.sync_status == SyncStatus::LocalOnly {
            self.enqueue(&note);
        }
        Ok(note)
    }

    /// Re-queue a note that gave up syncing. False if it is not in `Error`.
    pub fn retry_note(&self, note_id: &Uuid) -> NoteSyncResult<bool> {
        match &self.sync {
            Some(sync) => sync.retry_note(note_id),
            None => Ok(false),
        }
    }

    /// Open entries of the failed-sync ledger
    pub fn failed_syncs(&self) -> NoteSyncResult<Vec<FailedSync>> {
        lock_db(&self.db)?.list_sync_failures(&self.scope, false)
    }
}

/// Load a live note or fail with NotFound.
fn live_note(db: &Database, scope: &str, note_id: &Uuid) -> NoteSyncResult<Note> {
    db.get_note(scope, note_id)?
        .filter(|n| !n.deleted)
        .ok_or_else(|| NoteSyncError::NotFound(format!("Note {}", note_id)))
}
