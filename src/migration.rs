//! Migration Engine: attaches anonymous legacy notes to an account.
//!
//! A pass runs in two phases. The preflight takes a verified backup and
//! fetches the account's remote notes; any failure there is fatal and
//! nothing has been touched yet. The per-note phase then looks for a
//! remote duplicate of every legacy note and either creates it, links it,
//! or settles the duplicate per the configured policy. Per-note failures
//! are recorded and the note stays legacy so a later retry picks it up.
//!
//! Notes being migrated are held in the sync queue so a drain cannot race
//! the migration with a second create.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conflicts::ConflictManager;
use crate::database::{lock_db, SharedDatabase, LEGACY_SCOPE};
use crate::error::{NoteSyncError, NoteSyncResult};
use crate::events::{EventHub, SyncEvent};
use crate::gateway::{CreateNoteRequest, RemoteGateway, RemoteNote};
use crate::models::{Identity, MigrationIssue, MigrationStatus, Note, SyncStatus};
use crate::retry::{with_retry, RetryPolicy};
use crate::similarity::find_duplicate;
use crate::sync_queue::SyncEngine;

/// Whether legacy notes are matched against existing remote notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStrategy {
    /// Look for remote duplicates and reconcile them
    Merge,
    /// Upload every legacy note as a new remote note
    KeepBoth,
}

/// Which side wins when a legacy note matches a remote note with
/// different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Newer,
    Older,
    Manual,
}

impl ConflictPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "newer" => Some(ConflictPolicy::Newer),
            "older" => Some(ConflictPolicy::Older),
            "manual" => Some(ConflictPolicy::Manual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Newer => "newer",
            ConflictPolicy::Older => "older",
            ConflictPolicy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    pub strategy: MigrationStrategy,
    pub conflict_resolution: ConflictPolicy,
    /// Snapshot legacy notes before touching anything
    pub backup_local: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            strategy: MigrationStrategy::Merge,
            conflict_resolution: ConflictPolicy::Newer,
            backup_local: true,
        }
    }
}

/// What happened to one legacy note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No duplicate; created on the server
    Created,
    /// Identical remote note found; linked without a request
    Linked,
    /// Local content won; queued as an update of the remote note
    KeptLocal,
    /// Remote content won and replaced the local note
    KeptRemote,
    /// Waiting for a manual conflict decision
    Deferred,
}

/// True when an authenticated identity exists and any note lacks an owner
/// or has not reached the server yet.
pub fn check_migration_needed(local_notes: &[Note], identity: Option<&Identity>) -> bool {
    identity.is_some()
        && local_notes
            .iter()
            .any(|n| n.owner_id.is_none() || n.sync_status == SyncStatus::LocalOnly)
}

/// Releases held queue entries when a pass ends, however it ends.
struct HeldNotes<'a, G: RemoteGateway> {
    sync: &'a SyncEngine<G>,
    ids: Vec<Uuid>,
}

impl<G: RemoteGateway> Drop for HeldNotes<'_, G> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.sync.release(id);
        }
    }
}

pub struct MigrationEngine<G> {
    db: SharedDatabase,
    gateway: Arc<G>,
    sync: Arc<SyncEngine<G>>,
    identity: Identity,
    events: EventHub,
    conflicts: ConflictManager,
    retry: RetryPolicy,
}

impl<G: RemoteGateway> MigrationEngine<G> {
    pub fn new(
        db: SharedDatabase,
        gateway: Arc<G>,
        sync: Arc<SyncEngine<G>>,
        identity: Identity,
        events: EventHub,
    ) -> Self {
        let retry = sync.settings().retry;
        Self {
            conflicts: ConflictManager::new(db.clone(), identity.user_id.clone()),
            db,
            gateway,
            sync,
            identity,
            events,
            retry,
        }
    }

    fn scope(&self) -> &str {
        &self.identity.user_id
    }

    /// Persisted status of the last pass (default if none ran).
    pub fn status(&self) -> NoteSyncResult<MigrationStatus> {
        Ok(lock_db(&self.db)?
            .load_migration_status(self.scope())?
            .unwrap_or_default())
    }

    /// True if legacy notes remain or a previous pass was interrupted.
    pub fn needs_migration(&self) -> NoteSyncResult<bool> {
        let db = lock_db(&self.db)?;
        let legacy = db.legacy_notes()?;
        let interrupted = db
            .load_migration_status(self.scope())?
            .is_some_and(|s| s.in_progress);
        Ok(interrupted || check_migration_needed(&legacy, Some(&self.identity)))
    }

    /// Migrate every unmigrated legacy note in the store.
    pub async fn migrate_legacy(&self, options: MigrationOptions) -> NoteSyncResult<MigrationStatus> {
        let legacy = lock_db(&self.db)?.legacy_notes()?;
        self.start_migration(&legacy, options).await
    }

    /// Re-run over notes still unmigrated. Already migrated notes have an
    /// owner and are never processed twice.
    pub async fn retry_migration(&self, options: MigrationOptions) -> NoteSyncResult<MigrationStatus> {
        info!("Retrying migration");
        self.migrate_legacy(options).await
    }

    /// Run one migration pass over `local_notes`.
    pub async fn start_migration(
        &self,
        local_notes: &[Note],
        options: MigrationOptions,
    ) -> NoteSyncResult<MigrationStatus> {
        let pending: Vec<Note> = local_notes
            .iter()
            .filter(|n| n.owner_id.is_none() && !n.deleted)
            .cloned()
            .collect();

        let previous = self.status()?;
        let mut status = MigrationStatus {
            in_progress: true,
            total_notes: pending.len(),
            processed_notes: 0,
            errors: Vec::new(),
            conflicts: previous.conflicts,
            started_at: Some(Utc::now()),
            completed_at: None,
            backup_id: None,
        };
        info!(
            user_id = %self.identity.user_id,
            notes = pending.len(),
            "Starting migration"
        );

        // Preflight: nothing below may fail without aborting the pass
        let backup_confirmed = if options.backup_local {
            status.backup_id = Some(self.backup(&pending)?);
            true
        } else {
            false
        };
        let remote_notes = with_retry(self.retry, "list_notes", || self.gateway.list_notes())
            .await
            .map_err(|e| {
                NoteSyncError::migration_fatal(format!("Could not fetch remote notes: {}", e))
            })?;

        let _held = HeldNotes {
            sync: self.sync.as_ref(),
            ids: pending.iter().map(|n| n.id).collect(),
        };
        for note in &pending {
            self.sync.hold(note.id);
        }
        self.save_status(&status)?;
        self.events.emit(SyncEvent::MigrationProgress {
            status: status.clone(),
        });

        let mut claimed: HashSet<String> = HashSet::new();
        for note in &pending {
            match self.migrate_one(note, &remote_notes, &mut claimed, options).await {
                Ok(outcome) => {
                    debug!(note_id = %note.id, ?outcome, "Note migrated");
                    if outcome == MigrationOutcome::Deferred && !status.conflicts.contains(&note.id) {
                        status.conflicts.push(note.id);
                    }
                }
                Err(e) => {
                    warn!(note_id = %note.id, error = %e, "Note could not be migrated");
                    status.errors.push(MigrationIssue {
                        note_id: note.id,
                        title: note.title.clone(),
                        reason: e.to_string(),
                        at: Utc::now(),
                    });
                }
            }
            status.processed_notes += 1;
            self.save_status(&status)?;
            self.events.emit(SyncEvent::MigrationProgress {
                status: status.clone(),
            });
        }

        status.in_progress = false;
        status.completed_at = Some(Utc::now());
        if status.errors.is_empty() && backup_confirmed {
            let purged = lock_db(&self.db)?.purge_migrated_legacy()?;
            info!(purged, "Legacy notes removed after migration");
        }
        self.save_status(&status)?;

        info!(
            processed = status.processed_notes,
            errors = status.errors.len(),
            conflicts = status.conflicts.len(),
            "Migration finished"
        );
        self.events.emit(SyncEvent::MigrationCompleted {
            status: status.clone(),
        });
        Ok(status)
    }

    /// Store and verify a backup; returns its id.
    fn backup(&self, notes: &[Note]) -> NoteSyncResult<String> {
        let db = lock_db(&self.db)?;
        let record = db
            .create_backup(LEGACY_SCOPE, notes)
            .map_err(|e| NoteSyncError::migration_fatal(format!("Backup failed: {}", e)))?;
        let verified = db
            .verify_backup(&record.id)
            .map_err(|e| NoteSyncError::migration_fatal(format!("Backup check failed: {}", e)))?;
        if !verified {
            return Err(NoteSyncError::migration_fatal(format!(
                "Backup {} failed verification",
                record.id
            )));
        }
        info!(backup_id = %record.id, notes = record.note_count, "Backup confirmed");
        Ok(record.id)
    }

    fn save_status(&self, status: &MigrationStatus) -> NoteSyncResult<()> {
        lock_db(&self.db)?.save_migration_status(self.scope(), status)
    }

    /// Persist the account copy and mark the legacy row as migrated.
    fn store_migrated(&self, note: &Note) -> NoteSyncResult<()> {
        let db = lock_db(&self.db)?;
        db.put_note(self.scope(), note)?;
        db.mark_legacy_migrated(&note.id, self.scope())?;
        Ok(())
    }

    async fn migrate_one(
        &self,
        legacy: &Note,
        remote_notes: &[RemoteNote],
        claimed: &mut HashSet<String>,
        options: MigrationOptions,
    ) -> NoteSyncResult<MigrationOutcome> {
        let mut note = legacy.clone();
        note.owner_id = Some(self.identity.user_id.clone());

        let duplicate = match options.strategy {
            MigrationStrategy::Merge => find_duplicate(legacy, remote_notes, claimed),
            MigrationStrategy::KeepBoth => None,
        };

        let Some(found) = duplicate else {
            let request = CreateNoteRequest::from_note(&note);
            let remote = with_retry(self.retry, "create_note", || {
                self.gateway.create_note(&request)
            })
            .await
            .map_err(|e| NoteSyncError::migration_item(legacy.id, e.to_string()))?;
            note.mark_synced(&remote, Utc::now());
            self.store_migrated(&note)?;
            return Ok(MigrationOutcome::Created);
        };

        let remote = &remote_notes[found.index];
        claimed.insert(remote.id.clone());
        debug!(
            note_id = %legacy.id,
            remote_id = %remote.id,
            kind = ?found.kind,
            score = found.score,
            "Remote duplicate found"
        );

        if note.same_content_as_remote(remote) {
            note.mark_synced(remote, Utc::now());
            self.store_migrated(&note)?;
            return Ok(MigrationOutcome::Linked);
        }

        let local_wins = match options.conflict_resolution {
            ConflictPolicy::Newer => note.updated_at >= remote.updated_at,
            ConflictPolicy::Older => note.updated_at <= remote.updated_at,
            ConflictPolicy::Manual => {
                self.conflicts.record(&note, remote)?;
                lock_db(&self.db)?.mark_legacy_migrated(&note.id, self.scope())?;
                return Ok(MigrationOutcome::Deferred);
            }
        };

        if local_wins {
            note.remote_id = Some(remote.id.clone());
            note.server_version = Some(remote.version);
            note.sync_status = SyncStatus::LocalOnly;
            self.store_migrated(&note)?;
            self.sync.enqueue(&note);
            Ok(MigrationOutcome::KeptLocal)
        } else {
            note.adopt_remote(remote, Utc::now());
            self.store_migrated(&note)?;
            Ok(MigrationOutcome::KeptRemote)
        }
    }
}
