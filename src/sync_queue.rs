//! Sync Queue Engine: propagates local mutations to the backend.
//!
//! The queue holds at most one entry per note id; a newer snapshot replaces
//! the queued one in place. Draining is single-flight: a trigger while a
//! drain runs returns immediately. Each entry is routed by the note's
//! current state:
//!
//! - tombstone with a server id: `DELETE`
//! - tombstone never acknowledged: purged locally, no request
//! - no server id yet: `POST`
//! - otherwise: `PUT` conditioned on the last acknowledged server version
//!
//! Transient failures are retried with backoff, then the note is demoted to
//! `Error` and recorded in the failed-sync ledger. A version mismatch is
//! never retried blindly; it goes to the conflict detector.
//!
//! The store is never locked across a network call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conflicts::{detect, ConflictManager, ConflictOutcome};
use crate::database::{lock_db, SharedDatabase};
use crate::error::NoteSyncResult;
use crate::events::{EventHub, SyncEvent};
use crate::gateway::{CreateNoteRequest, GatewayError, RemoteGateway, RemoteNote, UpdateNoteRequest};
use crate::models::{ConflictRecord, Note, SyncStatus};
use crate::retry::{with_retry, RetryPolicy};

/// Tuning for the queue, usually derived from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Entries taken per batch
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Period of the background drain
    pub sync_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            retry: RetryPolicy::default(),
            sync_interval: Duration::from_millis(30_000),
        }
    }
}

/// A pending mutation: the note as it was when enqueued.
#[derive(Debug, Clone)]
pub struct SyncQueueEntry {
    pub note_id: Uuid,
    pub snapshot: Note,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome counts of one `trigger_sync` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub deleted: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Entries dropped because the note vanished or is suspended
    pub skipped: usize,
    /// Entries put back because the store failed while handling them
    pub requeued: usize,
    /// True when another drain was running and this call did nothing
    pub already_running: bool,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<Uuid, SyncQueueEntry>,
    order: VecDeque<Uuid>,
    /// Ids reserved by migration; queued but not drained
    held: HashSet<Uuid>,
}

/// What a version mismatch was turned into.
enum Mismatch {
    Rebased,
    Adopted(i64),
    Conflicted(ConflictRecord),
}

/// The request an entry turns into.
enum Operation {
    Create,
    Update { remote_id: String, base_version: i64 },
    Delete { remote_id: String },
    PurgeLocal,
}

/// Clears the drain flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Queue and drain logic for one authenticated identity.
pub struct SyncEngine<G> {
    db: SharedDatabase,
    gateway: Arc<G>,
    scope: String,
    settings: SyncSettings,
    events: EventHub,
    conflicts: ConflictManager,
    queue: Mutex<QueueState>,
    draining: AtomicBool,
}

impl<G: RemoteGateway> SyncEngine<G> {
    pub fn new(
        db: SharedDatabase,
        gateway: Arc<G>,
        owner_id: impl Into<String>,
        settings: SyncSettings,
        events: EventHub,
    ) -> Self {
        let scope = owner_id.into();
        Self {
            conflicts: ConflictManager::new(db.clone(), scope.clone()),
            db,
            gateway,
            scope,
            settings,
            events,
            queue: Mutex::new(QueueState::default()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.scope
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn queue(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent even if a holder panicked
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a note for propagation, replacing any queued snapshot of it.
    ///
    /// Returns false when the note is not eligible: it has no owner (or
    /// another owner), is waiting for conflict resolution, or is already
    /// synced.
    pub fn enqueue(&self, note: &Note) -> bool {
        if note.owner_id.as_deref() != Some(self.scope.as_str()) {
            debug!(note_id = %note.id, "Not enqueued: note is not owned by this identity");
            return false;
        }
        if matches!(note.sync_status, SyncStatus::Conflict | SyncStatus::Synced) {
            debug!(note_id = %note.id, status = note.sync_status.as_str(), "Not enqueued");
            return false;
        }

        let entry = SyncQueueEntry {
            note_id: note.id,
            snapshot: note.clone(),
            enqueued_at: Utc::now(),
        };
        let mut queue = self.queue();
        if queue.entries.insert(note.id, entry).is_none() {
            queue.order.push_back(note.id);
        }
        true
    }

    /// Number of queued entries, held ones included
    pub fn pending_count(&self) -> usize {
        self.queue().entries.len()
    }

    pub fn is_queued(&self, note_id: &Uuid) -> bool {
        self.queue().entries.contains_key(note_id)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Keep a note out of drains until released.
    pub fn hold(&self, note_id: Uuid) {
        self.queue().held.insert(note_id);
    }

    pub fn release(&self, note_id: &Uuid) -> bool {
        self.queue().held.remove(note_id)
    }

    fn take_batch(&self) -> Vec<SyncQueueEntry> {
        let mut queue = self.queue();
        let QueueState {
            entries,
            order,
            held,
        } = &mut *queue;

        let mut batch = Vec::new();
        let mut kept = VecDeque::with_capacity(order.len());
        while let Some(id) = order.pop_front() {
            if batch.len() < self.settings.batch_size.max(1) && !held.contains(&id) {
                if let Some(entry) = entries.remove(&id) {
                    batch.push(entry);
                }
            } else {
                kept.push_back(id);
            }
        }
        *order = kept;
        batch
    }

    /// Rebuild the queue from the store after a restart.
    ///
    /// `Syncing` notes were interrupted mid-request and go back to `LocalOnly`.
    pub fn restore_queue(&self) -> NoteSyncResult<usize> {
        let notes = {
            let db = lock_db(&self.db)?;
            let mut notes = db.notes_with_status(
                &self.scope,
                &[SyncStatus::LocalOnly, SyncStatus::Error, SyncStatus::Syncing],
            )?;
            for note in notes.iter_mut() {
                if note.sync_status == SyncStatus::Syncing {
                    note.sync_status = SyncStatus::LocalOnly;
                    db.put_note(&self.scope, note)?;
                }
            }
            notes
        };

        let restored = notes.iter().filter(|note| self.enqueue(note)).count();
        info!(restored, "Sync queue restored");
        Ok(restored)
    }

    /// Manually retry a note in `Error`. Returns false for other states.
    pub fn retry_note(&self, note_id: &Uuid) -> NoteSyncResult<bool> {
        let note = {
            let db = lock_db(&self.db)?;
            let Some(mut note) = db.get_note(&self.scope, note_id)? else {
                return Ok(false);
            };
            if note.sync_status != SyncStatus::Error {
                return Ok(false);
            }
            note.sync_status = SyncStatus::LocalOnly;
            db.put_note(&self.scope, &note)?;
            db.resolve_sync_failures(&self.scope, note_id)?;
            note
        };
        Ok(self.enqueue(&note))
    }

    /// Retry every note in `Error`. Returns how many were re-queued.
    pub fn retry_failed(&self) -> NoteSyncResult<usize> {
        let failed = lock_db(&self.db)?.notes_with_status(&self.scope, &[SyncStatus::Error])?;
        let mut count = 0;
        for note in failed {
            if self.retry_note(&note.id)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drain the queue unless a drain is already running.
    pub async fn trigger_sync(&self) -> NoteSyncResult<SyncReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already running");
            return Ok(SyncReport {
                already_running: true,
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = SyncReport::default();
        let mut rebased: Vec<Uuid> = Vec::new();
        let mut failed: Vec<SyncQueueEntry> = Vec::new();
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            debug!(size = batch.len(), "Draining batch");
            for entry in batch {
                let kept = entry.clone();
                if let Err(e) = self.process(entry, &mut report, &mut rebased).await {
                    error!(note_id = %kept.note_id, error = %e, "Store error while syncing note");
                    failed.push(kept);
                }
            }
        }

        // Rebased notes go out on the next drain, not this one
        for note_id in rebased {
            let note = lock_db(&self.db)?.get_note(&self.scope, &note_id)?;
            if let Some(note) = note {
                self.enqueue(&note);
            }
        }
        for entry in failed {
            if self.requeue_after_error(entry) {
                report.requeued += 1;
            }
        }

        if report != SyncReport::default() {
            info!(
                synced = report.synced,
                deleted = report.deleted,
                conflicts = report.conflicts,
                failed = report.failed,
                requeued = report.requeued,
                "Drain finished"
            );
        }
        Ok(report)
    }

    /// Put an entry back after a store error so the next drain retries it.
    ///
    /// The stored note is reset from `Syncing` (or an `Error` whose ledger
    /// entry could not be written) to `LocalOnly`. If the store cannot even
    /// be read, the queued snapshot is kept as is. Returns false if the
    /// note is gone or a newer snapshot is already queued.
    fn requeue_after_error(&self, entry: SyncQueueEntry) -> bool {
        let current = lock_db(&self.db).and_then(|db| {
            let Some(mut note) = db.get_note(&self.scope, &entry.note_id)? else {
                return Ok(None);
            };
            if matches!(note.sync_status, SyncStatus::Syncing | SyncStatus::Error) {
                note.sync_status = SyncStatus::LocalOnly;
                db.put_note(&self.scope, &note)?;
            }
            Ok(Some(note))
        });

        let mut queue = self.queue();
        if queue.entries.contains_key(&entry.note_id) {
            // A newer snapshot was enqueued meanwhile
            return false;
        }
        let entry = match current {
            Ok(Some(note)) => SyncQueueEntry {
                snapshot: note,
                ..entry
            },
            Ok(None) => return false,
            Err(e) => {
                warn!(note_id = %entry.note_id, error = %e, "Requeueing stale snapshot");
                entry
            }
        };
        queue.order.push_back(entry.note_id);
        queue.entries.insert(entry.note_id, entry);
        true
    }

    async fn process(
        &self,
        entry: SyncQueueEntry,
        report: &mut SyncReport,
        rebased: &mut Vec<Uuid>,
    ) -> NoteSyncResult<()> {
        let note_id = entry.note_id;

        let operation = {
            let db = lock_db(&self.db)?;
            let Some(mut current) = db.get_note(&self.scope, &note_id)? else {
                report.skipped += 1;
                return Ok(());
            };
            if current.sync_status == SyncStatus::Conflict {
                report.skipped += 1;
                return Ok(());
            }

            let operation = match (&current.remote_id, current.deleted) {
                (None, true) => Operation::PurgeLocal,
                (Some(remote_id), true) => Operation::Delete {
                    remote_id: remote_id.clone(),
                },
                (None, false) => Operation::Create,
                (Some(remote_id), false) => Operation::Update {
                    remote_id: remote_id.clone(),
                    base_version: current.server_version.unwrap_or(0),
                },
            };

            if matches!(operation, Operation::PurgeLocal) {
                db.purge_note(&self.scope, &note_id)?;
                db.resolve_sync_failures(&self.scope, &note_id)?;
                debug!(note_id = %note_id, "Purged tombstone that never reached the server");
                report.deleted += 1;
                return Ok(());
            }

            current.sync_status = SyncStatus::Syncing;
            db.put_note(&self.scope, &current)?;
            operation
        };

        let snapshot = entry.snapshot;
        let policy = self.settings.retry;
        let result = match &operation {
            Operation::Create => {
                let request = CreateNoteRequest::from_note(&snapshot);
                with_retry(policy, "create_note", || self.gateway.create_note(&request))
                    .await
                    .map(Some)
            }
            Operation::Update {
                remote_id,
                base_version,
            } => {
                let request = UpdateNoteRequest::from_note(&snapshot, *base_version);
                with_retry(policy, "update_note", || {
                    self.gateway.update_note(remote_id, &request)
                })
                .await
                .map(Some)
            }
            Operation::Delete { remote_id } => {
                with_retry(policy, "delete_note", || self.gateway.delete_note(remote_id))
                    .await
                    .map(|_| None)
            }
            Operation::PurgeLocal => Ok(None),
        };

        match result {
            Ok(Some(remote)) => self.apply_ack(&snapshot, &remote, report),
            Ok(None) => self.finish_delete(&note_id, report),
            Err(GatewayError::VersionConflict(remote)) => {
                self.handle_mismatch(&note_id, &remote, report, rebased)
            }
            Err(err) => self.demote(&snapshot, &err, report),
        }
    }

    /// Record a server acknowledgment of `snapshot`.
    fn apply_ack(
        &self,
        snapshot: &Note,
        remote: &RemoteNote,
        report: &mut SyncReport,
    ) -> NoteSyncResult<()> {
        let synced_version = {
            let db = lock_db(&self.db)?;
            let Some(mut current) = db.get_note(&self.scope, &snapshot.id)? else {
                return Ok(());
            };

            if current.version != snapshot.version || current.deleted != snapshot.deleted {
                // Edited while the request was in flight: keep the newer edit
                // pending but base its update on what the server now holds.
                current.remote_id = Some(remote.id.clone());
                current.server_version = Some(remote.version);
                if current.sync_status == SyncStatus::Syncing {
                    current.sync_status = SyncStatus::LocalOnly;
                }
                db.put_note(&self.scope, &current)?;
                debug!(note_id = %current.id, "Stale acknowledgment, newer edit stays queued");
                None
            } else {
                current.mark_synced(remote, Utc::now());
                db.put_note(&self.scope, &current)?;
                db.resolve_sync_failures(&self.scope, &current.id)?;
                Some(current.version)
            }
        };

        if let Some(version) = synced_version {
            report.synced += 1;
            self.events.emit(SyncEvent::NoteSynced {
                note_id: snapshot.id,
                version,
            });
        } else if !self.is_queued(&snapshot.id) {
            let current = lock_db(&self.db)?.get_note(&self.scope, &snapshot.id)?;
            if let Some(current) = current {
                self.enqueue(&current);
            }
        }
        Ok(())
    }

    fn finish_delete(&self, note_id: &Uuid, report: &mut SyncReport) -> NoteSyncResult<()> {
        let db = lock_db(&self.db)?;
        if let Some(current) = db.get_note(&self.scope, note_id)? {
            if current.deleted {
                db.purge_note(&self.scope, note_id)?;
                db.resolve_sync_failures(&self.scope, note_id)?;
                report.deleted += 1;
                debug!(note_id = %note_id, "Tombstone confirmed and purged");
            }
        }
        Ok(())
    }

    fn handle_mismatch(
        &self,
        note_id: &Uuid,
        remote: &RemoteNote,
        report: &mut SyncReport,
        rebased: &mut Vec<Uuid>,
    ) -> NoteSyncResult<()> {
        // One guard from read to write; a user edit must not land between
        let outcome = {
            let db = lock_db(&self.db)?;
            let Some(mut current) = db.get_note(&self.scope, note_id)? else {
                return Ok(());
            };
            match detect(&current, remote) {
                ConflictOutcome::RetryOverwrite => {
                    current.remote_id = Some(remote.id.clone());
                    current.server_version = Some(remote.version);
                    current.sync_status = SyncStatus::LocalOnly;
                    db.put_note(&self.scope, &current)?;
                    Mismatch::Rebased
                }
                ConflictOutcome::AdoptServerVersion => {
                    current.mark_synced(remote, Utc::now());
                    db.put_note(&self.scope, &current)?;
                    db.resolve_sync_failures(&self.scope, note_id)?;
                    Mismatch::Adopted(current.version)
                }
                ConflictOutcome::Conflict(_) => {
                    Mismatch::Conflicted(self.conflicts.record_in(&db, &current, remote)?)
                }
            }
        };

        match outcome {
            Mismatch::Rebased => {
                info!(note_id = %note_id, remote_version = remote.version, "Rebased on server version");
                rebased.push(*note_id);
            }
            Mismatch::Adopted(version) => {
                report.synced += 1;
                self.events.emit(SyncEvent::NoteSynced {
                    note_id: *note_id,
                    version,
                });
            }
            Mismatch::Conflicted(record) => {
                report.conflicts += 1;
                self.events.emit(SyncEvent::ConflictDetected {
                    note_id: *note_id,
                    local: Box::new(record.local_snapshot),
                    remote: Box::new(record.remote_snapshot),
                });
            }
        }
        Ok(())
    }

    /// Give up on a note: `Error` status, ledger entry, event.
    fn demote(&self, snapshot: &Note, err: &GatewayError, report: &mut SyncReport) -> NoteSyncResult<()> {
        let message = err.to_string();
        {
            let db = lock_db(&self.db)?;
            let Some(mut current) = db.get_note(&self.scope, &snapshot.id)? else {
                return Ok(());
            };
            if current.version != snapshot.version {
                // A newer edit is queued and gets its own attempt
                if current.sync_status == SyncStatus::Syncing {
                    current.sync_status = SyncStatus::LocalOnly;
                    db.put_note(&self.scope, &current)?;
                }
                warn!(note_id = %snapshot.id, error = %message, "Sync failed for superseded snapshot");
                return Ok(());
            }
            current.sync_status = SyncStatus::Error;
            db.put_note(&self.scope, &current)?;
            db.record_sync_failure(&self.scope, snapshot, &message)?;
        }

        error!(note_id = %snapshot.id, error = %message, "Sync failed, note needs manual retry");
        report.failed += 1;
        self.events.emit(SyncEvent::SyncFailed {
            note_id: snapshot.id,
            snapshot: Box::new(snapshot.clone()),
            error: message,
        });
        Ok(())
    }
}

impl<G: RemoteGateway + 'static> SyncEngine<G> {
    /// Drain periodically in the background while the handle lives.
    pub fn spawn_background(self: &Arc<Self>, interval: Duration) -> BackgroundSync {
        let engine = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if engine.pending_count() == 0 || engine.is_draining() {
                    continue;
                }
                if let Err(e) = engine.trigger_sync().await {
                    warn!(error = %e, "Background sync failed");
                }
            }
        });
        BackgroundSync {
            handle: Some(handle),
        }
    }
}

/// Handle of the background drain task; dropping it stops the task.
pub struct BackgroundSync {
    handle: Option<JoinHandle<()>>,
}

impl BackgroundSync {
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for BackgroundSync {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::{ConflictResolution, NoteDraft, NotePatch};
    use crate::test_support::{FakeBackend, FakeCall};

    const OWNER: &str = "user-1";

    struct Harness {
        db: SharedDatabase,
        backend: Arc<FakeBackend>,
        engine: Arc<SyncEngine<FakeBackend>>,
        events: Arc<Mutex<Vec<SyncEvent>>>,
    }

    fn harness() -> Harness {
        let db = Database::new_in_memory().unwrap().into_shared();
        let backend = Arc::new(FakeBackend::new());
        let hub = EventHub::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        hub.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        let settings = SyncSettings {
            batch_size: 2,
            retry: RetryPolicy::new(3, Duration::from_millis(10)),
            sync_interval: Duration::from_millis(50),
        };
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            Arc::clone(&backend),
            OWNER,
            settings,
            hub,
        ));
        Harness {
            db,
            backend,
            engine,
            events,
        }
    }

    impl Harness {
        fn save_new(&self, title: &str, body: &str) -> Note {
            let note = Note::new(NoteDraft::new(title, body), Some(OWNER.to_string()));
            self.db.lock().unwrap().put_note(OWNER, &note).unwrap();
            note
        }

        fn edit(&self, id: &Uuid, body: &str) -> Note {
            let db = self.db.lock().unwrap();
            let mut note = db.get_note(OWNER, id).unwrap().unwrap();
            note.apply_patch(NotePatch::body(body));
            db.put_note(OWNER, &note).unwrap();
            note
        }

        fn load(&self, id: &Uuid) -> Option<Note> {
            self.db.lock().unwrap().get_note(OWNER, id).unwrap()
        }

        fn event_types(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|e| e.event_type()).collect()
        }
    }

    #[tokio::test]
    async fn test_create_then_sync() {
        let h = harness();
        let note = h.save_new("Groceries", "milk");
        assert!(h.engine.enqueue(&note));

        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.synced, 1);

        let stored = h.load(&note.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.last_sync_at.is_some());
        assert_eq!(stored.server_version, Some(1));
        let remote = h.backend.remote(stored.remote_id.as_deref().unwrap()).unwrap();
        assert_eq!(remote.body, "milk");
        assert_eq!(h.event_types(), vec!["sync.note_synced"]);
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_content_is_preserved() {
        let h = harness();
        let note = Note::new(
            NoteDraft {
                title: "Trip".to_string(),
                body: "passport\ntickets".to_string(),
                color: Some("#ffcc00".to_string()),
                tags: vec!["travel".to_string(), "todo".to_string()],
            },
            Some(OWNER.to_string()),
        );
        h.db.lock().unwrap().put_note(OWNER, &note).unwrap();
        h.engine.enqueue(&note);
        h.engine.trigger_sync().await.unwrap();

        let stored = h.load(&note.id).unwrap();
        let remote = h.backend.remote(stored.remote_id.as_deref().unwrap()).unwrap();
        assert!(stored.same_content(&note));
        assert!(stored.same_content_as_remote(&remote));
    }

    #[tokio::test]
    async fn test_rapid_enqueues_send_one_request_with_latest_snapshot() {
        let h = harness();
        let note = h.save_new("Draft", "v1");
        h.engine.enqueue(&note);
        let edited = h.edit(&note.id, "v2");
        h.engine.enqueue(&edited);
        assert_eq!(h.engine.pending_count(), 1);

        h.engine.trigger_sync().await.unwrap();

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            FakeCall::Create {
                title: "Draft".to_string(),
                body: "v2".to_string()
            }
        );
    }

    #[test]
    fn test_replacing_entry_keeps_queue_position() {
        let h = harness();
        let first = h.save_new("First", "1");
        let second = h.save_new("Second", "2");
        h.engine.enqueue(&first);
        h.engine.enqueue(&second);
        h.engine.enqueue(&h.edit(&first.id, "1b"));

        let batch = h.engine.take_batch();
        let ids: Vec<Uuid> = batch.iter().map(|e| e.note_id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(batch[0].snapshot.body, "1b");
    }

    #[tokio::test]
    async fn test_ownerless_and_conflict_notes_are_not_enqueued() {
        let h = harness();
        let anonymous = Note::new(NoteDraft::new("Anon", "x"), None);
        assert!(!h.engine.enqueue(&anonymous));

        let mut other = Note::new(NoteDraft::new("Other", "x"), Some("user-2".to_string()));
        assert!(!h.engine.enqueue(&other));
        other.owner_id = Some(OWNER.to_string());
        other.sync_status = SyncStatus::Conflict;
        assert!(!h.engine.enqueue(&other));

        assert_eq!(h.engine.pending_count(), 0);
        h.engine.trigger_sync().await.unwrap();
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_batches_until_empty() {
        let h = harness();
        for i in 0..5 {
            let note = h.save_new(&format!("Note {}", i), "body");
            h.engine.enqueue(&note);
        }
        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.synced, 5);
        assert_eq!(h.backend.create_count(), 5);
    }

    #[tokio::test]
    async fn test_edit_after_sync_updates_instead_of_creating() {
        let h = harness();
        let note = h.save_new("Title", "Hello");
        h.engine.enqueue(&note);
        h.engine.trigger_sync().await.unwrap();

        let edited = h.edit(&note.id, "Hello again");
        assert_eq!(edited.sync_status, SyncStatus::LocalOnly);
        h.engine.enqueue(&edited);
        h.engine.trigger_sync().await.unwrap();

        assert_eq!(h.backend.create_count(), 1);
        assert_eq!(h.backend.update_count(), 1);
        let stored = h.load(&note.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.server_version, Some(2));
        assert_eq!(stored.version, 2);
        let remote = h.backend.remote(stored.remote_id.as_deref().unwrap()).unwrap();
        assert_eq!(remote.body, "Hello again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let h = harness();
        let note = h.save_new("Flaky", "body");
        h.engine.enqueue(&note);
        h.backend.fail_next(2);

        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.backend.create_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_demote_to_error() {
        let h = harness();
        let note = h.save_new("Offline", "body");
        h.engine.enqueue(&note);
        h.backend.make_unreachable("Offline");

        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.backend.create_count(), 3);

        let stored = h.load(&note.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Error);
        let ledger = h.db.lock().unwrap().list_sync_failures(OWNER, false).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].note_id, note.id);
        assert_eq!(h.event_types(), vec!["sync.failed"]);

        // Not retried automatically
        h.engine.trigger_sync().await.unwrap();
        assert_eq!(h.backend.create_count(), 3);
    }

    #[tokio::test]
    async fn test_semantic_error_is_not_retried() {
        let h = harness();
        let note = h.save_new("Rejected", "body");
        h.engine.enqueue(&note);
        h.backend.reject_title("Rejected");

        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.backend.create_count(), 1);
        assert_eq!(h.load(&note.id).unwrap().sync_status, SyncStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_resolves_ledger() {
        let h = harness();
        let note = h.save_new("Later", "body");
        h.engine.enqueue(&note);
        h.backend.fail_next(3);
        h.engine.trigger_sync().await.unwrap();
        assert_eq!(h.load(&note.id).unwrap().sync_status, SyncStatus::Error);

        assert_eq!(h.engine.retry_failed().unwrap(), 1);
        assert!(h.db.lock().unwrap().list_sync_failures(OWNER, false).unwrap().is_empty());
        h.engine.trigger_sync().await.unwrap();
        assert_eq!(h.load(&note.id).unwrap().sync_status, SyncStatus::Synced);
        assert!(!h.engine.retry_note(&note.id).unwrap());
    }

    #[tokio::test]
    async fn test_delete_confirmed_then_purged() {
        let h = harness();
        let note = h.save_new("Temp", "body");
        h.engine.enqueue(&note);
        h.engine.trigger_sync().await.unwrap();
        let remote_id = h.load(&note.id).unwrap().remote_id.unwrap();

        let tombstone = {
            let db = h.db.lock().unwrap();
            let mut n = db.get_note(OWNER, &note.id).unwrap().unwrap();
            n.deleted = true;
            n.touch();
            db.put_note(OWNER, &n).unwrap();
            n
        };
        h.engine.enqueue(&tombstone);
        let report = h.engine.trigger_sync().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(h.load(&note.id).is_none());
        assert!(h.backend.remote(&remote_id).is_none());
    }

    #[tokio::test]
    async fn test_unacknowledged_tombstone_is_purged_locally() {
        let h = harness();
        let mut note = h.save_new("Never sent", "body");
        note.deleted = true;
        note.touch();
        h.db.lock().unwrap().put_note(OWNER, &note).unwrap();
        h.engine.enqueue(&note);

        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(h.backend.calls().is_empty());
        assert!(h.load(&note.id).is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_with_different_content_is_a_conflict() {
        let h = harness();
        let note = h.save_new("A", "Hello");
        h.engine.enqueue(&note);
        h.engine.trigger_sync().await.unwrap();
        let remote_id = h.load(&note.id).unwrap().remote_id.unwrap();

        h.backend.edit_remote(&remote_id, "Hi");
        let edited = h.edit(&note.id, "Hello world");
        h.engine.enqueue(&edited);
        let report = h.engine.trigger_sync().await.unwrap();

        assert_eq!(report.conflicts, 1);
        let stored = h.load(&note.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
        assert_eq!(stored.body, "Hello world");
        assert_eq!(h.backend.remote(&remote_id).unwrap().body, "Hi");
        assert!(h.event_types().contains(&"sync.conflict_detected"));

        // Suspended: further drains do not resend it
        h.backend.clear_calls();
        assert!(!h.engine.enqueue(&stored));
        h.engine.trigger_sync().await.unwrap();
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_with_same_content_adopts_server_version() {
        let h = harness();
        let note = h.save_new("A", "Hello");
        h.engine.enqueue(&note);
        h.engine.trigger_sync().await.unwrap();
        let remote_id = h.load(&note.id).unwrap().remote_id.unwrap();

        h.backend.edit_remote(&remote_id, "Same edit");
        let edited = h.edit(&note.id, "Same edit");
        h.engine.enqueue(&edited);
        let report = h.engine.trigger_sync().await.unwrap();

        assert_eq!(report.conflicts, 0);
        assert_eq!(report.synced, 1);
        let stored = h.load(&note.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.server_version, Some(2));
    }

    #[tokio::test]
    async fn test_keep_local_overwrites_server_at_new_version() {
        let h = harness();
        let note = h.save_new("A", "Hello");
        h.engine.enqueue(&note);
        h.engine.trigger_sync().await.unwrap();
        let remote_id = h.load(&note.id).unwrap().remote_id.unwrap();

        h.backend.edit_remote(&remote_id, "Hi");
        h.engine.enqueue(&h.edit(&note.id, "Hello world"));
        h.engine.trigger_sync().await.unwrap();
        assert_eq!(h.load(&note.id).unwrap().sync_status, SyncStatus::Conflict);

        let resolved = h
            .engine
            .conflicts
            .resolve(&note.id, ConflictResolution::KeepLocal, None)
            .unwrap();
        assert!(h.engine.enqueue(&resolved));
        h.engine.trigger_sync().await.unwrap();

        let remote = h.backend.remote(&remote_id).unwrap();
        assert_eq!(remote.body, "Hello world");
        assert_eq!(remote.version, 3);
        assert_eq!(h.load(&note.id).unwrap().sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_stale_acknowledgment_keeps_newer_edit() {
        let h = harness();
        let note = h.save_new("Racy", "first");
        h.engine.enqueue(&note);

        let db = h.db.clone();
        let engine = Arc::downgrade(&h.engine);
        let note_id = note.id;
        h.backend.set_before_write(move || {
            let guard = db.lock().unwrap();
            let mut current = guard.get_note(OWNER, &note_id).unwrap().unwrap();
            if current.body == "first" {
                current.apply_patch(NotePatch::body("second"));
                guard.put_note(OWNER, &current).unwrap();
                drop(guard);
                if let Some(engine) = engine.upgrade() {
                    engine.enqueue(&current);
                }
            }
        });

        // The superseding edit is re-queued and goes out in the same drain
        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.backend.create_count(), 1);
        assert_eq!(h.backend.update_count(), 1);

        let stored = h.load(&note.id).unwrap();
        assert_eq!(stored.body, "second");
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.server_version, Some(2));
        let remote = h.backend.remote(stored.remote_id.as_deref().unwrap()).unwrap();
        assert_eq!(remote.body, "second");
    }

    #[tokio::test]
    async fn test_edit_during_rejected_update_survives_conflict() {
        let h = harness();
        let note = h.save_new("A", "Hello");
        h.engine.enqueue(&note);
        h.engine.trigger_sync().await.unwrap();
        let remote_id = h.load(&note.id).unwrap().remote_id.unwrap();

        h.backend.edit_remote(&remote_id, "Hi");
        h.engine.enqueue(&h.edit(&note.id, "Hello world"));

        let db = h.db.clone();
        let note_id = note.id;
        h.backend.set_before_write(move || {
            let guard = db.lock().unwrap();
            let mut current = guard.get_note(OWNER, &note_id).unwrap().unwrap();
            if current.body == "Hello world" {
                current.apply_patch(NotePatch::body("Hello world, again"));
                guard.put_note(OWNER, &current).unwrap();
            }
        });
        let report = h.engine.trigger_sync().await.unwrap();

        assert_eq!(report.conflicts, 1);
        let stored = h.load(&note.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
        assert_eq!(stored.body, "Hello world, again");
        assert_eq!(stored.version, 3);
        let record = h.engine.conflicts.get_conflict(&note.id).unwrap().unwrap();
        assert_eq!(record.local_snapshot.body, "Hello world, again");
        assert_eq!(record.remote_snapshot.body, "Hi");
    }

    #[tokio::test]
    async fn test_store_error_requeues_note_and_finishes_batch() {
        let h = harness();
        let bad = h.save_new("Bad", "rejected");
        let b = h.save_new("B", "b");
        let c = h.save_new("C", "c");
        for note in [&bad, &b, &c] {
            h.engine.enqueue(note);
        }
        h.backend.reject_title("Bad");
        h.db
            .lock()
            .unwrap()
            .execute_raw(
                "CREATE TRIGGER block_ledger BEFORE INSERT ON sync_failures \
                 BEGIN SELECT RAISE(ABORT, 'ledger unavailable'); END;",
            )
            .unwrap();

        let report = h.engine.trigger_sync().await.unwrap();

        assert_eq!(report.synced, 2);
        assert_eq!(report.requeued, 1);
        assert_eq!(h.load(&b.id).unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(h.load(&c.id).unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(h.load(&bad.id).unwrap().sync_status, SyncStatus::LocalOnly);
        assert!(h.engine.is_queued(&bad.id));
        assert_eq!(h.engine.pending_count(), 1);

        // Next drain picks it up once the store and server recover
        h.db
            .lock()
            .unwrap()
            .execute_raw("DROP TRIGGER block_ledger;")
            .unwrap();
        h.backend.clear_failures();
        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.load(&bad.id).unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(h.backend.create_count(), 4);
    }

    #[tokio::test]
    async fn test_held_notes_are_not_drained() {
        let h = harness();
        let note = h.save_new("Held", "body");
        h.engine.hold(note.id);
        h.engine.enqueue(&note);

        h.engine.trigger_sync().await.unwrap();
        assert!(h.backend.calls().is_empty());
        assert_eq!(h.engine.pending_count(), 1);

        assert!(h.engine.release(&note.id));
        h.engine.trigger_sync().await.unwrap();
        assert_eq!(h.backend.create_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_queue_after_restart() {
        let h = harness();
        let pending = h.save_new("Pending", "1");
        let mut interrupted = h.save_new("Interrupted", "2");
        interrupted.sync_status = SyncStatus::Syncing;
        h.db.lock().unwrap().put_note(OWNER, &interrupted).unwrap();
        let mut synced = h.save_new("Done", "3");
        synced.sync_status = SyncStatus::Synced;
        h.db.lock().unwrap().put_note(OWNER, &synced).unwrap();

        assert_eq!(h.engine.restore_queue().unwrap(), 2);
        assert!(h.engine.is_queued(&pending.id));
        assert!(h.engine.is_queued(&interrupted.id));
        assert_eq!(
            h.load(&interrupted.id).unwrap().sync_status,
            SyncStatus::LocalOnly
        );
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_absorbed() {
        let h = harness();
        h.engine.draining.store(true, Ordering::SeqCst);
        let report = h.engine.trigger_sync().await.unwrap();
        assert!(report.already_running);
        h.engine.draining.store(false, Ordering::SeqCst);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sync_drains_queue() {
        let h = harness();
        let mut background = h.engine.spawn_background(Duration::from_millis(50));
        assert!(background.is_running());

        let note = h.save_new("Background", "body");
        h.engine.enqueue(&note);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(h.load(&note.id).unwrap().sync_status, SyncStatus::Synced);
        background.stop();
        assert!(!background.is_running());
    }
}
