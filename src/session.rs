//! Per-login owner of the sync services.
//!
//! A `NoteSession` is built when a user logs in and dropped (or shut down)
//! at logout. It wires the store, the gateway and the event hub into the
//! sync queue, migration engine and note service for one identity, so
//! switching accounts means opening a new session.

use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::conflicts::ConflictManager;
use crate::database::SharedDatabase;
use crate::error::NoteSyncResult;
use crate::events::{EventHub, SubscriptionId, SyncEvent};
use crate::gateway::RemoteGateway;
use crate::migration::{MigrationEngine, MigrationOptions};
use crate::models::{Identity, MigrationStatus};
use crate::notes::NoteService;
use crate::sync_queue::{BackgroundSync, SyncEngine, SyncReport, SyncSettings};

/// What `start` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Status of the migration pass, if one was needed
    pub migration: Option<MigrationStatus>,
    /// Notes put back into the queue from the store
    pub restored: usize,
    pub initial_sync: SyncReport,
}

pub struct NoteSession<G: RemoteGateway + 'static> {
    identity: Identity,
    events: EventHub,
    sync: Arc<SyncEngine<G>>,
    notes: NoteService<G>,
    migration: MigrationEngine<G>,
    background: Mutex<Option<BackgroundSync>>,
}

impl<G: RemoteGateway + 'static> NoteSession<G> {
    pub fn open(
        db: SharedDatabase,
        gateway: Arc<G>,
        identity: Identity,
        settings: SyncSettings,
    ) -> Self {
        let events = EventHub::new();
        let sync = Arc::new(SyncEngine::new(
            db.clone(),
            Arc::clone(&gateway),
            identity.user_id.clone(),
            settings,
            events.clone(),
        ));
        let notes = NoteService::new(db.clone(), Arc::clone(&sync));
        let migration = MigrationEngine::new(
            db,
            gateway,
            Arc::clone(&sync),
            identity.clone(),
            events.clone(),
        );
        info!(user_id = %identity.user_id, "Session opened");
        Self {
            identity,
            events,
            sync,
            notes,
            migration,
            background: Mutex::new(None),
        }
    }

    /// Bring the session up: migrate legacy notes if needed, rebuild the
    /// queue from the store, drain once and start periodic sync.
    ///
    /// A fatal migration error is returned before sync starts.
    pub async fn start(&self, options: MigrationOptions) -> NoteSyncResult<StartupReport> {
        let mut report = StartupReport::default();

        if self.migration.needs_migration()? {
            let status = self.migration.migrate_legacy(options).await.map_err(|e| {
                error!(error = %e, "Migration aborted");
                e
            })?;
            report.migration = Some(status);
        }

        report.restored = self.sync.restore_queue()?;
        report.initial_sync = self.sync.trigger_sync().await?;

        let interval = self.sync.settings().sync_interval;
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if background.is_none() {
            *background = Some(self.sync.spawn_background(interval));
        }

        info!(
            user_id = %self.identity.user_id,
            restored = report.restored,
            "Session started"
        );
        Ok(report)
    }

    /// Stop background sync. Queued entries stay in the store as
    /// `LocalOnly` and are restored by the next session.
    pub fn shutdown(&self) {
        let stopped = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut background) = stopped {
            background.stop();
        }
        info!(user_id = %self.identity.user_id, "Session shut down");
    }

    pub fn is_syncing_in_background(&self) -> bool {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|b| b.is_running())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn notes(&self) -> &NoteService<G> {
        &self.notes
    }

    pub fn conflicts(&self) -> &ConflictManager {
        self.notes.conflicts()
    }

    pub fn migration(&self) -> &MigrationEngine<G> {
        &self.migration
    }

    pub fn sync(&self) -> &Arc<SyncEngine<G>> {
        &self.sync
    }

    /// Drain now instead of waiting for the next tick
    pub async fn trigger_sync(&self) -> NoteSyncResult<SyncReport> {
        self.sync.trigger_sync().await
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}
