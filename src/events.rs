//! Observer interface for sync and migration notifications.
//!
//! Collaborators (status bars, conflict dialogs, migration progress views)
//! subscribe a listener and receive [`SyncEvent`]s carrying enough payload to
//! render without querying engine internals. The hub belongs to a session
//! and is dropped with it.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use uuid::Uuid;

use crate::gateway::RemoteNote;
use crate::models::{MigrationStatus, Note};

/// Notifications emitted by the sync queue and migration engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Server and device diverged; both versions attached
    ConflictDetected {
        note_id: Uuid,
        local: Box<Note>,
        remote: Box<RemoteNote>,
    },
    /// Propagation gave up; note is now in `Error`
    SyncFailed {
        note_id: Uuid,
        snapshot: Box<Note>,
        error: String,
    },
    /// Server acknowledged the note
    NoteSynced { note_id: Uuid, version: i64 },
    MigrationProgress { status: MigrationStatus },
    MigrationCompleted { status: MigrationStatus },
}

impl SyncEvent {
    /// Dot-namespaced name, e.g. `sync.conflict_detected`.
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConflictDetected { .. } => "sync.conflict_detected",
            SyncEvent::SyncFailed { .. } => "sync.failed",
            SyncEvent::NoteSynced { .. } => "sync.note_synced",
            SyncEvent::MigrationProgress { .. } => "migration.progress_updated",
            SyncEvent::MigrationCompleted { .. } => "migration.completed",
        }
    }
}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Registry of listeners; cheap to clone, clones share listeners.
#[derive(Clone, Default)]
pub struct EventHub {
    listeners: Arc<Mutex<Vec<(SubscriptionId, Listener)>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener)>> {
        // A listener list is valid even if a holder panicked
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener. It is called synchronously on the emitting task.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::now_v7());
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Deliver an event to every listener.
    pub fn emit(&self, event: SyncEvent) {
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let listeners: Vec<Listener> = self
            .listeners()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        tracing::debug!(event_type = event.event_type(), listeners = listeners.len(), "Emitting event");
        for listener in listeners {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_and_emit() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.subscribe(move |event| sink.lock().unwrap().push(event.event_type()));

        hub.emit(SyncEvent::NoteSynced {
            note_id: Uuid::now_v7(),
            version: 2,
        });

        assert_eq!(*seen.lock().unwrap(), vec!["sync.note_synced"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let id = hub.subscribe(move |_| *sink.lock().unwrap() += 1);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(SyncEvent::MigrationCompleted {
            status: MigrationStatus::default(),
        });

        assert_eq!(*seen.lock().unwrap(), 0);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SyncEvent::MigrationProgress {
            status: MigrationStatus {
                total_notes: 3,
                processed_notes: 1,
                in_progress: true,
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "migration_progress");
        assert_eq!(value["status"]["processed_notes"], 1);
    }

    #[test]
    fn test_listeners_survive_a_panicking_holder() {
        let hub = EventHub::new();
        let shared = hub.clone();
        let result = std::thread::spawn(move || {
            let _guard = shared.listeners.lock().unwrap();
            panic!("listener registry poisoned");
        })
        .join();
        assert!(result.is_err());
        assert!(hub.listeners.is_poisoned());

        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let id = hub.subscribe(move |_| *sink.lock().unwrap() += 1);
        assert_eq!(hub.listener_count(), 1);

        hub.emit(SyncEvent::NoteSynced {
            note_id: Uuid::now_v7(),
            version: 1,
        });
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(hub.unsubscribe(id));
    }
}
