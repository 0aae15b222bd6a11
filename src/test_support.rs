//! In-memory backend used by the engine tests.
//!
//! Behaves like the note API: ids are assigned on create, versions start at
//! 1 and increase on every accepted update, and an update based on an older
//! version is rejected with the server copy. Failures can be injected.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;

use crate::gateway::{
    CreateNoteRequest, GatewayError, RemoteGateway, RemoteNote, UpdateNoteRequest,
};

/// One request seen by the fake backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FakeCall {
    Create { title: String, body: String },
    Update { remote_id: String, base_version: i64, body: String },
    Delete { remote_id: String },
    List,
}

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct FakeState {
    notes: BTreeMap<String, RemoteNote>,
    next_id: u64,
    calls: Vec<FakeCall>,
    transient_failures: u32,
    unreachable_titles: HashSet<String>,
    rejected_titles: HashSet<String>,
    fail_list: bool,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    /// Runs inside a write call before it answers, e.g. to edit a note mid-flight
    before_write: Mutex<Option<Hook>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Add a note as if another device created it.
    pub fn insert_remote(&self, title: &str, body: &str) -> RemoteNote {
        let mut state = self.state();
        state.next_id += 1;
        let now = Utc::now();
        let note = RemoteNote {
            id: format!("srv-{}", state.next_id),
            title: title.to_string(),
            body: body.to_string(),
            color: "default".to_string(),
            tags: Vec::new(),
            created_at: Some(now),
            updated_at: now,
            version: 1,
        };
        state.notes.insert(note.id.clone(), note.clone());
        note
    }

    /// Edit a note as if another device updated it; bumps the version.
    pub fn edit_remote(&self, remote_id: &str, body: &str) -> RemoteNote {
        let mut state = self.state();
        let note = state.notes.get_mut(remote_id).unwrap();
        note.body = body.to_string();
        note.version += 1;
        note.updated_at = Utc::now();
        note.clone()
    }

    pub fn remote(&self, remote_id: &str) -> Option<RemoteNote> {
        self.state().notes.get(remote_id).cloned()
    }

    pub fn remote_notes(&self) -> Vec<RemoteNote> {
        self.state().notes.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn create_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, FakeCall::Create { .. }))
            .count()
    }

    pub fn update_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, FakeCall::Update { .. }))
            .count()
    }

    /// Fail the next `n` requests with a network error.
    pub fn fail_next(&self, n: u32) {
        self.state().transient_failures = n;
    }

    /// Creates of notes with this title always fail with a network error.
    pub fn make_unreachable(&self, title: &str) {
        self.state().unreachable_titles.insert(title.to_string());
    }

    /// Creates of notes with this title are rejected with 422.
    pub fn reject_title(&self, title: &str) {
        self.state().rejected_titles.insert(title.to_string());
    }

    /// Undo all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.transient_failures = 0;
        state.unreachable_titles.clear();
        state.rejected_titles.clear();
        state.fail_list = false;
    }

    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    pub fn set_before_write<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.before_write.lock().unwrap() = Some(Box::new(hook));
    }

    fn run_hook(&self) {
        if let Some(hook) = self.before_write.lock().unwrap().as_ref() {
            hook();
        }
    }

    fn take_transient(state: &mut FakeState) -> Result<(), GatewayError> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(GatewayError::Network("connection reset".to_string()));
        }
        Ok(())
    }
}

impl RemoteGateway for FakeBackend {
    async fn create_note(&self, request: &CreateNoteRequest) -> Result<RemoteNote, GatewayError> {
        self.run_hook();
        let mut state = self.state();
        state.calls.push(FakeCall::Create {
            title: request.title.clone(),
            body: request.content.clone(),
        });
        Self::take_transient(&mut state)?;
        if state.unreachable_titles.contains(&request.title) {
            return Err(GatewayError::Network("timed out".to_string()));
        }
        if state.rejected_titles.contains(&request.title) {
            return Err(GatewayError::Status {
                status: 422,
                message: "title rejected".to_string(),
            });
        }

        state.next_id += 1;
        let note = RemoteNote {
            id: format!("srv-{}", state.next_id),
            title: request.title.clone(),
            body: request.content.clone(),
            color: request.color.clone(),
            tags: request.tags.clone(),
            created_at: Some(request.created_at),
            updated_at: request.updated_at,
            version: 1,
        };
        state.notes.insert(note.id.clone(), note.clone());
        Ok(note)
    }

    async fn update_note(
        &self,
        remote_id: &str,
        request: &UpdateNoteRequest,
    ) -> Result<RemoteNote, GatewayError> {
        self.run_hook();
        let mut state = self.state();
        state.calls.push(FakeCall::Update {
            remote_id: remote_id.to_string(),
            base_version: request.version,
            body: request.content.clone(),
        });
        Self::take_transient(&mut state)?;

        let note = state.notes.get_mut(remote_id).ok_or_else(|| GatewayError::Status {
            status: 404,
            message: "note not found".to_string(),
        })?;
        if note.version > request.version {
            return Err(GatewayError::VersionConflict(Box::new(note.clone())));
        }

        note.title = request.title.clone();
        note.body = request.content.clone();
        note.color = request.color.clone();
        note.tags = request.tags.clone();
        note.updated_at = request.updated_at;
        note.version += 1;
        Ok(note.clone())
    }

    async fn delete_note(&self, remote_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state();
        state.calls.push(FakeCall::Delete {
            remote_id: remote_id.to_string(),
        });
        Self::take_transient(&mut state)?;
        state.notes.remove(remote_id);
        Ok(())
    }

    async fn list_notes(&self) -> Result<Vec<RemoteNote>, GatewayError> {
        let mut state = self.state();
        state.calls.push(FakeCall::List);
        if state.fail_list {
            return Err(GatewayError::Network("unreachable".to_string()));
        }
        Self::take_transient(&mut state)?;
        Ok(state.notes.values().cloned().collect())
    }
}
