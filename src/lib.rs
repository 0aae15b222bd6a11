//! NoteSync - local-first note storage with server sync and account migration.
//!
//! This library provides:
//! - Data models (Note, ConflictRecord, MigrationStatus)
//! - Local store operations (SQLite)
//! - A remote gateway over the note API (HTTP client)
//! - A sync queue with retry, single-flight draining and conflict detection
//! - Migration of anonymous notes into an authenticated account
//! - Configuration management
//!
//! A [`session::NoteSession`] is the usual entry point: it is opened at
//! login with an injected store, gateway and identity, and owns every
//! service for that account until logout.
//!
//! # Feature Flags
//!
//! - `desktop`: Include desktop-specific features (hostname detection, config dir detection).

pub mod config;
pub mod conflicts;
pub mod database;
pub mod error;
pub mod events;
pub mod gateway;
pub mod gateway_http;
pub mod merge;
pub mod migration;
pub mod models;
pub mod notes;
pub mod retry;
pub mod session;
pub mod similarity;
pub mod sync_queue;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use database::{Database, SharedDatabase};
pub use error::{NoteSyncError, NoteSyncResult};
pub use events::{EventHub, SubscriptionId, SyncEvent};
pub use gateway::{GatewayError, RemoteGateway, RemoteNote};
pub use gateway_http::{HttpGateway, HttpGatewayConfig};
pub use migration::{ConflictPolicy, MigrationEngine, MigrationOptions, MigrationStrategy};
pub use models::{
    ConflictRecord, ConflictResolution, Identity, MigrationStatus, Note, NoteDraft, NotePatch,
    SyncStatus,
};
pub use notes::NoteService;
pub use session::NoteSession;
pub use sync_queue::{SyncEngine, SyncSettings};
