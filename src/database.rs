//! Local Store: durable per-device persistence using SQLite.
//!
//! Notes are keyed by `(scope, id)`. The scope is the owner id for
//! account notes and [`LEGACY_SCOPE`] for anonymous notes created before
//! login. Besides notes the store keeps the migration status, the
//! failed-sync ledger, conflict records and pre-migration backups.
//!
//! UUIDs are stored as BLOB (16 bytes). All timestamps are Unix
//! milliseconds (INTEGER). No business logic lives here.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{NoteSyncError, NoteSyncResult};
use crate::gateway::RemoteNote;
use crate::models::{
    BackupRecord, ConflictRecord, ConflictResolution, FailedSync, MigrationStatus, Note,
    SyncStatus,
};
use crate::validation::uuid_from_bytes;

/// Scope of anonymous notes that predate login.
pub const LEGACY_SCOPE: &str = "";

const NOTE_COLUMNS: &str = "id, owner_id, remote_id, title, body, color, tags, created_at, \
     updated_at, version, server_version, sync_status, last_sync_at, deleted";

/// Store handle shared by the engines of one session.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Lock a shared store, mapping poisoning to a database error.
pub fn lock_db(db: &SharedDatabase) -> NoteSyncResult<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|e| NoteSyncError::database_op(format!("Database lock poisoned: {}", e)))
}

/// Scope a note is stored under.
pub fn scope_of(note: &Note) -> &str {
    note.owner_id.as_deref().unwrap_or(LEGACY_SCOPE)
}

fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> NoteSyncResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| NoteSyncError::database_op(format!("Invalid timestamp: {}", ms)))
}

/// Hex encoded SHA-256 of a payload
fn checksum(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Raw note row as read from SQLite
struct NoteRow {
    id: Vec<u8>,
    owner_id: Option<String>,
    remote_id: Option<String>,
    title: String,
    body: String,
    color: String,
    tags: String,
    created_at: i64,
    updated_at: i64,
    version: i64,
    server_version: Option<i64>,
    sync_status: String,
    last_sync_at: Option<i64>,
    deleted: bool,
}

impl NoteRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            remote_id: row.get(2)?,
            title: row.get(3)?,
            body: row.get(4)?,
            color: row.get(5)?,
            tags: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            version: row.get(9)?,
            server_version: row.get(10)?,
            sync_status: row.get(11)?,
            last_sync_at: row.get(12)?,
            deleted: row.get(13)?,
        })
    }

    fn into_note(self) -> NoteSyncResult<Note> {
        let sync_status = SyncStatus::from_str(&self.sync_status).ok_or_else(|| {
            NoteSyncError::database_op(format!("Unknown sync status: {}", self.sync_status))
        })?;
        Ok(Note {
            id: uuid_from_bytes(&self.id)?,
            owner_id: self.owner_id,
            remote_id: self.remote_id,
            title: self.title,
            body: self.body,
            color: self.color,
            tags: serde_json::from_str(&self.tags)?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            version: self.version,
            server_version: self.server_version,
            sync_status,
            last_sync_at: self.last_sync_at.map(from_millis).transpose()?,
            deleted: self.deleted,
        })
    }
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Wrap the store for sharing between engines
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Create a new database connection
    pub fn new<P: AsRef<Path>>(db_path: P) -> NoteSyncResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> NoteSyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&mut self) -> NoteSyncResult<()> {
        self.conn.execute_batch(
            r#"
            -- Notes keyed by identity scope and client-generated UUID7
            CREATE TABLE IF NOT EXISTS notes (
                scope TEXT NOT NULL,
                id BLOB NOT NULL,
                owner_id TEXT,
                remote_id TEXT,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                color TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL,
                server_version INTEGER,
                sync_status TEXT NOT NULL,
                last_sync_at INTEGER,
                deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (scope, id)
            );

            CREATE INDEX IF NOT EXISTS idx_notes_status ON notes(scope, sync_status);

            -- One migration status record per identity
            CREATE TABLE IF NOT EXISTS migration_status (
                scope TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Failed-sync ledger; rows are resolved, never deleted
            CREATE TABLE IF NOT EXISTS sync_failures (
                id BLOB PRIMARY KEY,
                scope TEXT NOT NULL,
                note_id BLOB NOT NULL,
                snapshot TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_sync_failures_note ON sync_failures(scope, note_id);

            -- Conflict records with both snapshots as JSON
            CREATE TABLE IF NOT EXISTS conflicts (
                id BLOB PRIMARY KEY,
                scope TEXT NOT NULL,
                note_id BLOB NOT NULL,
                local_snapshot TEXT NOT NULL,
                remote_snapshot TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                resolution TEXT NOT NULL,
                resolved_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_conflicts_note ON conflicts(scope, note_id);

            -- Full snapshots taken before migration
            CREATE TABLE IF NOT EXISTS backups (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                note_count INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Notes
    // ========================================================================

    /// Get a note by id within a scope
    pub fn get_note(&self, scope: &str, note_id: &Uuid) -> NoteSyncResult<Option<Note>> {
        let sql = format!("SELECT {} FROM notes WHERE scope = ? AND id = ?", NOTE_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![scope, note_id.as_bytes().to_vec()], NoteRow::from_row)
            .optional()?;
        row.map(NoteRow::into_note).transpose()
    }

    /// Insert or replace a note
    pub fn put_note(&self, scope: &str, note: &Note) -> NoteSyncResult<()> {
        let tags = serde_json::to_string(&note.tags)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO notes (scope, id, owner_id, remote_id, title, body, color, tags, \
             created_at, updated_at, version, server_version, sync_status, last_sync_at, deleted) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                scope,
                note.id.as_bytes().to_vec(),
                note.owner_id,
                note.remote_id,
                note.title,
                note.body,
                note.color,
                tags,
                to_millis(&note.created_at),
                to_millis(&note.updated_at),
                note.version,
                note.server_version,
                note.sync_status.as_str(),
                note.last_sync_at.as_ref().map(to_millis),
                note.deleted,
            ],
        )?;
        Ok(())
    }

    fn query_notes(&self, sql: &str, params: impl rusqlite::Params) -> NoteSyncResult<Vec<Note>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, NoteRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(NoteRow::into_note).collect()
    }

    /// List notes of a scope, most recently updated first
    pub fn list_notes(&self, scope: &str, include_deleted: bool) -> NoteSyncResult<Vec<Note>> {
        let sql = format!(
            "SELECT {} FROM notes WHERE scope = ? {} ORDER BY updated_at DESC",
            NOTE_COLUMNS,
            if include_deleted { "" } else { "AND deleted = 0" }
        );
        self.query_notes(&sql, params![scope])
    }

    /// Notes of a scope in any of the given statuses, oldest update first
    pub fn notes_with_status(
        &self,
        scope: &str,
        statuses: &[SyncStatus],
    ) -> NoteSyncResult<Vec<Note>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM notes WHERE scope = ? AND sync_status IN ({}) ORDER BY updated_at ASC",
            NOTE_COLUMNS, placeholders
        );
        let mut values: Vec<String> = vec![scope.to_string()];
        values.extend(statuses.iter().map(|s| s.as_str().to_string()));
        self.query_notes(&sql, rusqlite::params_from_iter(values))
    }

    /// Physically remove a note. Returns true if a row was deleted.
    pub fn purge_note(&self, scope: &str, note_id: &Uuid) -> NoteSyncResult<bool> {
        let count = self.conn.execute(
            "DELETE FROM notes WHERE scope = ? AND id = ?",
            params![scope, note_id.as_bytes().to_vec()],
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // Legacy notes
    // ========================================================================

    /// Anonymous notes not yet migrated to an account
    pub fn legacy_notes(&self) -> NoteSyncResult<Vec<Note>> {
        let sql = format!(
            "SELECT {} FROM notes WHERE scope = ? AND owner_id IS NULL AND deleted = 0 \
             ORDER BY created_at ASC",
            NOTE_COLUMNS
        );
        self.query_notes(&sql, params![LEGACY_SCOPE])
    }

    /// Record that a legacy note now lives in `owner_id`'s scope.
    pub fn mark_legacy_migrated(&self, note_id: &Uuid, owner_id: &str) -> NoteSyncResult<bool> {
        let count = self.conn.execute(
            "UPDATE notes SET owner_id = ? WHERE scope = ? AND id = ?",
            params![owner_id, LEGACY_SCOPE, note_id.as_bytes().to_vec()],
        )?;
        Ok(count > 0)
    }

    /// Delete legacy rows already migrated. Returns the number removed.
    pub fn purge_migrated_legacy(&self) -> NoteSyncResult<usize> {
        let count = self.conn.execute(
            "DELETE FROM notes WHERE scope = ? AND owner_id IS NOT NULL",
            params![LEGACY_SCOPE],
        )?;
        Ok(count)
    }

    // ========================================================================
    // Migration status
    // ========================================================================

    pub fn load_migration_status(&self, scope: &str) -> NoteSyncResult<Option<MigrationStatus>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM migration_status WHERE scope = ?",
                params![scope],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    pub fn save_migration_status(&self, scope: &str, status: &MigrationStatus) -> NoteSyncResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO migration_status (scope, status, updated_at) VALUES (?, ?, ?)",
            params![scope, serde_json::to_string(status)?, to_millis(&Utc::now())],
        )?;
        Ok(())
    }

    // ========================================================================
    // Failed-sync ledger
    // ========================================================================

    /// Append a failure for a note that gave up syncing
    pub fn record_sync_failure(
        &self,
        scope: &str,
        snapshot: &Note,
        error: &str,
    ) -> NoteSyncResult<FailedSync> {
        let entry = FailedSync {
            id: Uuid::now_v7(),
            note_id: snapshot.id,
            scope: scope.to_string(),
            snapshot: snapshot.clone(),
            error: error.to_string(),
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.conn.execute(
            "INSERT INTO sync_failures (id, scope, note_id, snapshot, error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                entry.id.as_bytes().to_vec(),
                scope,
                entry.note_id.as_bytes().to_vec(),
                serde_json::to_string(&entry.snapshot)?,
                entry.error,
                to_millis(&entry.created_at),
            ],
        )?;
        Ok(entry)
    }

    pub fn list_sync_failures(
        &self,
        scope: &str,
        include_resolved: bool,
    ) -> NoteSyncResult<Vec<FailedSync>> {
        let sql = format!(
            "SELECT id, note_id, snapshot, error, created_at, resolved_at FROM sync_failures \
             WHERE scope = ? {} ORDER BY created_at ASC",
            if include_resolved { "" } else { "AND resolved_at IS NULL" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![scope], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, note_id, snapshot, error, created_at, resolved_at)| {
                Ok(FailedSync {
                    id: uuid_from_bytes(&id)?,
                    note_id: uuid_from_bytes(&note_id)?,
                    scope: scope.to_string(),
                    snapshot: serde_json::from_str(&snapshot)?,
                    error,
                    created_at: from_millis(created_at)?,
                    resolved_at: resolved_at.map(from_millis).transpose()?,
                })
            })
            .collect()
    }

    /// Mark every open ledger entry of a note as resolved
    pub fn resolve_sync_failures(&self, scope: &str, note_id: &Uuid) -> NoteSyncResult<usize> {
        let count = self.conn.execute(
            "UPDATE sync_failures SET resolved_at = ? \
             WHERE scope = ? AND note_id = ? AND resolved_at IS NULL",
            params![to_millis(&Utc::now()), scope, note_id.as_bytes().to_vec()],
        )?;
        Ok(count)
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Store a conflict. An open record for the same note is replaced so at
    /// most one unresolved record exists per note.
    pub fn save_conflict(&self, scope: &str, record: &ConflictRecord) -> NoteSyncResult<()> {
        let local = serde_json::to_string(&record.local_snapshot)?;
        let remote = serde_json::to_string(&record.remote_snapshot)?;
        let note_bytes = record.note_id.as_bytes().to_vec();

        let existing: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT id FROM conflicts WHERE scope = ? AND note_id = ? AND resolved_at IS NULL",
                params![scope, &note_bytes],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE conflicts SET local_snapshot = ?, remote_snapshot = ?, detected_at = ?, \
                     resolution = ? WHERE id = ?",
                    params![
                        local,
                        remote,
                        to_millis(&record.detected_at),
                        record.resolution.as_str(),
                        id
                    ],
                )?;
            }
            None => {
                self.conn.execute(
                    "INSERT INTO conflicts (id, scope, note_id, local_snapshot, remote_snapshot, \
                     detected_at, resolution, resolved_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        Uuid::now_v7().as_bytes().to_vec(),
                        scope,
                        note_bytes,
                        local,
                        remote,
                        to_millis(&record.detected_at),
                        record.resolution.as_str(),
                        record.resolved_at.as_ref().map(to_millis),
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn query_conflicts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> NoteSyncResult<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(note_id, local, remote, detected_at, resolution, resolved_at)| {
                let resolution = ConflictResolution::from_str(&resolution).ok_or_else(|| {
                    NoteSyncError::database_op(format!("Unknown resolution: {}", resolution))
                })?;
                let remote_snapshot: RemoteNote = serde_json::from_str(&remote)?;
                Ok(ConflictRecord {
                    note_id: uuid_from_bytes(&note_id)?,
                    local_snapshot: serde_json::from_str(&local)?,
                    remote_snapshot,
                    detected_at: from_millis(detected_at)?,
                    resolution,
                    resolved_at: resolved_at.map(from_millis).transpose()?,
                })
            })
            .collect()
    }

    /// The open conflict record of a note, if any
    pub fn get_conflict(&self, scope: &str, note_id: &Uuid) -> NoteSyncResult<Option<ConflictRecord>> {
        let mut records = self.query_conflicts(
            "SELECT note_id, local_snapshot, remote_snapshot, detected_at, resolution, resolved_at \
             FROM conflicts WHERE scope = ? AND note_id = ? AND resolved_at IS NULL",
            params![scope, note_id.as_bytes().to_vec()],
        )?;
        Ok(records.pop())
    }

    pub fn list_conflicts(
        &self,
        scope: &str,
        include_resolved: bool,
    ) -> NoteSyncResult<Vec<ConflictRecord>> {
        let sql = format!(
            "SELECT note_id, local_snapshot, remote_snapshot, detected_at, resolution, resolved_at \
             FROM conflicts WHERE scope = ? {} ORDER BY detected_at DESC",
            if include_resolved { "" } else { "AND resolved_at IS NULL" }
        );
        self.query_conflicts(&sql, params![scope])
    }

    /// Close the open conflict record of a note with a resolution.
    pub fn resolve_conflict_record(
        &self,
        scope: &str,
        note_id: &Uuid,
        resolution: ConflictResolution,
    ) -> NoteSyncResult<bool> {
        let count = self.conn.execute(
            "UPDATE conflicts SET resolution = ?, resolved_at = ? \
             WHERE scope = ? AND note_id = ? AND resolved_at IS NULL",
            params![
                resolution.as_str(),
                to_millis(&Utc::now()),
                scope,
                note_id.as_bytes().to_vec()
            ],
        )?;
        Ok(count > 0)
    }

    pub fn unresolved_conflict_count(&self, scope: &str) -> NoteSyncResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE scope = ? AND resolved_at IS NULL",
            params![scope],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Backups
    // ========================================================================

    /// Store a full JSON snapshot of `notes` and return its metadata.
    pub fn create_backup(&self, scope: &str, notes: &[Note]) -> NoteSyncResult<BackupRecord> {
        let payload = serde_json::to_string(notes)?;
        let created_at = Utc::now();
        let record = BackupRecord {
            id: format!("backup-{}", Uuid::now_v7().simple()),
            scope: scope.to_string(),
            created_at,
            note_count: notes.len(),
            checksum: checksum(&payload),
        };
        self.conn.execute(
            "INSERT INTO backups (id, scope, created_at, note_count, checksum, payload) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                scope,
                to_millis(&created_at),
                record.note_count as i64,
                record.checksum,
                payload
            ],
        )?;
        Ok(record)
    }

    /// Read a backup back and check its payload against the stored checksum.
    pub fn verify_backup(&self, backup_id: &str) -> NoteSyncResult<bool> {
        let row: Option<(String, String, i64)> = self
            .conn
            .query_row(
                "SELECT checksum, payload, note_count FROM backups WHERE id = ?",
                params![backup_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((stored, payload, note_count)) = row else {
            return Ok(false);
        };
        if checksum(&payload) != stored {
            return Ok(false);
        }
        let notes: Vec<Note> = serde_json::from_str(&payload)?;
        Ok(notes.len() as i64 == note_count)
    }

    pub fn get_backup(&self, backup_id: &str) -> NoteSyncResult<Option<BackupRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, scope, created_at, note_count, checksum FROM backups WHERE id = ?",
                params![backup_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, scope, created_at, note_count, checksum)| {
            Ok(BackupRecord {
                id,
                scope,
                created_at: from_millis(created_at)?,
                note_count: note_count as usize,
                checksum,
            })
        })
        .transpose()
    }

    pub fn list_backups(&self, scope: &str) -> NoteSyncResult<Vec<BackupRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM backups WHERE scope = ? ORDER BY created_at DESC, id DESC",
        )?;
        let ids = stmt
            .query_map(params![scope], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut backups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_backup(&id)? {
                backups.push(record);
            }
        }
        Ok(backups)
    }

    /// Notes stored in a backup
    pub fn load_backup_notes(&self, backup_id: &str) -> NoteSyncResult<Vec<Note>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM backups WHERE id = ?",
                params![backup_id],
                |row| row.get(0),
            )
            .optional()?;
        let payload =
            payload.ok_or_else(|| NoteSyncError::NotFound(format!("backup {}", backup_id)))?;
        Ok(serde_json::from_str(&payload)?)
    }
}

#[cfg(test)]
impl Database {
    /// Run raw SQL, used by tests to break the schema on purpose.
    pub(crate) fn execute_raw(&self, sql: &str) -> NoteSyncResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}
