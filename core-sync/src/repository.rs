//! # Repository State
//!
//! Per-repository record of what was last stored, used for incremental
//! diffing.
//!
//! ## Overview
//!
//! [`RepositoryState`] maps every synced file (repository-relative path) to
//! the content hash and chunk ids that were stored for it, plus the total
//! chunk count and the last successful sync time. It is created on the first
//! sync of a repository and updated by every later one; only the sync job for
//! that repository mutates it.
//!
//! Persistence goes through [`RepositoryStateStore`]:
//! - [`InMemoryRepositoryStateStore`] for tests and ephemeral hosts
//! - [`SqliteRepositoryStateStore`] keeps one row per repository with the file
//!   map serialized as JSON

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::{Result, SyncError};

/// SHA-256 of `data` as lowercase hex
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// State
// ============================================================================

/// What was stored for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub hash: String,
    /// Ids of the chunks stored for the file, in chunk order
    pub chunk_ids: Vec<String>,
    pub size: u64,
    pub synced_at: DateTime<Utc>,
}

/// Last-known state of one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryState {
    pub name: String,
    pub root: PathBuf,
    pub files: BTreeMap<String, FileRecord>,
    pub total_chunks: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl RepositoryState {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            files: BTreeMap::new(),
            total_chunks: 0,
            last_sync_time: None,
        }
    }

    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(|r| r.hash.as_str())
    }

    /// Insert or replace the record for `path`
    pub fn upsert_file(&mut self, path: impl Into<String>, record: FileRecord) {
        self.files.insert(path.into(), record);
        self.recount();
    }

    pub fn remove_file(&mut self, path: &str) -> Option<FileRecord> {
        let removed = self.files.remove(path);
        self.recount();
        removed
    }

    /// Advance `last_sync_time`; an older timestamp is ignored
    pub fn record_sync(&mut self, at: DateTime<Utc>) {
        self.last_sync_time = Some(match self.last_sync_time {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }

    pub fn summary(&self) -> RepositorySummary {
        RepositorySummary {
            name: self.name.clone(),
            root: self.root.clone(),
            files_tracked: self.files.len() as u64,
            total_chunks: self.total_chunks,
            last_sync_time: self.last_sync_time,
        }
    }

    fn recount(&mut self) {
        self.total_chunks = self.files.values().map(|r| r.chunk_ids.len() as u64).sum();
    }
}

/// Listing entry for a known repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub name: String,
    pub root: PathBuf,
    pub files_tracked: u64,
    pub total_chunks: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Persistence for [`RepositoryState`]
#[async_trait]
pub trait RepositoryStateStore: Send + Sync {
    /// Load the state of `name`
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read
    async fn load(&self, name: &str) -> Result<Option<RepositoryState>>;

    /// Insert or replace the state of `state.name`.
    ///
    /// `last_sync_time` never moves backwards, even if `state` carries an
    /// older value than the stored one.
    async fn save(&self, state: &RepositoryState) -> Result<()>;

    /// Summaries of every known repository, ordered by name
    async fn list(&self) -> Result<Vec<RepositorySummary>>;

    /// Forget `name`; returns whether it existed
    async fn remove(&self, name: &str) -> Result<bool>;
}

// ============================================================================
// In-memory Implementation
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryRepositoryStateStore {
    states: Mutex<HashMap<String, RepositoryState>>,
}

impl InMemoryRepositoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<String, RepositoryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RepositoryStateStore for InMemoryRepositoryStateStore {
    async fn load(&self, name: &str) -> Result<Option<RepositoryState>> {
        Ok(self.states().get(name).cloned())
    }

    async fn save(&self, state: &RepositoryState) -> Result<()> {
        let mut states = self.states();
        let mut next = state.clone();
        if let Some(previous) = states.get(&state.name).and_then(|s| s.last_sync_time) {
            next.record_sync(previous);
        }
        states.insert(next.name.clone(), next);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RepositorySummary>> {
        let mut summaries: Vec<_> = self.states().values().map(RepositoryState::summary).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.states().remove(name).is_some())
    }
}

// ============================================================================
// SQLite Implementation
// ============================================================================

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS repository_state (
        name TEXT PRIMARY KEY NOT NULL,
        root TEXT NOT NULL,
        files TEXT NOT NULL,
        total_chunks INTEGER NOT NULL DEFAULT 0,
        last_sync_time INTEGER,
        updated_at INTEGER NOT NULL
    )
"#;

/// SQLite implementation of [`RepositoryStateStore`]
pub struct SqliteRepositoryStateStore {
    pool: SqlitePool,
}

/// Database row representation of a repository state
#[derive(Debug, FromRow)]
struct RepositoryStateRow {
    name: String,
    root: String,
    files: String,
    total_chunks: i64,
    last_sync_time: Option<i64>,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    name: String,
    root: String,
    files_tracked: i64,
    total_chunks: i64,
    last_sync_time: Option<i64>,
}

impl SqliteRepositoryStateStore {
    /// Wrap an existing pool, creating the table if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (or create) the database file at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::State(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        info!("Opening repository state database at {}", path.display());
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    /// Private in-memory database (single connection, so every query sees it)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl TryFrom<RepositoryStateRow> for RepositoryState {
    type Error = SyncError;

    fn try_from(row: RepositoryStateRow) -> Result<Self> {
        let files: BTreeMap<String, FileRecord> = serde_json::from_str(&row.files)?;
        Ok(RepositoryState {
            name: row.name,
            root: PathBuf::from(row.root),
            files,
            total_chunks: row.total_chunks.max(0) as u64,
            last_sync_time: row.last_sync_time.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[async_trait]
impl RepositoryStateStore for SqliteRepositoryStateStore {
    async fn load(&self, name: &str) -> Result<Option<RepositoryState>> {
        let row = sqlx::query_as::<_, RepositoryStateRow>(
            "SELECT name, root, files, total_chunks, last_sync_time FROM repository_state WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RepositoryState::try_from).transpose()
    }

    async fn save(&self, state: &RepositoryState) -> Result<()> {
        let files = serde_json::to_string(&state.files)?;
        sqlx::query(
            r#"
            INSERT INTO repository_state (name, root, files, total_chunks, last_sync_time, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                root = excluded.root,
                files = excluded.files,
                total_chunks = excluded.total_chunks,
                last_sync_time = CASE
                    WHEN repository_state.last_sync_time IS NULL THEN excluded.last_sync_time
                    WHEN excluded.last_sync_time IS NULL THEN repository_state.last_sync_time
                    ELSE MAX(repository_state.last_sync_time, excluded.last_sync_time)
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.name)
        .bind(state.root.to_string_lossy().to_string())
        .bind(files)
        .bind(state.total_chunks as i64)
        .bind(state.last_sync_time.map(|t| t.timestamp_millis()))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved state of {} ({} files, {} chunks)",
            state.name,
            state.files.len(),
            state.total_chunks
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RepositorySummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT name, root,
                   (SELECT COUNT(*) FROM json_each(repository_state.files)) AS files_tracked,
                   total_chunks, last_sync_time
            FROM repository_state
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RepositorySummary {
                name: row.name,
                root: PathBuf::from(row.root),
                files_tracked: row.files_tracked.max(0) as u64,
                total_chunks: row.total_chunks.max(0) as u64,
                last_sync_time: row.last_sync_time.and_then(DateTime::from_timestamp_millis),
            })
            .collect())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM repository_state WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(hash: &str, chunks: usize) -> FileRecord {
        FileRecord {
            hash: hash.to_string(),
            chunk_ids: (0..chunks).map(|i| format!("{}-{}", hash, i)).collect(),
            size: 10,
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_total_chunks_follows_files() {
        let mut state = RepositoryState::new("alpha", "/repo");
        state.upsert_file("a.rs", record("h1", 3));
        state.upsert_file("b.rs", record("h2", 2));
        assert_eq!(state.total_chunks, 5);

        state.upsert_file("a.rs", record("h3", 1));
        assert_eq!(state.total_chunks, 3);

        state.remove_file("b.rs");
        assert_eq!(state.total_chunks, 1);
        assert_eq!(state.hash_of("a.rs"), Some("h3"));
    }

    #[test]
    fn test_last_sync_time_is_monotonic() {
        let mut state = RepositoryState::new("alpha", "/repo");
        let now = Utc::now();
        state.record_sync(now);
        state.record_sync(now - Duration::seconds(60));
        assert_eq!(state.last_sync_time, Some(now));
    }

    #[tokio::test]
    async fn test_in_memory_save_keeps_newer_sync_time() {
        let store = InMemoryRepositoryStateStore::new();
        let now = Utc::now();

        let mut state = RepositoryState::new("alpha", "/repo");
        state.record_sync(now);
        store.save(&state).await.unwrap();

        let mut stale = RepositoryState::new("alpha", "/repo");
        stale.record_sync(now - Duration::seconds(5));
        store.save(&stale).await.unwrap();

        let loaded = store.load("alpha").await.unwrap().unwrap();
        assert_eq!(loaded.last_sync_time, Some(now));
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_and_listing() {
        let store = SqliteRepositoryStateStore::in_memory().await.unwrap();
        assert!(store.load("alpha").await.unwrap().is_none());

        let mut alpha = RepositoryState::new("alpha", "/repos/alpha");
        alpha.upsert_file("src/lib.rs", record("h1", 2));
        alpha.upsert_file("README.md", record("h2", 1));
        alpha.record_sync(Utc::now());
        store.save(&alpha).await.unwrap();
        store.save(&RepositoryState::new("beta", "/repos/beta")).await.unwrap();

        let loaded = store.load("alpha").await.unwrap().unwrap();
        assert_eq!(loaded.files, alpha.files);
        assert_eq!(loaded.total_chunks, 3);
        assert_eq!(
            loaded.last_sync_time.map(|t| t.timestamp_millis()),
            alpha.last_sync_time.map(|t| t.timestamp_millis())
        );

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "alpha");
        assert_eq!(listed[0].files_tracked, 2);
        assert_eq!(listed[1].last_sync_time, None);

        assert!(store.remove("beta").await.unwrap());
        assert!(!store.remove("beta").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_sync_time_never_regresses() {
        let store = SqliteRepositoryStateStore::in_memory().await.unwrap();
        let now = Utc::now();

        let mut state = RepositoryState::new("alpha", "/repo");
        state.record_sync(now);
        store.save(&state).await.unwrap();

        state.last_sync_time = Some(now - Duration::hours(1));
        store.save(&state).await.unwrap();

        let loaded = store.load("alpha").await.unwrap().unwrap();
        assert_eq!(
            loaded.last_sync_time.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }
}
