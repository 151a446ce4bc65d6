use aegis_config::CheckpointConfig;
use aegis_core::{AegisError, ExecutionCheckpoint};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Keyed checkpoint persistence. Updates are atomic per checkpoint id.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &ExecutionCheckpoint) -> aegis_core::Result<()>;
    fn load(&self, id: Uuid) -> aegis_core::Result<Option<ExecutionCheckpoint>>;
    fn delete(&self, id: Uuid) -> aegis_core::Result<bool>;
    /// All checkpoints, newest first.
    fn list(&self) -> aegis_core::Result<Vec<ExecutionCheckpoint>>;
    /// Delete checkpoints expired at `now`; returns how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> aegis_core::Result<usize>;
}

// ── In-memory ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<Uuid, ExecutionCheckpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &ExecutionCheckpoint) -> aegis_core::Result<()> {
        self.entries.insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    fn load(&self, id: Uuid) -> aegis_core::Result<Option<ExecutionCheckpoint>> {
        Ok(self.entries.get(&id).map(|e| e.clone()))
    }

    fn delete(&self, id: Uuid) -> aegis_core::Result<bool> {
        Ok(self.entries.remove(&id).is_some())
    }

    fn list(&self) -> aegis_core::Result<Vec<ExecutionCheckpoint>> {
        let mut all: Vec<ExecutionCheckpoint> = self.entries.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> aegis_core::Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, cp| !cp.is_expired_at(now));
        Ok(before - self.entries.len())
    }
}

// ── SQLite ─────────────────────────────────────────────────────

/// Checkpoints in a single SQLite table, state stored as JSON.
pub struct SqliteCheckpointStore {
    db: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> AegisError {
    AegisError::Checkpoint(e.to_string())
}

fn ts(t: DateTime<Utc>) -> String {
    // Fixed precision so stored timestamps compare lexicographically.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database at the given path.
    pub fn open(path: &Path) -> aegis_core::Result<Self> {
        info!(?path, "opening checkpoint store");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> aegis_core::Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> aegis_core::Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_expires ON checkpoints(expires_at);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_plan ON checkpoints(plan_id);
            ",
        )
        .map_err(db_err)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn decode(raw: String) -> aegis_core::Result<ExecutionCheckpoint> {
        Ok(serde_json::from_str(&raw)?)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &ExecutionCheckpoint) -> aegis_core::Result<()> {
        let state = serde_json::to_string(checkpoint)?;
        self.db
            .lock()
            .execute(
                "INSERT OR REPLACE INTO checkpoints (id, plan_id, reason, state, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checkpoint.id.to_string(),
                    checkpoint.plan_id.to_string(),
                    checkpoint.reason,
                    state,
                    ts(checkpoint.created_at),
                    ts(checkpoint.expires_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn load(&self, id: Uuid) -> aegis_core::Result<Option<ExecutionCheckpoint>> {
        let raw: Option<String> = self
            .db
            .lock()
            .query_row(
                "SELECT state FROM checkpoints WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.map(Self::decode).transpose()
    }

    fn delete(&self, id: Uuid) -> aegis_core::Result<bool> {
        let n = self
            .db
            .lock()
            .execute("DELETE FROM checkpoints WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    fn list(&self) -> aegis_core::Result<Vec<ExecutionCheckpoint>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT state FROM checkpoints ORDER BY created_at DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(Self::decode(raw.map_err(db_err)?)?);
        }
        Ok(out)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> aegis_core::Result<usize> {
        self.db
            .lock()
            .execute(
                "DELETE FROM checkpoints WHERE expires_at <= ?1",
                params![ts(now)],
            )
            .map_err(db_err)
    }
}

// ── Manager ────────────────────────────────────────────────────

/// Creates, reads and expires checkpoints on top of a store.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    ttl_secs: u64,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub fn in_memory(ttl_secs: u64) -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()), ttl_secs)
    }

    /// Build the backend named in the config.
    pub fn from_config(config: &CheckpointConfig) -> aegis_core::Result<Self> {
        let store: Arc<dyn CheckpointStore> = match config.backend.as_str() {
            "sqlite" => Arc::new(SqliteCheckpointStore::open(&config.resolved_db_path())?),
            "memory" => Arc::new(MemoryCheckpointStore::new()),
            other => {
                return Err(AegisError::Config(format!(
                    "unknown checkpoint backend '{other}'"
                )));
            }
        };
        Ok(Self::new(store, config.ttl_secs))
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// A fresh checkpoint for `plan_id` carrying this manager's TTL.
    pub fn draft(&self, plan_id: Uuid, reason: impl Into<String>) -> ExecutionCheckpoint {
        ExecutionCheckpoint::new(plan_id, reason, self.ttl_secs)
    }

    /// Persist a checkpoint and hand it back.
    pub fn create_checkpoint(
        &self,
        checkpoint: ExecutionCheckpoint,
    ) -> aegis_core::Result<ExecutionCheckpoint> {
        self.store.save(&checkpoint)?;
        info!(
            checkpoint_id = %checkpoint.id,
            plan_id = %checkpoint.plan_id,
            completed = checkpoint.completed_steps.len(),
            reason = %checkpoint.reason,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    pub fn get_checkpoint(&self, id: Uuid) -> aegis_core::Result<Option<ExecutionCheckpoint>> {
        self.get_checkpoint_at(id, Utc::now())
    }

    /// Missing and expired checkpoints both read as `None`; expired ones are deleted.
    pub fn get_checkpoint_at(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> aegis_core::Result<Option<ExecutionCheckpoint>> {
        match self.store.load(id)? {
            Some(cp) if cp.is_expired_at(now) => {
                debug!(checkpoint_id = %id, "checkpoint expired");
                self.store.delete(id)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Newest live checkpoint for a plan.
    pub fn latest_for_plan(&self, plan_id: Uuid) -> aegis_core::Result<Option<ExecutionCheckpoint>> {
        let now = Utc::now();
        Ok(self
            .store
            .list()?
            .into_iter()
            .find(|cp| cp.plan_id == plan_id && !cp.is_expired_at(now)))
    }

    pub fn list(&self) -> aegis_core::Result<Vec<ExecutionCheckpoint>> {
        self.store.list()
    }

    pub fn delete(&self, id: Uuid) -> aegis_core::Result<bool> {
        self.store.delete(id)
    }

    pub fn purge_expired(&self) -> aegis_core::Result<usize> {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> aegis_core::Result<usize> {
        let removed = self.store.purge_expired(now)?;
        if removed > 0 {
            info!(removed, "purged expired checkpoints");
        }
        Ok(removed)
    }
}
