use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; never call this from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct EngineDb {
    conn: Connection,
}

/// Row timestamps, UTC, in SQLite's `datetime('now')` shape so rows written
/// by hand and rows written by the engine sort together.
fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(owner, name)
                );

                CREATE TABLE IF NOT EXISTS builds (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                    owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    commit_sha TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    logs TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    finished_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_builds_repo ON builds(repo_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Repository registry ───────────────────────────────────────────

    pub fn create_repo(
        &self,
        owner: &str,
        name: &str,
        url: &str,
        default_branch: &str,
    ) -> Result<Repository> {
        self.conn
            .execute(
                "INSERT INTO repos (owner, name, url, default_branch, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![owner, name, url, default_branch, now_utc()],
            )
            .context("Failed to insert repo")?;
        let id = self.conn.last_insert_rowid();
        self.get_repo_by_id(id)?
            .context("Repo not found after insert")
    }

    pub fn get_repo(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                "SELECT id, owner, name, url, default_branch, created_at
                 FROM repos WHERE owner = ?1 AND name = ?2",
                params![owner, name],
                Self::repo_from_row,
            )
            .optional()
            .context("Failed to query repo")
    }

    pub fn get_repo_by_id(&self, id: i64) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                "SELECT id, owner, name, url, default_branch, created_at
                 FROM repos WHERE id = ?1",
                params![id],
                Self::repo_from_row,
            )
            .optional()
            .context("Failed to query repo by id")
    }

    pub fn list_repos(&self) -> Result<Vec<Repository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner, name, url, default_branch, created_at
                 FROM repos ORDER BY owner, name",
            )
            .context("Failed to prepare list_repos")?;
        let rows = stmt
            .query_map([], Self::repo_from_row)
            .context("Failed to query repos")?;
        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("Failed to read repo row")?);
        }
        Ok(repos)
    }

    /// Change the default branch used by future triggers. Builds already in
    /// flight keep the branch snapshotted into their record.
    pub fn update_repo_branch(&self, id: i64, default_branch: &str) -> Result<Repository> {
        let changed = self
            .conn
            .execute(
                "UPDATE repos SET default_branch = ?2 WHERE id = ?1",
                params![id, default_branch],
            )
            .context("Failed to update repo branch")?;
        if changed == 0 {
            anyhow::bail!("Repo {} not found", id);
        }
        self.get_repo_by_id(id)?
            .context("Repo not found after branch update")
    }

    fn repo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
        Ok(Repository {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            url: row.get(3)?,
            default_branch: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    // ── Build history ─────────────────────────────────────────────────

    /// Insert a new build in `pending`. The first half of the two-phase
    /// acceptance write; `mark_build_running` is the second.
    pub fn create_build(&self, repo: &Repository, branch: &str) -> Result<Build> {
        self.conn
            .execute(
                "INSERT INTO builds (repo_id, owner, repo_name, branch, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![repo.id, repo.owner, repo.name, branch, now_utc()],
            )
            .context("Failed to insert build")?;
        let id = self.conn.last_insert_rowid();
        self.get_build(id)?.context("Build not found after insert")
    }

    /// Transition `pending -> running`. Guarded so a record that somehow
    /// left `pending` is never clobbered.
    pub fn mark_build_running(&self, id: i64) -> Result<Build> {
        let changed = self
            .conn
            .execute(
                "UPDATE builds SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .context("Failed to mark build running")?;
        if changed == 0 {
            anyhow::bail!("Build {} is not pending", id);
        }
        self.get_build(id)?
            .context("Build not found after running transition")
    }

    /// Append a log chunk to a non-terminal build. Appends to terminal
    /// builds are dropped: terminal records are read-only history.
    pub fn append_build_logs(&self, id: i64, chunk: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builds SET logs = logs || ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, chunk],
            )
            .context("Failed to append build logs")?;
        Ok(())
    }

    /// Transition a build into a terminal state, appending the final log
    /// chunk and stamping `finished_at`. Compare-and-set on the current
    /// status: a record already terminal is left untouched and reported as
    /// an error so a slow finalize can never revert observed history.
    pub fn finalize_build(
        &self,
        id: i64,
        status: BuildStatus,
        logs_chunk: &str,
        commit_sha: Option<&str>,
    ) -> Result<Build> {
        if !status.is_terminal() {
            anyhow::bail!("finalize_build called with non-terminal status {}", status.as_str());
        }
        let changed = self
            .conn
            .execute(
                "UPDATE builds
                 SET status = ?2,
                     logs = logs || ?3,
                     commit_sha = COALESCE(?4, commit_sha),
                     finished_at = ?5
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, status.as_str(), logs_chunk, commit_sha, now_utc()],
            )
            .context("Failed to finalize build")?;
        if changed == 0 {
            anyhow::bail!("Build {} is already terminal", id);
        }
        self.get_build(id)?
            .context("Build not found after finalize")
    }

    pub fn get_build(&self, id: i64) -> Result<Option<Build>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, repo_id, owner, repo_name, branch, commit_sha, status, logs, created_at, finished_at
                 FROM builds WHERE id = ?1",
                params![id],
                Self::build_row,
            )
            .optional()
            .context("Failed to query build")?;
        row.map(BuildRow::into_build).transpose()
    }

    /// Build history for a repo, newest first.
    pub fn list_builds(&self, repo_id: i64) -> Result<Vec<Build>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repo_id, owner, repo_name, branch, commit_sha, status, logs, created_at, finished_at
                 FROM builds WHERE repo_id = ?1 ORDER BY id DESC",
            )
            .context("Failed to prepare list_builds")?;
        let rows = stmt
            .query_map(params![repo_id], Self::build_row)
            .context("Failed to query builds")?;
        let mut builds = Vec::new();
        for row in rows {
            builds.push(row.context("Failed to read build row")?.into_build()?);
        }
        Ok(builds)
    }

    fn build_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildRow> {
        Ok(BuildRow {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            owner: row.get(2)?,
            repo_name: row.get(3)?,
            branch: row.get(4)?,
            commit_sha: row.get(5)?,
            status: row.get(6)?,
            logs: row.get(7)?,
            created_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading builds from SQLite before converting
/// the status string into the typed enum.
struct BuildRow {
    id: i64,
    repo_id: i64,
    owner: String,
    repo_name: String,
    branch: String,
    commit_sha: Option<String>,
    status: String,
    logs: String,
    created_at: String,
    finished_at: Option<String>,
}

impl BuildRow {
    fn into_build(self) -> Result<Build> {
        let status = BuildStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse build status")?;
        Ok(Build {
            id: self.id,
            repo_id: self.repo_id,
            owner: self.owner,
            repo_name: self.repo_name,
            branch: self.branch,
            commit_sha: self.commit_sha,
            status,
            logs: self.logs,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}
