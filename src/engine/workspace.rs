//! Working-directory management.
//!
//! Maps a repository+branch key to a dedicated checkout directory and
//! arbitrates exclusive access to it. Two triggers for the same key must
//! never touch the directory at once; the per-key mutex serializes them in
//! arrival order (tokio mutexes are FIFO-fair), while distinct keys proceed
//! independently. Lock entries are created lazily and never removed; the key
//! space is bounded by distinct repo×branch pairs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::models::WorkspaceKey;

pub struct WorkspaceManager {
    root: PathBuf,
    locks: Mutex<HashMap<WorkspaceKey, Arc<AsyncMutex<()>>>>,
}

/// Exclusive use of one workspace directory. The directory exists for the
/// lease's lifetime; dropping the lease releases the key on every exit path,
/// success or failure.
pub struct WorkspaceLease {
    path: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl WorkspaceLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire exclusive use of the workspace for `key`, creating the
    /// directory on first use. Blocks (async) until any prior holder of the
    /// same key releases; callers on different keys are unaffected.
    pub async fn acquire(&self, key: &WorkspaceKey) -> Result<WorkspaceLease> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|e| anyhow::anyhow!("Workspace lock table poisoned: {}", e))?;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;

        let path = self.root.join(key.directory_name());
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create workspace directory {}", path.display()))?;

        Ok(WorkspaceLease { path, _guard: guard })
    }
}
