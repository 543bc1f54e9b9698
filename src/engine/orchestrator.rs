//! Build orchestration.
//!
//! The single entry point for trigger events, manual or webhook. Accepting a
//! trigger performs the two-phase record write (`pending`, then `running`)
//! synchronously, so the caller returns with a build id that observers can
//! already see; execution itself runs in a spawned task gated by a bounded,
//! fair worker pool and the per-workspace lease. Every spawned task handle
//! is retained until completion, so a crashed build cannot vanish without a
//! terminal status being written.
//!
//! Failure policy: anything in the `BuildFailure` taxonomy finalizes the
//! record as `fail` with the captured output; any other error reaching the
//! top of the task is an internal fault, finalized as `error` and logged at
//! error level as an operator signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, broadcast};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::errors::{BuildFailure, EngineError};

use super::db::DbHandle;
use super::detect::detect;
use super::exec::CommandRunner;
use super::models::{BuildStatus, TriggerEvent, WorkspaceKey};
use super::sync::Synchronizer;
use super::workspace::WorkspaceManager;
use super::ws::{WsMessage, broadcast_message};

/// Worker-pool saturation snapshot, exposed via `/health` so the API layer
/// can report backpressure.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolPressure {
    /// Builds accepted but not yet executing (waiting for a permit or a
    /// workspace lease).
    pub queued: usize,
    pub running: usize,
    pub capacity: usize,
}

/// Shared per-build machinery, cloned into each spawned build task.
#[derive(Clone)]
struct EngineCore {
    db: DbHandle,
    workspaces: Arc<WorkspaceManager>,
    synchronizer: Synchronizer,
    runner: CommandRunner,
    ws_tx: broadcast::Sender<String>,
    command_timeout: Duration,
}

pub struct BuildOrchestrator {
    core: EngineCore,
    pool: Arc<Semaphore>,
    capacity: usize,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    /// Handles of in-flight build tasks, keyed by build id.
    tasks: Arc<AsyncMutex<HashMap<i64, JoinHandle<()>>>>,
}

impl BuildOrchestrator {
    pub fn new(
        db: DbHandle,
        workspaces: Arc<WorkspaceManager>,
        ws_tx: broadcast::Sender<String>,
        config: &EngineConfig,
    ) -> Self {
        let runner = CommandRunner::new(config.output_cap_bytes);
        let command_timeout = Duration::from_secs(config.command_timeout_secs);
        Self {
            core: EngineCore {
                synchronizer: Synchronizer::new(runner.clone(), command_timeout),
                runner,
                db,
                workspaces,
                ws_tx,
                command_timeout,
            },
            pool: Arc::new(Semaphore::new(config.max_concurrent_builds)),
            capacity: config.max_concurrent_builds,
            queued: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            tasks: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Accept a trigger: validate the repository, write the build record in
    /// `pending` then `running`, spawn the execution task, and return the
    /// build id. Never waits for the build itself.
    pub async fn trigger_build(&self, event: TriggerEvent) -> Result<i64, EngineError> {
        let (owner, name) = (event.owner.clone(), event.repo.clone());
        let repo = self
            .core
            .db
            .call(move |db| db.get_repo(&owner, &name))
            .await
            .map_err(EngineError::Database)?
            .ok_or_else(|| EngineError::UnknownRepository {
                owner: event.owner.clone(),
                repo: event.repo.clone(),
            })?;

        // Snapshot the branch now: the trigger's override wins, otherwise
        // the registry default as of this instant. Later registry edits do
        // not touch this build.
        let branch = event
            .branch
            .clone()
            .unwrap_or_else(|| repo.default_branch.clone());

        let insert_repo = repo.clone();
        let insert_branch = branch.clone();
        let build = self
            .core
            .db
            .call(move |db| db.create_build(&insert_repo, &insert_branch))
            .await
            .map_err(EngineError::Database)?;
        let build_id = build.id;
        let build = self
            .core
            .db
            .call(move |db| db.mark_build_running(build_id))
            .await
            .map_err(EngineError::Database)?;

        let repo_label = format!("{}/{}", repo.owner, repo.name);
        tracing::info!(
            build_id,
            repo = %repo_label,
            branch = %branch,
            source = event.source.as_str(),
            "build accepted"
        );
        broadcast_message(&self.core.ws_tx, &WsMessage::BuildStarted { build });

        let key = WorkspaceKey::new(&repo.owner, &repo.name, &branch);
        let url = repo.url.clone();
        let header = format!(
            "Build triggered by {} via {}\n",
            event.requested_by,
            event.source.as_str()
        );

        let core = self.core.clone();
        let pool = Arc::clone(&self.pool);
        let queued = Arc::clone(&self.queued);
        let running = Arc::clone(&self.running);
        let tasks = Arc::clone(&self.tasks);

        let handle = tokio::spawn(async move {
            core.append_log(build_id, header).await;

            queued.fetch_add(1, Ordering::SeqCst);
            let permit = pool.acquire_owned().await;
            queued.fetch_sub(1, Ordering::SeqCst);

            match permit {
                Ok(_permit) => {
                    running.fetch_add(1, Ordering::SeqCst);
                    let outcome = core.execute(build_id, &key, &url).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if let Err(fault) = outcome {
                        tracing::error!(
                            build_id,
                            error = %format!("{:#}", fault),
                            "internal fault while executing build"
                        );
                        core.finalize(
                            build_id,
                            BuildStatus::Error,
                            format!("INTERNAL ERROR: {:#}\n", fault),
                            None,
                        )
                        .await;
                    }
                }
                Err(e) => {
                    core.finalize(
                        build_id,
                        BuildStatus::Error,
                        format!("INTERNAL ERROR: worker pool closed: {}\n", e),
                        None,
                    )
                    .await;
                }
            }

            tasks.lock().await.remove(&build_id);
        });
        self.tasks.lock().await.insert(build_id, handle);

        Ok(build_id)
    }

    /// Worker-pool saturation for the health endpoint.
    pub fn pressure(&self) -> PoolPressure {
        PoolPressure {
            queued: self.queued.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }

    /// Await completion of every tracked build task. Used by tests and by
    /// graceful shutdown so accepted builds still reach a terminal state.
    pub async fn wait_for_idle(&self) {
        loop {
            let handle = {
                let mut tasks = self.tasks.lock().await;
                let id = tasks.keys().next().copied();
                id.and_then(|id| tasks.remove(&id))
            };
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}

impl EngineCore {
    /// Run one accepted build to a terminal state. Returns `Err` only for
    /// internal faults; build-logic failures are finalized as `fail` inside.
    async fn execute(&self, build_id: i64, key: &WorkspaceKey, url: &str) -> Result<()> {
        let lease = self.workspaces.acquire(key).await?;

        let report = match self.synchronizer.sync(lease.path(), url, &key.branch).await {
            Ok(report) => report,
            Err(failure) => {
                self.finalize(build_id, BuildStatus::Fail, failure_chunk(&failure), None)
                    .await;
                return Ok(());
            }
        };
        let commit = report.commit.clone();
        self.append_log(build_id, report.transcript).await;

        let detection = detect(lease.path());
        self.append_log(build_id, detection.transcript).await;

        // Install strictly precedes build, both under the same lease.
        let steps = [detection.plan.install, detection.plan.build];
        for spec in steps.into_iter().flatten() {
            self.append_log(build_id, format!("Running {}\n", spec)).await;
            match self.runner.run(&spec, lease.path(), self.command_timeout).await {
                Ok(out) => self.append_log(build_id, out.output).await,
                Err(failure) => {
                    self.finalize(build_id, BuildStatus::Fail, failure_chunk(&failure), None)
                        .await;
                    return Ok(());
                }
            }
        }

        self.finalize(
            build_id,
            BuildStatus::Success,
            format!("Build succeeded at {}\n", commit),
            Some(commit),
        )
        .await;
        Ok(())
    }

    async fn append_log(&self, build_id: i64, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        if let Err(e) = self
            .db
            .call(move |db| db.append_build_logs(build_id, &chunk))
            .await
        {
            tracing::warn!(build_id, "Failed to append build logs: {:#}", e);
        }
    }

    async fn finalize(
        &self,
        build_id: i64,
        status: BuildStatus,
        chunk: String,
        commit: Option<String>,
    ) {
        let result = self
            .db
            .call(move |db| db.finalize_build(build_id, status, &chunk, commit.as_deref()))
            .await;
        match result {
            Ok(build) => {
                tracing::info!(build_id, status = status.as_str(), "build finalized");
                broadcast_message(&self.ws_tx, &WsMessage::BuildFinished { build });
            }
            Err(e) => tracing::warn!(build_id, "Failed to finalize build: {:#}", e),
        }
    }
}

/// Captured output plus a trailing error line, the shape build logs use for
/// every failed step.
fn failure_chunk(failure: &BuildFailure) -> String {
    let mut chunk = failure.output().to_string();
    if !chunk.is_empty() && !chunk.ends_with('\n') {
        chunk.push('\n');
    }
    chunk.push_str(&format!("ERROR: {}\n", failure));
    chunk
}
