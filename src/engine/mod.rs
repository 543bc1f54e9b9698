//! Build execution engine.
//!
//! ## Overview
//!
//! The engine takes a registered repository and, on every trigger (manual
//! click or push hook), synchronizes its source into a dedicated workspace,
//! detects a build procedure, runs it, and appends the outcome to a
//! strictly-ordered build history. Triggers for the same repo+branch queue
//! FIFO behind a per-workspace lock; triggers for different repos run in
//! parallel up to a bounded worker pool.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, graceful shutdown)   │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)       │
//! └──────────┘ WebSocket│         │                                      │
//!                       │         │ BuildOrchestrator::trigger_build()   │
//!                       │         v                                      │
//!                       │  orchestrator.rs  (worker pool, task handles)  │
//!                       │         │                                      │
//!                       │         │ WorkspaceManager::acquire()          │
//!                       │         v                                      │
//!                       │  workspace.rs  (keyed lock table, leases)      │
//!                       │         │                                      │
//!                       │         │ Synchronizer::sync()                 │
//!                       │         v                                      │
//!                       │  sync.rs ── detect.rs ── exec.rs               │
//!                       │  (git fetch)  (manifest)   (bounded capture)   │
//!                       └────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                            |
//! |----------|-----------------------------------------------------------|
//! | `models` | Shared types: `Repository`, `Build`, `TriggerEvent`, ...  |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)       |
//! | `ws`     | `WsMessage` enum + `broadcast_message()` helper           |
//!
//! ## Typical Trigger Flow
//!
//! 1. `POST /api/repos/{owner}/{repo}/build` → `api::trigger_build_handler()`
//! 2. The orchestrator validates the repo, writes the build record twice
//!    (`pending`, then `running`) and returns the build id immediately.
//! 3. A spawned task waits for a worker-pool permit, then for the workspace
//!    lease of `(owner, repo, branch)`.
//! 4. `sync.rs` clones or fetch+resets the checkout and resolves the commit.
//! 5. `detect.rs` inspects `package.json`; a declared build script yields an
//!    install step and a build step, otherwise the build is a no-op success.
//! 6. `exec.rs` runs each step with bounded output capture and a timeout.
//! 7. The record is finalized (`success`/`fail`/`error`) with concatenated
//!    logs and the resolved commit; every transition is broadcast over `/ws`.

pub mod api;
pub mod db;
pub mod detect;
pub mod exec;
pub mod models;
pub mod orchestrator;
pub mod server;
pub mod sync;
pub mod workspace;
pub mod ws;
