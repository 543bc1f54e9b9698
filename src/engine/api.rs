use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::errors::EngineError;

use super::db::DbHandle;
use super::models::{TriggerEvent, TriggerSource};
use super::orchestrator::BuildOrchestrator;
use super::ws::{WsMessage, broadcast_message};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Arc<BuildOrchestrator>,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRepoRequest {
    pub owner: String,
    pub url: String,
    pub branch: Option<String>,
}

/// Validated push notification. Signature verification and provider payload
/// parsing happen upstream; by the time a request lands here it is already a
/// trigger event.
#[derive(Deserialize)]
pub struct PushEventRequest {
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub pusher: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownRepository { .. } | EngineError::BuildNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            EngineError::DuplicateRepository { .. } => ApiError::Conflict(err.to_string()),
            EngineError::Database(e) | EngineError::Other(e) => {
                ApiError::Internal(format!("{:#}", e))
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/repos", get(list_repos).post(register_repo))
        .route("/api/repos/{owner}/{repo}/build", post(trigger_build_handler))
        .route("/api/repos/{owner}/{repo}/builds", get(list_repo_builds))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/hooks/push", post(push_hook))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Repo display name from the source URL: last path segment, `.git` shorn.
fn repo_name_from_url(url: &str) -> Option<String> {
    let name = url
        .trim()
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()?
        .to_string();
    if name.is_empty() { None } else { Some(name) }
}

fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "pressure": state.orchestrator.pressure(),
    }))
}

async fn list_repos(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let repos = state
        .db
        .call(|db| db.list_repos())
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(Json(repos))
}

/// Register a repository and kick off its first build, mirroring the manual
/// "add repo" action: the response returns as soon as the build is accepted.
async fn register_repo(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRepoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = req.owner.trim().to_string();
    let url = req.url.trim().to_string();
    if !valid_identifier(&owner) {
        return Err(ApiError::BadRequest(
            "owner must be non-empty and contain only alphanumerics, '-', '_', '.'".to_string(),
        ));
    }
    let name = repo_name_from_url(&url)
        .ok_or_else(|| ApiError::BadRequest("Could not parse repository name from url".to_string()))?;
    if !valid_identifier(&name) {
        return Err(ApiError::BadRequest(format!(
            "Repository name '{}' contains unsupported characters",
            name
        )));
    }
    let branch = req.branch.unwrap_or_else(|| "main".to_string());

    let repo = {
        let err_owner = owner.clone();
        let err_name = name.clone();
        let (owner, name, url, branch) = (owner.clone(), name.clone(), url, branch);
        state
            .db
            .call(move |db| {
                if db.get_repo(&owner, &name)?.is_some() {
                    return Ok(None);
                }
                db.create_repo(&owner, &name, &url, &branch).map(Some)
            })
            .await
            .map_err(|e| ApiError::Internal(format!("{:#}", e)))?
            .ok_or_else(|| {
                ApiError::from(EngineError::DuplicateRepository {
                    owner: err_owner,
                    repo: err_name,
                })
            })?
    };

    broadcast_message(
        &state.ws_tx,
        &WsMessage::RepoRegistered {
            owner: repo.owner.clone(),
            name: repo.name.clone(),
        },
    );

    // Initial build, same path as a manual trigger. Registration already
    // succeeded, so a trigger error only loses the kick-off, not the repo.
    let initial_build_id = match state
        .orchestrator
        .trigger_build(TriggerEvent {
            owner: repo.owner.clone(),
            repo: repo.name.clone(),
            branch: None,
            requested_by: "registration".to_string(),
            source: TriggerSource::Manual,
        })
        .await
    {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(
                repo = %format!("{}/{}", repo.owner, repo.name),
                "Failed to trigger initial build: {}",
                e
            );
            None
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "repo": repo,
            "initial_build_id": initial_build_id,
        })),
    ))
}

async fn trigger_build_handler(
    State(state): State<SharedState>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let build_id = state
        .orchestrator
        .trigger_build(TriggerEvent {
            owner,
            repo,
            branch: None,
            requested_by: "api".to_string(),
            source: TriggerSource::Manual,
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"build_id": build_id})),
    ))
}

async fn push_hook(
    State(state): State<SharedState>,
    Json(event): Json<PushEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let build_id = state
        .orchestrator
        .trigger_build(TriggerEvent {
            owner: event.owner,
            repo: event.repo,
            branch: event.branch,
            requested_by: event.pusher.unwrap_or_else(|| "webhook".to_string()),
            source: TriggerSource::Webhook,
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"build_id": build_id})),
    ))
}

async fn list_repo_builds(
    State(state): State<SharedState>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let builds = state
        .db
        .call(move |db| {
            let Some(record) = db.get_repo(&owner, &repo)? else {
                return Ok(None);
            };
            db.list_builds(record.id).map(Some)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?
        .ok_or_else(|| ApiError::NotFound("Repository not found".to_string()))?;
    Ok(Json(builds))
}

async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .db
        .call(move |db| db.get_build(id))
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?
        .ok_or_else(|| ApiError::from(EngineError::BuildNotFound { id }))?;
    Ok(Json(build))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::db::EngineDb;
    use crate::engine::workspace::WorkspaceManager;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> SharedState {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let (ws_tx, _) = broadcast::channel(16);
        let orchestrator = Arc::new(BuildOrchestrator::new(
            db.clone(),
            Arc::new(WorkspaceManager::new(dir.join("workspaces"))),
            ws_tx.clone(),
            &EngineConfig::default(),
        ));
        Arc::new(AppState {
            db,
            orchestrator,
            ws_tx,
        })
    }

    fn test_router(dir: &std::path::Path) -> Router {
        api_router().with_state(test_state(dir))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_pool_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pressure"]["capacity"], 2);
    }

    #[tokio::test]
    async fn register_creates_repo_and_accepts_initial_build() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = api_router().with_state(Arc::clone(&state));

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/repos")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "owner": "alice",
                            "url": "/srv/git/alice/widget.git"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["repo"]["name"], "widget");
        assert_eq!(body["repo"]["default_branch"], "main");
        assert!(body["initial_build_id"].is_i64());

        // Let the (failing) initial build settle before the tempdir goes away.
        state.orchestrator.wait_for_idle().await;
    }

    #[tokio::test]
    async fn register_duplicate_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let payload = serde_json::json!({
            "owner": "alice",
            "url": "/srv/git/alice/widget.git"
        })
        .to_string();

        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let app = api_router().with_state(Arc::clone(&state));
            let resp = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/repos")
                        .header("content-type", "application/json")
                        .body(Body::from(payload.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), expected);
        }
        state.orchestrator.wait_for_idle().await;
    }

    #[tokio::test]
    async fn register_rejects_bad_owner() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/repos")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"owner": "../evil", "url": "https://x/y.git"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_on_unknown_repo_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/repos/nobody/nothing/build")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn push_hook_on_unknown_repo_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/hooks/push")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"owner": "nobody", "repo": "nothing"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_build_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/builds/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn repo_name_parsing_handles_common_shapes() {
        assert_eq!(
            repo_name_from_url("https://github.com/alice/widget.git"),
            Some("widget".to_string())
        );
        assert_eq!(
            repo_name_from_url("https://github.com/alice/widget/"),
            Some("widget".to_string())
        );
        assert_eq!(repo_name_from_url(""), None);
    }
}
