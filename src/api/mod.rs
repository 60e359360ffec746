//! HTTP surface: task creation, status, and live event streams.

pub mod stream;

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{Principal, PrincipalResolver, authorize_start, authorize_view};
use crate::error::TaskError;
use crate::tasks::{TaskId, TaskKind, TaskRunner, TaskScope, TaskSnapshot, TaskStore};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<TaskRunner>,
    pub store: Arc<TaskStore>,
    pub principals: Arc<dyn PrincipalResolver>,
}

impl AppState {
    pub fn new(runner: Arc<TaskRunner>, principals: Arc<dyn PrincipalResolver>) -> Self {
        let store = Arc::clone(runner.store());
        Self {
            runner,
            store,
            principals,
        }
    }
}

/// Build the Axum router for the task endpoints.
pub fn task_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/{scope}/tasks/{task_name}", post(start_task))
        .route("/tasks/{task_id}", get(get_task))
        .route("/tasks/{task_id}/stream", get(stream::stream_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::UnsupportedTask(_)
            | Self::MissingScope
            | Self::InvalidOptions { .. }
            | Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::AccessDenied | Self::InsufficientRole => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoExecutor(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Duplicate(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.code() }))).into_response()
    }
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Principal, TaskError> {
    state
        .principals
        .resolve(headers)
        .await
        .ok_or(TaskError::Unauthenticated)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "admin-tasks",
        "tasks": state.store.len(),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    task_id: TaskId,
}

/// An empty body means "no options".
fn parse_options(task_name: &str, body: &[u8]) -> Result<Value, TaskError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| TaskError::InvalidOptions {
        task: task_name.to_string(),
        reason: e.to_string(),
    })
}

async fn start_task(
    State(state): State<AppState>,
    Path((scope, task_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StartResponse>, TaskError> {
    let principal = authenticate(&state, &headers).await?;
    let scope = TaskScope::from_segment(&scope)?;
    authorize_start(&principal, &scope)?;

    TaskKind::parse(&task_name)?;
    let options = parse_options(&task_name, &body)?;

    let task_id = state
        .runner
        .start(&task_name, scope.clone(), options, &principal.id)?;

    info!(
        task_id = %task_id,
        task = %task_name,
        scope = %scope,
        requested_by = %principal.id,
        "Task started via API"
    );
    Ok(Json(StartResponse { task_id }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TaskSnapshot>, TaskError> {
    let task_id: TaskId = task_id.parse()?;
    let principal = authenticate(&state, &headers).await?;
    let entry = state
        .store
        .get(&task_id)
        .ok_or(TaskError::NotFound(task_id))?;
    authorize_view(&principal, &entry.scope())?;
    Ok(Json(entry.snapshot()))
}
