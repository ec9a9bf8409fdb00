//! HTTP surface: project CRUD, read-only pipelines and history, autopilot
//! control, and the SSE event stream.
//!
//! Every JSON response uses the `{data, error}` envelope; errors set
//! `data: null` with 400 for validation, 404 for unknown ids, and 409 for
//! uniqueness or active-pipeline conflicts.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::errors::{OrchestratorError, StoreError};
use crate::events::EventBus;
use crate::models::{NewProject, PipelineState, ProjectUpdate};
use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;
use crate::store::DbHandle;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub bus: Arc<EventBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub runtime: RuntimeConfig,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub repo: String,
    pub base_branch: Option<String>,
    pub kanban_board_id: Option<i64>,
    pub max_retries_ci: Option<u32>,
    pub max_retries_review: Option<u32>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub base_branch: Option<String>,
    pub kanban_board_id: Option<i64>,
    pub max_retries_ci: Option<u32>,
    pub max_retries_review: Option<u32>,
}

#[derive(Deserialize)]
pub struct PipelinesQuery {
    pub project_id: Option<String>,
    pub state: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub project_id: Option<String>,
    pub final_state: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub project_id: Option<String>,
}

#[derive(Deserialize)]
pub struct EventStreamQuery {
    pub project_id: Option<String>,
}

// ── Response envelope and error mapping ───────────────────────────────

fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "data": data, "error": null }))
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "data": null, "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProjectNotFound { .. } | StoreError::PipelineNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            StoreError::ProjectExists { .. }
            | StoreError::PipelineExists { .. }
            | StoreError::ProjectHasActivePipelines { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Store(store) => store.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route(
            "/projects/{id}/tickets/{ticket_id}/pipeline",
            get(get_ticket_pipeline),
        )
        .route("/projects/{id}/autopilot", get(autopilot_status))
        .route("/projects/{id}/autopilot/start", post(start_autopilot))
        .route("/projects/{id}/autopilot/stop", post(stop_autopilot))
        .route("/pipelines", get(list_pipelines))
        .route("/pipelines/{id}", get(get_pipeline))
        .route("/history", get(list_history))
        .route("/history/stats", get(history_stats))
        .route("/events/stream", get(event_stream))
}

// ── Validation helpers ────────────────────────────────────────────────

fn validate_repo(repo: &str) -> Result<(), ApiError> {
    let parts: Vec<&str> = repo.split('/').collect();
    if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "repo must be in 'owner/name' format, got '{repo}'"
        )));
    }
    Ok(())
}

fn parse_state(raw: &str) -> Result<PipelineState, ApiError> {
    PipelineState::from_str(raw).map_err(ApiError::BadRequest)
}

// ── Project handlers ──────────────────────────────────────────────────

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(ok(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    validate_repo(&req.repo)?;

    let new = NewProject {
        name: req.name,
        repo: req.repo,
        base_branch: req.base_branch.unwrap_or_else(|| "main".to_string()),
        kanban_board_id: req.kanban_board_id,
        max_retries_ci: req.max_retries_ci.unwrap_or(3),
        max_retries_review: req.max_retries_review.unwrap_or(3),
    };
    let project = state.db.call(move |db| db.create_project(&new)).await?;
    Ok((StatusCode::CREATED, ok(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.db.call(move |db| db.get_project(&id)).await?;
    Ok(ok(project))
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(name) = &req.name {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest("name must not be empty".to_string()));
        }
    }
    let update = ProjectUpdate {
        name: req.name,
        base_branch: req.base_branch,
        kanban_board_id: req.kanban_board_id,
        max_retries_ci: req.max_retries_ci,
        max_retries_review: req.max_retries_review,
    };
    let project = state
        .db
        .call(move |db| db.update_project(&id, &update))
        .await?;
    Ok(ok(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.db.call(move |db| db.delete_project(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Pipeline handlers (read-only) ─────────────────────────────────────

async fn list_pipelines(
    State(state): State<SharedState>,
    Query(query): Query<PipelinesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter_state = query.state.as_deref().map(parse_state).transpose()?;
    let pipelines = state
        .db
        .call(move |db| db.list_pipelines(query.project_id.as_deref(), filter_state))
        .await?;
    Ok(ok(pipelines))
}

async fn get_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = state.db.call(move |db| db.get_pipeline(&id)).await?;
    Ok(ok(pipeline))
}

async fn get_ticket_pipeline(
    State(state): State<SharedState>,
    Path((project_id, ticket_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = {
        let ticket_id = ticket_id.clone();
        state
            .db
            .call(move |db| {
                db.get_project(&project_id)?;
                db.get_pipeline_by_ticket(&project_id, &ticket_id)
            })
            .await?
    };
    match pipeline {
        Some(pipeline) => Ok(ok(pipeline)),
        None => Err(ApiError::NotFound(format!(
            "No active pipeline for ticket #{ticket_id}"
        ))),
    }
}

// ── History handlers ──────────────────────────────────────────────────

async fn list_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let final_state = query.final_state.as_deref().map(parse_state).transpose()?;
    let records = state
        .db
        .call(move |db| {
            db.list_history(
                query.project_id.as_deref(),
                final_state,
                query.limit,
                query.offset,
            )
        })
        .await?;
    Ok(ok(records))
}

async fn history_stats(
    State(state): State<SharedState>,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .db
        .call(move |db| db.history_stats(query.project_id.as_deref(), None))
        .await?;
    Ok(ok(stats))
}

// ── Autopilot handlers ────────────────────────────────────────────────

async fn autopilot_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.orchestrator.autopilot_status(&id).await?;
    Ok(ok(status))
}

async fn start_autopilot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = {
        let id = id.clone();
        state.db.call(move |db| db.get_project(&id)).await?
    };

    state.orchestrator.start_autopilot(&id).await?;
    let status = state.orchestrator.autopilot_status(&id).await?;

    state.scheduler.launch(project, state.runtime.clone());
    Ok(ok(status))
}

async fn stop_autopilot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    {
        let id = id.clone();
        state.db.call(move |db| db.get_project(&id)).await?;
    }
    state.orchestrator.stop_autopilot(&id, "manual");
    let status = state.orchestrator.autopilot_status(&id).await?;
    Ok(ok(status))
}

// ── SSE ───────────────────────────────────────────────────────────────

/// Stream events as SSE frames. The subscription unregisters itself when
/// the client disconnects and the stream is dropped.
async fn event_stream(
    State(state): State<SharedState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.bus.subscribe(query.project_id);
    let stream = subscription.map(|event| {
        Ok(SseEvent::default()
            .event(event.event_type.as_str())
            .data(event.data.to_string()))
    });
    Sse::new(stream)
}

// ── Tests ─────────────────────────────────────────────────────────────
