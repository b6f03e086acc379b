use axum::{
    extract::{Path, Query, State},
    http::Method,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    error::AppError,
    models::{DisplayMode, Record, WorkflowStep},
    services::{
        import::{import_files, FileUpload},
        output_projector::{project_result, ProjectedView},
        preview_state::{PreviewSnapshot, RefreshOutcome},
    },
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/preview/sources", post(set_sources))
        .route("/preview/run", post(run_preview))
        .route("/preview/retry", post(retry_preview))
        .route("/preview/status", get(preview_status))
        .route("/preview/view", get(active_view))
        .route("/preview/steps/:index", get(step_view))
        .route("/preview/mode", put(set_mode))
        .route("/preview/selection", put(select_step))
        .layer(cors)
}

#[derive(Debug, Deserialize)]
pub struct SourcesRequest {
    files: Vec<FileUpload>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    steps: Vec<WorkflowStep>,
    #[serde(default)]
    sample_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    outcome: RefreshOutcome,
    status: PreviewSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct ViewQuery {
    mode: Option<DisplayMode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    step_index: usize,
    mode: DisplayMode,
    columns: Vec<String>,
    rows: Vec<Record>,
    row_count: usize,
    execution_time_ms: u64,
    memory_usage: u64,
    failure: Option<String>,
    blocked_by: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    mode: DisplayMode,
}

#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    step: usize,
}

async fn set_sources(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SourcesRequest>,
) -> Result<Json<PreviewSnapshot>, AppError> {
    tracing::info!("Importing {} files", request.files.len());
    let datasets = import_files(&state.http, request.files, state.config.max_file_size as u64).await?;
    state.preview.set_sources(datasets);
    Ok(Json(state.preview.snapshot()))
}

fn respond(state: &AppState, outcome: RefreshOutcome) -> Result<Json<RunResponse>, AppError> {
    if let RefreshOutcome::Failed { message, .. } = &outcome {
        return Err(AppError::RunFailed(message.clone()));
    }
    Ok(Json(RunResponse {
        outcome,
        status: state.preview.snapshot(),
    }))
}

async fn run_preview(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, AppError> {
    let sample_size = request.sample_size.unwrap_or(state.config.default_sample_size);
    if sample_size == 0 {
        return Err(AppError::InvalidInput("sample_size must be positive".to_string()));
    }
    let outcome = state.preview.update(request.steps, Some(sample_size)).await;
    respond(&state, outcome)
}

async fn retry_preview(State(state): State<Arc<AppState>>) -> Result<Json<RunResponse>, AppError> {
    let outcome = state.preview.retry().await;
    respond(&state, outcome)
}

async fn preview_status(State(state): State<Arc<AppState>>) -> Json<PreviewSnapshot> {
    Json(state.preview.snapshot())
}

async fn step_view(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
    Query(query): Query<ViewQuery>,
) -> Result<Json<StepView>, AppError> {
    let mode = query.mode.unwrap_or_else(|| state.preview.display_mode());

    let result = state
        .preview
        .get_result(index)
        .ok_or_else(|| AppError::NotFound(format!("No result for step {}", index)))?;
    let view = project_result(&result, mode);

    Ok(Json(StepView {
        step_index: index,
        mode,
        columns: view.columns,
        rows: view.rows,
        row_count: result.row_count,
        execution_time_ms: result.execution_time_ms,
        memory_usage: result.memory_usage,
        failure: result.failure,
        blocked_by: result.blocked_by,
    }))
}

async fn active_view(State(state): State<Arc<AppState>>) -> Result<Json<ProjectedView>, AppError> {
    state
        .preview
        .active_view()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No published preview".to_string()))
}

async fn set_mode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModeRequest>,
) -> Json<PreviewSnapshot> {
    state.preview.set_display_mode(request.mode);
    Json(state.preview.snapshot())
}

async fn select_step(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectionRequest>,
) -> Result<Json<PreviewSnapshot>, AppError> {
    if !state.preview.select_step(request.step) {
        return Err(AppError::NotFound(format!("No result for step {}", request.step)));
    }
    Ok(Json(state.preview.snapshot()))
}
