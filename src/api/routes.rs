//! API route definitions.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiResult;
use super::state::AppState;
use crate::model::{
    ConfigEntryId, HistoryId, JobFilter, JobId, JobKind, NewConfigEntry, PageRequest, Status,
    StepId,
};
use crate::service::{CreateJobRequest, StartAccepted, UpdateJobRequest};
use crate::tail::{sse, ws};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job).patch(update_job).delete(delete_job))
        .route("/jobs/{id}/start", post(start_job))
        .route("/jobs/{id}/steps/{step}/stop", post(stop_job))
        .route("/jobs/{id}/steps/{step}/log", get(stream_log_sse))
        .route("/jobs/{id}/steps/{step}/log/ws", get(stream_log_ws))
        .route("/jobs/{id}/history", get(list_history))
        .route("/history/{id}", get(get_history).delete(delete_history))
        .route("/history/steps/{id}/log", get(get_history_log))
        .route("/config-entries", get(list_config_entries).post(create_config_entry))
        .route(
            "/config-entries/{id}",
            get(get_config_entry).delete(delete_config_entry),
        )
        .route("/schedules/dry-run", get(schedule_dry_run))
}

fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListJobsQuery {
    name: Option<String>,
    kind: Option<JobKind>,
    status: Option<Status>,
    recurring: Option<bool>,
    page: Option<u32>,
    size: Option<u32>,
}

impl ListJobsQuery {
    fn split(self) -> (JobFilter, PageRequest) {
        let defaults = PageRequest::default();
        (
            JobFilter {
                name: self.name.filter(|n| !n.is_empty()),
                kind: self.kind,
                status: self.status,
                recurring: self.recurring,
            },
            PageRequest::new(
                self.page.unwrap_or(defaults.page),
                self.size.unwrap_or(defaults.size),
            ),
        )
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Value>> {
    let (filter, page) = query.split();
    let jobs = state.orchestrator.list_jobs(&filter, page).await?;
    Ok(data(jobs))
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job = state.orchestrator.create_job(req).await?;
    Ok((StatusCode::CREATED, data(job)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<Json<Value>> {
    Ok(data(state.orchestrator.get_job(id).await?))
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(patch): Json<UpdateJobRequest>,
) -> ApiResult<Json<Value>> {
    Ok(data(state.orchestrator.update_job(id, patch).await?))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    // The run continues after the handle is dropped.
    let handle = state.orchestrator.start_job(id).await?;
    let accepted = StartAccepted {
        job_id: handle.job_id,
        message: "job started",
    };
    Ok((StatusCode::ACCEPTED, data(accepted)))
}

async fn stop_job(
    State(state): State<AppState>,
    Path((id, step)): Path<(JobId, StepId)>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.stop_job(id, step).await?;
    Ok(data(json!({ "job_id": id, "step_id": step, "message": "stop requested" })))
}

async fn stream_log_sse(
    State(state): State<AppState>,
    Path((id, step)): Path<(JobId, StepId)>,
) -> ApiResult<Response> {
    let subscription = state.orchestrator.stream_log(id, step).await?;
    Ok(sse::stream(subscription).into_response())
}

async fn stream_log_ws(
    State(state): State<AppState>,
    Path((id, step)): Path<(JobId, StepId)>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let subscription = state.orchestrator.stream_log(id, step).await?;
    Ok(upgrade.on_upgrade(move |socket| ws::serve(socket, subscription, id, step)))
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

async fn list_history(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Value>> {
    Ok(data(state.orchestrator.list_history(id, page).await?))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<HistoryId>,
) -> ApiResult<Json<Value>> {
    Ok(data(state.orchestrator.get_history(id).await?))
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<HistoryId>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_history(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_history_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(data(state.orchestrator.get_history_log(id).await?))
}

// ---------------------------------------------------------------------------
// Config entries
// ---------------------------------------------------------------------------

async fn list_config_entries(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(data(state.orchestrator.list_config_entries().await?))
}

async fn create_config_entry(
    State(state): State<AppState>,
    Json(entry): Json<NewConfigEntry>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let entry = state.orchestrator.create_config_entry(entry).await?;
    Ok((StatusCode::CREATED, data(entry)))
}

async fn get_config_entry(
    State(state): State<AppState>,
    Path(id): Path<ConfigEntryId>,
) -> ApiResult<Json<Value>> {
    Ok(data(state.orchestrator.get_config_entry(id).await?))
}

async fn delete_config_entry(
    State(state): State<AppState>,
    Path(id): Path<ConfigEntryId>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_config_entry(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DryRunQuery {
    #[serde(default = "default_hours")]
    hours: u64,
}

fn default_hours() -> u64 {
    24
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    Query(query): Query<DryRunQuery>,
) -> Json<Value> {
    let upcoming = state.orchestrator.scheduler().preview(query.hours);
    Json(json!({ "data": { "hours": query.hours, "upcoming": upcoming } }))
}
