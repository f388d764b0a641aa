//! Transport (§6): HTTP/JSON on a single endpoint group under `/api`. This layer is intentionally
//! thin — request/response shape is specified bit-exactly, but the server framework underneath it
//! is explicitly called out as replaceable (§1 "Out of scope"), so no pipeline logic lives here.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::domain::{CompileRequest, CompileResponse, InitializeRequest};
use crate::error::ServerError;
use crate::pipeline::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/check-initialized", get(check_initialized))
        .route("/api/hook-type-infos", get(hook_type_infos))
        .route("/api/initialize", post(initialize))
        .route("/api/clear", post(clear))
        .route("/api/compile", post(compile))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Deserialize)]
struct ProjectPathQuery {
    #[serde(rename = "projectPath")]
    project_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct CheckInitializedResponse {
    initialized: bool,
}

async fn check_initialized(State(state): State<Arc<AppState>>, Query(q): Query<ProjectPathQuery>) -> Json<CheckInitializedResponse> {
    Json(CheckInitializedResponse { initialized: state.is_initialized_for(&q.project_path).await })
}

async fn hook_type_infos(State(state): State<Arc<AppState>>, Query(_q): Query<ProjectPathQuery>) -> impl IntoResponse {
    Json(state.hook_type_infos().await)
}

/// `traceId` rides on every response, success or error (§6A) — the request span's id, the same
/// correlation convention the teacher's HTTP layer uses internally.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SimpleResponse {
    success: bool,
    error_message: Option<String>,
    trace_id: String,
}

impl SimpleResponse {
    fn ok() -> Self {
        Self { success: true, error_message: None, trace_id: uuid::Uuid::new_v4().to_string() }
    }

    fn err(message: String) -> Self {
        Self { success: false, error_message: Some(message), trace_id: uuid::Uuid::new_v4().to_string() }
    }
}

async fn initialize(State(state): State<Arc<AppState>>, Json(req): Json<InitializeRequest>) -> impl IntoResponse {
    match state.initialize(req).await {
        Ok(()) => Json(SimpleResponse::ok()).into_response(),
        Err(err) => error_response(err),
    }
}

async fn clear(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.clear().await {
        Ok(()) => Json(SimpleResponse::ok()).into_response(),
        Err(err) => error_response(err),
    }
}

/// §7 propagation rule: recoverable conditions always come back as a `CompileResponse` with
/// `Success=false` and a message, never a non-2xx status — the client distinguishes failure by
/// the body, not the transport status.
async fn compile(State(state): State<Arc<AppState>>, Json(req): Json<CompileRequest>) -> Json<CompileResponse> {
    match state.compile(req).await {
        Ok(response) => Json(response),
        Err(err) => Json(CompileResponse {
            success: false,
            error_message: Some(err.user_message()),
            elapsed_milliseconds: 0,
            hook_type_infos: Default::default(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }),
    }
}

/// `initialize`/`clear` share the same "no non-2xx for recoverable errors" rule (§7), except for
/// `NotInitialized` on `/clear`, which genuinely means the caller skipped a required step rather
/// than something the pipeline itself failed at — surfaced as 409 so a misbehaving client notices
/// in its transport layer, not just its response body.
fn error_response(err: ServerError) -> axum::response::Response {
    let status = match err {
        ServerError::NotInitialized => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    (status, Json(SimpleResponse::err(err.user_message()))).into_response()
}
