//! Rehearse HTTP REST API
//!
//! Axum-based HTTP server exposing the interview lifecycle. Each endpoint has a
//! thin axum handler that delegates to an inner function returning
//! `(StatusCode, serde_json::Value)`, so the logic is testable without
//! dispatch machinery.
//!
//! Endpoints:
//! - GET    /health                — health check with store status
//! - GET    /version               — server version info
//! - POST   /sessions              — start an interview from a job description
//! - GET    /sessions              — sessions for the caller's identity
//! - GET    /sessions/:id          — full session detail with progress
//! - DELETE /sessions/:id          — idempotent delete
//! - POST   /sessions/:id/answers  — submit an answer, get the next question or the report
//! - POST   /sessions/:id/abandon  — mark abandoned
//! - POST   /sessions/:id/report   — regenerate the report as a new version
//! - GET    /usage                 — quota status for the caller
//! - POST   /transcribe            — raw audio body to text
//!
//! Callers are identified by `x-user-id`, then `x-forwarded-for`, then the
//! shared anonymous bucket.

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rehearse_core::config::HttpConfig;
use rehearse_core::{AudioClip, RehearseError};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::subsystems::interview::{InterviewService, ANONYMOUS_IDENTITY};
use crate::subsystems::transcribe::TranscriptionService;

/// Upper bound on uploaded audio.
const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// Hint returned with 503 while the global gate is closed.
const PAUSED_RETRY_AFTER_SECS: u64 = 3600;
const UPSTREAM_RETRY_AFTER_SECS: u64 = 30;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub service: Arc<InterviewService>,
    /// `None` when no transcription credentials are configured.
    pub transcriber: Option<Arc<TranscriptionService>>,
    /// `None` in `--memory` mode.
    pub pool: Option<PgPool>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/sessions", post(start_handler).get(list_handler))
        .route("/sessions/:id", get(get_handler).delete(delete_handler))
        .route("/sessions/:id/answers", post(answer_handler))
        .route("/sessions/:id/abandon", post(abandon_handler))
        .route("/sessions/:id/report", post(report_handler))
        .route("/usage", get(usage_handler))
        .route(
            "/transcribe",
            post(transcribe_handler).layer(DefaultBodyLimit::max(MAX_AUDIO_BYTES)),
        )
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    config: &HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Rehearse HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub job_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub answer: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TranscribeParams {
    pub session_id: Option<Uuid>,
    pub file_name: Option<String>,
}

// ============================================================================
// Identity & error mapping
// ============================================================================

/// Caller identity: `x-user-id`, else the first `x-forwarded-for` hop.
/// `None` means anonymous.
pub fn identity_from_headers(headers: &HeaderMap) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(user) = header_value("x-user-id") {
        return Some(user.to_string());
    }
    header_value("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn error_response(err: &RehearseError) -> (StatusCode, serde_json::Value) {
    let message = err.to_string();
    match err {
        RehearseError::Validation(_) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "error": message }),
        ),
        RehearseError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "status": "error", "error": message }),
        ),
        RehearseError::Conflict(_) => (
            StatusCode::CONFLICT,
            serde_json::json!({ "status": "error", "error": message }),
        ),
        RehearseError::QuotaExceeded {
            remaining,
            reset_at,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "status": "error",
                "error": message,
                "remaining": remaining,
                "reset_at": reset_at,
                "retry_after_secs": (*reset_at - Utc::now()).num_seconds().max(0),
            }),
        ),
        RehearseError::ServicePaused => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "error",
                "error": message,
                "retry_after_secs": PAUSED_RETRY_AFTER_SECS,
            }),
        ),
        RehearseError::UpstreamUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "error",
                "error": message,
                "retry_after_secs": UPSTREAM_RETRY_AFTER_SECS,
            }),
        ),
        RehearseError::Persistence(_) | RehearseError::Config(_) | RehearseError::Io(_) => {
            tracing::error!(error = %message, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "status": "error", "error": message }),
            )
        }
    }
}

fn ok_json<T: serde::Serialize>(value: &T) -> (StatusCode, serde_json::Value) {
    match serde_json::to_value(value) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "status": "error", "error": e.to_string() }),
        ),
    }
}

fn respond<T: serde::Serialize>(result: Result<T, RehearseError>) -> (StatusCode, serde_json::Value) {
    match result {
        Ok(value) => ok_json(&value),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — queries the DB when one is attached.
pub async fn health_inner(pool: Option<&PgPool>) -> (StatusCode, serde_json::Value) {
    let Some(pool) = pool else {
        return (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": "memory",
            }),
        );
    };

    match rehearse_core::db::health_check(pool).await {
        Ok(pg_ver) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": "postgresql",
                "postgresql": pg_ver,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "rehearse/1",
    })
}

pub async fn start_inner(
    service: &InterviewService,
    identity: Option<&str>,
    req: StartRequest,
) -> (StatusCode, serde_json::Value) {
    let Some(description) = req.job_description else {
        return (
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": "job_description field is required",
                "status": "error",
            }),
        );
    };

    match service.start(identity, &description).await {
        Ok(outcome) => (
            StatusCode::OK,
            serde_json::json!({
                "session_id": outcome.session.id,
                "session": outcome.session,
                "question": outcome.question,
                "questions": outcome.questions,
                "progress": outcome.progress,
                "quota": outcome.quota,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn answer_inner(
    service: &InterviewService,
    session_id: Uuid,
    req: AnswerRequest,
) -> (StatusCode, serde_json::Value) {
    let Some(answer) = req.answer else {
        return (
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": "answer field is required",
                "status": "error",
            }),
        );
    };
    respond(service.submit_answer(session_id, &answer).await)
}

pub async fn list_inner(
    service: &InterviewService,
    identity: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    match service.list(identity).await {
        Ok(sessions) => (
            StatusCode::OK,
            serde_json::json!({
                "count": sessions.len(),
                "sessions": sessions,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_inner(service: &InterviewService, session_id: Uuid) -> (StatusCode, serde_json::Value) {
    match service.delete(session_id).await {
        Ok(deleted) => (
            StatusCode::OK,
            serde_json::json!({ "status": "ok", "deleted": deleted }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn usage_inner(service: &InterviewService, identity: Option<&str>) -> (StatusCode, serde_json::Value) {
    let guard = service.guard();
    let quota = guard
        .check_identity_quota(identity.unwrap_or(ANONYMOUS_IDENTITY))
        .await;
    let gate_open = guard.check_global_gate().await;
    (
        StatusCode::OK,
        serde_json::json!({
            "allowed": quota.allowed && gate_open,
            "remaining": quota.remaining,
            "limit": guard.config().max_sessions_per_day,
            "reset_at": quota.reset_at,
            "warning": quota.warning,
            "service_paused": !gate_open,
        }),
    )
}

pub async fn transcribe_inner(
    transcriber: Option<&TranscriptionService>,
    params: TranscribeParams,
    mime_type: Option<&str>,
    body: Bytes,
) -> (StatusCode, serde_json::Value) {
    let Some(transcriber) = transcriber else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "error": "transcription is not configured",
                "status": "error",
            }),
        );
    };

    let clip = AudioClip {
        bytes: body.to_vec(),
        file_name: params.file_name.unwrap_or_else(|| "answer.webm".to_string()),
        mime_type: mime_type.unwrap_or("audio/webm").to_string(),
    };
    match transcriber.transcribe(clip, params.session_id).await {
        Ok(text) => (StatusCode::OK, serde_json::json!({ "text": text })),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.pool.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn start_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    let identity = identity_from_headers(&headers);
    let (status, body) = start_inner(&state.service, identity.as_deref(), req).await;
    (status, Json(body))
}

pub async fn list_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let identity = identity_from_headers(&headers);
    let (status, body) = list_inner(&state.service, identity.as_deref()).await;
    (status, Json(body))
}

pub async fn get_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = respond(state.service.get(id).await);
    (status, Json(body))
}

pub async fn delete_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = delete_inner(&state.service, id).await;
    (status, Json(body))
}

pub async fn answer_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AnswerRequest>,
) -> impl IntoResponse {
    let (status, body) = answer_inner(&state.service, id, req).await;
    (status, Json(body))
}

pub async fn abandon_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = respond(state.service.abandon(id).await);
    (status, Json(body))
}

pub async fn report_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = respond(state.service.regenerate_report(id).await);
    (status, Json(body))
}

pub async fn usage_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let identity = identity_from_headers(&headers);
    let (status, body) = usage_inner(&state.service, identity.as_deref()).await;
    (status, Json(body))
}

pub async fn transcribe_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<TranscribeParams>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let (status, body) =
        transcribe_inner(state.transcriber.as_deref(), params, mime_type, body).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests — call inner functions directly
// ============================================================================
