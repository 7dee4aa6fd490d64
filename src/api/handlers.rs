//! HTTP handlers: conversation CRUD, message submission, job polling and
//! cancellation, council configuration, and model verification.
//!
//! Submission is non-blocking: the user message and a pending assistant
//! placeholder are written, a job is enqueued, and the job id is returned
//! immediately. Clients poll `GET /jobs/:id` until a terminal status.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::{AppConfig, CouncilConfig, SharedConfig};
use crate::gateway::{ChatMessage, ModelGateway};
use crate::jobs::{JobError, JobStore};
use crate::store::{ConversationStore, StoreError};
use crate::types::Job;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct ApiContext {
    pub store: ConversationStore,
    pub jobs: JobStore,
    pub config: SharedConfig,
    pub gateway: Arc<dyn ModelGateway>,
    /// Where to persist config updates; `None` disables persistence
    pub config_path: Option<PathBuf>,
}

fn store_error(e: &StoreError) -> Response {
    match e {
        StoreError::NotFound(id) => {
            ApiErrorResponse::not_found(format!("Conversation {id} not found"))
        }
        other => {
            error!(error = %other, "Conversation store error");
            ApiErrorResponse::internal(other.to_string())
        }
    }
}

fn job_error(e: &JobError) -> Response {
    match e {
        JobError::NotFound(id) => ApiErrorResponse::not_found(format!("Job {id} not found")),
        other => {
            error!(error = %other, "Job store error");
            ApiErrorResponse::internal(other.to_string())
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// GET /api/v1/health
pub async fn get_health(State(ctx): State<ApiContext>) -> Response {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "service": "conclave",
        "queue_depth": ctx.jobs.queue_depth(),
    }))
}

// ============================================================================
// Conversations
// ============================================================================

/// GET /api/v1/conversations
pub async fn list_conversations(State(ctx): State<ApiContext>) -> Response {
    match ctx.store.list() {
        Ok(metas) => ApiResponse::ok(metas),
        Err(e) => store_error(&e),
    }
}

/// POST /api/v1/conversations
pub async fn create_conversation(State(ctx): State<ApiContext>) -> Response {
    match ctx.store.create() {
        Ok(conversation) => ApiResponse::ok(conversation),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/conversations/:id
pub async fn get_conversation(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Response {
    match ctx.store.get(&id) {
        Ok(conversation) => ApiResponse::ok(conversation),
        Err(e) => store_error(&e),
    }
}

/// DELETE /api/v1/conversations/:id
pub async fn delete_conversation(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Response {
    match ctx.store.delete(&id) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "deleted": id })),
        Err(e) => store_error(&e),
    }
}

// ============================================================================
// Message Submission & Jobs
// ============================================================================

/// Request to send a message in a conversation.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

/// POST /api/v1/conversations/:id/message
pub async fn submit_message(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let text = request.content.trim();
    if text.is_empty() {
        return ApiErrorResponse::bad_request("Message content is empty");
    }
    // Conversation must exist before anything is written.
    if let Err(e) = ctx.store.get(&id) {
        return store_error(&e);
    }

    if let Err(e) = ctx.store.append_exchange(&id, text) {
        return store_error(&e);
    }
    match ctx.jobs.create(&id, text) {
        Ok(job) => ApiResponse::ok(serde_json::json!({
            "job_id": job.id,
            "status": job.status,
        })),
        Err(e) => job_error(&e),
    }
}

/// Job record projection for status polling.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub conversation_id: String,
    pub status: crate::types::JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            conversation_id: job.conversation_id,
            status: job.status,
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

/// GET /api/v1/jobs/:id
pub async fn get_job(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    match ctx.jobs.get(&id) {
        Ok(job) => ApiResponse::ok(JobView::from(job)),
        Err(e) => job_error(&e),
    }
}

/// POST /api/v1/jobs/:id/cancel
///
/// Idempotent: requesting cancellation of a terminal job is a no-op that
/// still returns 200.
pub async fn cancel_job(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    match ctx.jobs.request_cancel(&id) {
        Ok(accepted) => ApiResponse::ok(serde_json::json!({
            "job_id": id,
            "accepted": accepted,
        })),
        Err(e) => job_error(&e),
    }
}

// ============================================================================
// Council Configuration
// ============================================================================

/// GET /api/v1/config/council
pub async fn get_council_config(State(ctx): State<ApiContext>) -> Response {
    ApiResponse::ok(ctx.config.snapshot().council.clone())
}

/// PUT /api/v1/config/council
///
/// Validates and hot-swaps the council. Jobs already running keep their
/// snapshot; the next job picks up the new membership.
pub async fn put_council_config(
    State(ctx): State<ApiContext>,
    Json(council): Json<CouncilConfig>,
) -> Response {
    if let Err(e) = council.validate() {
        return ApiErrorResponse::bad_request(e.to_string());
    }

    let mut updated: AppConfig = (*ctx.config.snapshot()).clone();
    updated.council = council.clone();
    let persisted = persist_config(&updated, ctx.config_path.as_deref());
    ctx.config.store(updated);

    ApiResponse::ok(serde_json::json!({
        "council": council,
        "persisted": persisted,
    }))
}

fn persist_config(config: &AppConfig, path: Option<&std::path::Path>) -> bool {
    let Some(path) = path else { return false };
    match config
        .to_toml()
        .map_err(|e| e.to_string())
        .and_then(|raw| std::fs::write(path, raw).map_err(|e| e.to_string()))
    {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not persist config update");
            false
        }
    }
}

// ============================================================================
// Model Verification
// ============================================================================

/// Request to verify a model id against the provider.
#[derive(Debug, Deserialize)]
pub struct VerifyModelRequest {
    pub model: String,
}

/// POST /api/v1/models/verify
///
/// Issues a minimal probe call through the gateway and reports whether the
/// model id is usable. Not part of the pipeline; used to validate
/// configuration changes.
pub async fn verify_model(
    State(ctx): State<ApiContext>,
    Json(request): Json<VerifyModelRequest>,
) -> Response {
    let model = request.model.trim();
    if model.is_empty() {
        return ApiErrorResponse::bad_request("Model id is empty");
    }

    let timeout = Duration::from_secs(ctx.config.snapshot().gateway.probe_timeout_secs);
    let probe = [ChatMessage::user("Reply with the single word: ok")];
    match ctx.gateway.invoke(model, &probe, timeout).await {
        Ok(reply) => ApiResponse::ok(serde_json::json!({
            "model": model,
            "valid": true,
            "latency_ms": reply.latency_ms,
        })),
        Err(e) => ApiResponse::ok(serde_json::json!({
            "model": model,
            "valid": false,
            "error": e.to_string(),
        })),
    }
}
