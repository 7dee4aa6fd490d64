//! API route definitions
//!
//! Endpoints for the council client:
//! - /api/v1/health - liveness and queue depth
//! - /api/v1/conversations - conversation CRUD
//! - /api/v1/conversations/:id/message - submit a question (async job)
//! - /api/v1/jobs/:id - job status polling and cancellation
//! - /api/v1/config/council - council membership (hot-swappable)
//! - /api/v1/models/verify - gateway probe for one model id

use axum::routing::{get, post};
use axum::Router;

use super::handlers::{self, ApiContext};

/// Create all API routes.
pub fn api_routes(ctx: ApiContext) -> Router {
    Router::new()
        .route("/health", get(handlers::get_health))
        .route(
            "/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route(
            "/conversations/:id",
            get(handlers::get_conversation).delete(handlers::delete_conversation),
        )
        .route(
            "/conversations/:id/message",
            post(handlers::submit_message),
        )
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/cancel", post(handlers::cancel_job))
        .route(
            "/config/council",
            get(handlers::get_council_config).put(handlers::put_council_config),
        )
        .route("/models/verify", post(handlers::verify_model))
        .with_state(ctx)
}
