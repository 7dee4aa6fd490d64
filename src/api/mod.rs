//! REST API module using Axum
//!
//! Provides the HTTP surface for the council client:
//! - conversation CRUD against the document store
//! - asynchronous message submission returning a job id
//! - lock-free job status polling and cooperative cancellation
//! - council configuration with hot reload
//! - model verification probes

pub mod envelope;
pub mod handlers;
mod routes;

pub use handlers::ApiContext;

use axum::http::{header, Method};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `CONCLAVE_CORS_ORIGINS` to a comma-separated list of allowed origins
/// for development (e.g., `http://localhost:5173` for the Vite dev server).
fn build_cors_layer() -> CorsLayer {
    match std::env::var("CONCLAVE_CORS_ORIGINS") {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        }
        Err(_) => CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    }
}

/// Create the complete application router.
pub fn create_app(ctx: ApiContext) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes(ctx))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer())
}
