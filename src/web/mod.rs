//! HTTP-facing layer: builds the axum `Router`, exposes `/health`, and
//! runs every inbound request through the admission chain before handing
//! it to the [`RequestDispatcher`].

mod handlers;

use crate::admission::rate_limiter::RateLimiter;
use crate::admission::AdmissionChain;
use crate::dispatch::RequestDispatcher;
use axum::http::Method;
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub dispatcher: RequestDispatcher,
    pub admission: AdmissionChain,
    pub rate_limiter: Arc<RateLimiter>,
    pub proxy_prefix: String,
    /// Mirrors `SizeLimitConfig::max_body_size`; bounds the actual bytes
    /// read for the body, not just the declared `Content-Length`.
    pub max_body_size: i64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/*path", any(handlers::proxy))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
