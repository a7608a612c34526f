use crate::auth;
use crate::handlers;
use crate::AppState;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn routes(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/run", post(handlers::run_code))
        .route("/submit", post(handlers::submit_job))
        .route("/status/:job_id", get(handlers::job_status))
        .route("/result/:job_id", get(handlers::job_result))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
