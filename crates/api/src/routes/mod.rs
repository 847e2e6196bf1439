//! API routes

pub mod billing;
pub mod entitlements;
pub mod health;
pub mod tasks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no auth; the webhook authenticates by signature)
    let public_api_routes = Router::new().route("/billing/webhook", post(billing::webhook));

    // Protected API routes (auth required)
    let protected_api_routes = Router::new()
        .route("/entitlements/usage", get(entitlements::get_usage))
        .route("/entitlements/check", get(entitlements::check))
        .route("/tasks/created", post(tasks::task_created))
        .route("/tasks/deleted", post(tasks::task_deleted))
        .route("/billing/metered-usage", get(billing::metered_usage))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
