//! HTTP route definitions.
//!
//! Two surfaces share one router: the open telemetry intake at the root,
//! and the bearer-protected admin API under `/api`.

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use super::auth::{auth_middleware, AuthState};
use super::handlers::{self, AppState};

/// Create the router with all routes.
pub fn create_router(app_state: AppState, auth_state: AuthState) -> Router {
    // Admin routes (auth required)
    let admin = Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route(
            "/node",
            get(handlers::get_node).delete(handlers::delete_node),
        )
        .route("/query", get(handlers::query_server))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    // The body cap only covers the intake routes registered before it;
    // admin requests carry no payload worth capping.
    let body_cap = DefaultBodyLimit::max(app_state.policy.max_body_bytes as usize);

    Router::new()
        // Telemetry intake (no auth; the admission gate does the policing)
        .route("/", post(handlers::telemetry))
        .route("/telemetry", post(handlers::telemetry))
        .layer(body_cap)
        .route("/health", get(handlers::health))
        .nest("/api", admin)
        .with_state(app_state)
}
