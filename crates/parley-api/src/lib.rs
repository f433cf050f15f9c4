pub mod auth;
pub mod messages;
pub mod middleware;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// HTTP routes for accounts and message history. The WebSocket gateway is
/// mounted separately by the server.
pub fn routes(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route(
            "/conversations/{other_user_id}/messages",
            get(messages::get_conversation),
        )
        .route("/export", get(messages::export_messages))
        .route(
            "/messages/{message_id}/delivered",
            post(messages::mark_delivered),
        )
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}
