use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::error;

use parley_db::MessageStore;
use parley_types::api::Claims;
use parley_types::models::Message;

use crate::auth::AppState;

/// Conversation history between the caller and another user, oldest first.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(other_user_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    // Run blocking DB query off the async runtime
    let db = state.db.clone();
    let messages = tokio::task::spawn_blocking(move || db.history(&claims.sub, &other_user_id))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("history query failed: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    Ok(Json(messages))
}

/// Every message the caller sent or received, in the order they were stored.
pub async fn export_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let db = state.db.clone();
    let messages = tokio::task::spawn_blocking(move || db.export(&claims.sub))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("export query failed: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    Ok(Json(messages))
}

/// Delivery receipt from the recipient. Only the receiver may mark a message.
pub async fn mark_delivered(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, StatusCode> {
    let db = state.db.clone();
    let updated = tokio::task::spawn_blocking(move || db.mark_delivered(&message_id, &claims.sub))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
