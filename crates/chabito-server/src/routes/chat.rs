use axum::{extract::State, routing::post, Json, Router};
use bytes::Bytes;
use serde::Serialize;

use crate::error::ApiError;
use crate::payload::{parse_payload, PayloadError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ChatResponse {
    answer: String,
}

async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Json<ChatResponse>, ApiError> {
    // Decoded by hand so malformed bodies get the same error shape as the websocket
    let raw = std::str::from_utf8(&body).map_err(|_| PayloadError::InvalidJson)?;
    let input = parse_payload(raw)?;

    tracing::info!(user_id = %input.user_id, "chat request");
    let contact = input.contact();
    let reply = state
        .chat
        .reply(&input.user_id, input.to_human_message(), Some(&contact))
        .await?;

    Ok(Json(ChatResponse {
        answer: reply.text(),
    }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/chat_v2.0", post(chat))
        .with_state(state)
}
