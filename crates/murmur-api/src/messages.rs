use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use murmur_types::api::{Claims, SendMessageRequest};

use crate::AppState;
use crate::error::ApiError;

/// Answers 202 as soon as the message is stored and queued; the bot reply
/// shows up in the room detail later.
pub async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .pipeline
        .send_message(claims.sub, room_id, &req.content)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
