use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use murmur_types::api::{Claims, CreateRoomRequest};

use crate::AppState;
use crate::error::ApiError;

pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = state.pipeline.create_room(claims.sub, &req.name).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn list_rooms(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let rooms = state.pipeline.list_rooms(claims.sub).await?;
    Ok(Json(rooms))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.pipeline.room_detail(claims.sub, room_id).await?;
    Ok(Json(detail))
}
