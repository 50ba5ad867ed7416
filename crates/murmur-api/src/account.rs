use axum::{Extension, Json, extract::State, response::IntoResponse};

use murmur_types::api::{Claims, SubscriptionStatus};

use crate::AppState;
use crate::error::ApiError;

pub async fn usage(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.usage(claims.sub).await?))
}

pub async fn subscription(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let tier = state.pipeline.subscription(claims.sub).await?;
    Ok(Json(SubscriptionStatus { tier }))
}
