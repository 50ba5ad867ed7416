use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use murmur_types::api::SetTierRequest;

use crate::AppState;

pub const BILLING_SECRET_HEADER: &str = "x-billing-secret";

/// POST /billing/tier: called by the billing service once a checkout
/// settles. Authenticated by a shared secret rather than a user token.
pub async fn set_tier(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SetTierRequest>,
) -> Response {
    let presented = headers
        .get(BILLING_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.billing_secret.as_str()) {
        warn!("Rejected tier change with bad billing secret");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.pipeline.set_tier(req.user_id, req.tier).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => crate::error::ApiError::from(e).into_response(),
    }
}
