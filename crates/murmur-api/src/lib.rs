pub mod account;
pub mod billing;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod rooms;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use murmur_core::Pipeline;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub pipeline: Pipeline,
    pub jwt_secret: String,
    pub billing_secret: String,
}

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/rooms", post(rooms::create_room).get(rooms::list_rooms))
        .route("/rooms/{room_id}", get(rooms::get_room))
        .route("/rooms/{room_id}/messages", post(messages::send_message))
        .route("/usage", get(account::usage))
        .route("/subscription", get(account::subscription))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let public_routes = Router::new()
        .route("/billing/tier", post(billing::set_tier))
        .route("/health", get(health));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
