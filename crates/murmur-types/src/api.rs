use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Room, Tier};

// -- JWT Claims --

/// Bearer token claims. Tokens are minted by the identity service; this
/// workspace only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDetail {
    #[serde(flatten)]
    pub room: Room,
    pub messages: Vec<Message>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub status: String,
    pub message_id: Uuid,
}

impl SendReceipt {
    pub fn queued(message_id: Uuid) -> Self {
        Self {
            status: "queued".to_string(),
            message_id,
        }
    }
}

// -- Usage & subscription --

/// `None` limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub tier: Tier,
    pub daily_limit: Option<u32>,
    pub used_today: u32,
    pub remaining: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub tier: Tier,
}

/// Tier change pushed by the billing service.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetTierRequest {
    pub user_id: Uuid,
    pub tier: Tier,
}
