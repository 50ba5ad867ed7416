//! Database row types. These map directly to SQLite rows and are converted
//! into `murmur-types` models at the edge of this crate.

use anyhow::{Context, Result};
use uuid::Uuid;

use murmur_types::models::{Message, Room, User};

use crate::decode_timestamp;

pub struct UserRow {
    pub id: String,
    pub tier: String,
    pub created_at: String,
}

pub struct RoomRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender: String,
    pub content: String,
    pub reply_to: Option<String>,
    pub created_at: String,
}

/// A user message that never received a bot reply.
pub struct PendingPromptRow {
    pub message_id: String,
    pub room_id: String,
    pub owner_id: String,
    pub content: String,
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt {} '{}'", what, raw))
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: parse_id(&self.id, "user id")?,
            tier: self.tier.parse()?,
            created_at: decode_timestamp(&self.created_at)?,
        })
    }
}

impl RoomRow {
    pub fn into_room(self) -> Result<Room> {
        Ok(Room {
            id: parse_id(&self.id, "room id")?,
            owner_id: parse_id(&self.owner_id, "owner id")?,
            name: self.name,
            created_at: decode_timestamp(&self.created_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id, "message id")?,
            room_id: parse_id(&self.room_id, "room id")?,
            sender: self.sender.parse()?,
            content: self.content,
            reply_to: self
                .reply_to
                .as_deref()
                .map(|raw| parse_id(raw, "reply_to"))
                .transpose()?,
            created_at: decode_timestamp(&self.created_at)?,
        })
    }
}
