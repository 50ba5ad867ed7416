use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use murmur_db::{Database, DbConnection, decode_timestamp, encode_timestamp, queries};
use murmur_types::models::{Message, Room, Sender, Tier, User};

use crate::admission::SendTicket;
use crate::clock::Clock;
use crate::queue::GenerationJob;

/// Runs a blocking database closure on the blocking thread pool.
pub(crate) async fn run_blocking<F, T>(db: &Arc<Database>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
}

/// Creation time for a new message in `room_id`, read under the database
/// lock and never earlier than the room's newest message, so times follow
/// commit order even when the system clock steps back.
fn stamp(conn: &DbConnection, clock: &dyn Clock, room_id: Uuid) -> anyhow::Result<DateTime<Utc>> {
    let now = clock.now().trunc_subsecs(6);
    match queries::latest_message_time(conn, &room_id.to_string())? {
        Some(raw) => Ok(now.max(decode_timestamp(&raw)?)),
        None => Ok(now),
    }
}

/// Durable store for users, rooms and messages. Messages are ordered by
/// commit sequence.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    // -- Users --

    pub async fn user(&self, user_id: Uuid) -> anyhow::Result<Option<User>> {
        run_blocking(&self.db, move |db| {
            db.get_user(&user_id.to_string())?
                .map(|row| row.into_user())
                .transpose()
        })
        .await
    }

    /// Returns false when the user does not exist.
    pub async fn set_tier(&self, user_id: Uuid, tier: Tier) -> anyhow::Result<bool> {
        run_blocking(&self.db, move |db| {
            db.set_user_tier(&user_id.to_string(), tier.as_str())
        })
        .await
    }

    // -- Rooms --

    pub async fn create_room(&self, owner_id: Uuid, name: String) -> anyhow::Result<Room> {
        let room = Room {
            id: Uuid::new_v4(),
            owner_id,
            name,
            created_at: self.clock.now(),
        };
        let row = room.clone();
        run_blocking(&self.db, move |db| {
            db.create_room(
                &row.id.to_string(),
                &row.owner_id.to_string(),
                &row.name,
                &encode_timestamp(row.created_at),
            )
        })
        .await?;
        Ok(room)
    }

    pub async fn rooms_for(&self, owner_id: Uuid) -> anyhow::Result<Vec<Room>> {
        run_blocking(&self.db, move |db| {
            db.get_rooms_for_owner(&owner_id.to_string())?
                .into_iter()
                .map(|row| row.into_room())
                .collect()
        })
        .await
    }

    pub async fn room_for(&self, owner_id: Uuid, room_id: Uuid) -> anyhow::Result<Option<Room>> {
        run_blocking(&self.db, move |db| {
            db.get_room_for_owner(&room_id.to_string(), &owner_id.to_string())?
                .map(|row| row.into_room())
                .transpose()
        })
        .await
    }

    // -- Messages --

    /// Messages of a room in creation order.
    pub async fn messages(&self, room_id: Uuid) -> anyhow::Result<Vec<Message>> {
        run_blocking(&self.db, move |db| {
            db.get_messages(&room_id.to_string())?
                .into_iter()
                .map(|row| row.into_message())
                .collect()
        })
        .await
    }

    /// Persists a user message and charges `ticket` in one transaction.
    /// The send is counted on the day the message is stamped. Returns `None`
    /// (and writes nothing) if the quota ran out between the admission check
    /// and this write.
    pub async fn append_user_message(
        &self,
        room_id: Uuid,
        content: String,
        ticket: SendTicket,
    ) -> anyhow::Result<Option<Message>> {
        let clock = self.clock.clone();
        let (committed, message) = run_blocking(&self.db, move |db| {
            db.with_tx(|conn| {
                let message = Message {
                    id: Uuid::new_v4(),
                    room_id,
                    sender: Sender::User,
                    content,
                    reply_to: None,
                    created_at: stamp(conn, clock.as_ref(), room_id)?,
                };
                queries::insert_user_message(
                    conn,
                    &message.id.to_string(),
                    &room_id.to_string(),
                    &message.content,
                    &encode_timestamp(message.created_at),
                )?;
                let count = ticket.record_send(conn, message.created_at.date_naive())?;
                Ok((count.is_some(), message))
            })
        })
        .await?;

        Ok(committed.then_some(message))
    }

    /// Appends the bot reply for `reply_to`. Returns `None` if a reply was
    /// already stored by an earlier delivery of the same job.
    pub async fn append_bot_reply(
        &self,
        room_id: Uuid,
        reply_to: Uuid,
        content: String,
    ) -> anyhow::Result<Option<Message>> {
        let clock = self.clock.clone();
        run_blocking(&self.db, move |db| {
            db.with_conn(|conn| {
                let message = Message {
                    id: Uuid::new_v4(),
                    room_id,
                    sender: Sender::Bot,
                    content,
                    reply_to: Some(reply_to),
                    created_at: stamp(conn, clock.as_ref(), room_id)?,
                };
                let inserted = queries::insert_bot_reply(
                    conn,
                    &message.id.to_string(),
                    &room_id.to_string(),
                    &reply_to.to_string(),
                    &message.content,
                    &encode_timestamp(message.created_at),
                )?;
                Ok(inserted.then_some(message))
            })
        })
        .await
    }

    pub async fn has_reply(&self, reply_to: Uuid) -> anyhow::Result<bool> {
        run_blocking(&self.db, move |db| db.has_reply(&reply_to.to_string())).await
    }

    /// Rebuilds jobs for user messages that never got a reply, oldest first.
    pub async fn pending_jobs(&self) -> anyhow::Result<Vec<GenerationJob>> {
        run_blocking(&self.db, |db| {
            db.get_pending_prompts()?
                .into_iter()
                .map(|row| -> anyhow::Result<GenerationJob> {
                    Ok(GenerationJob {
                        reply_to: row.message_id.parse()?,
                        room_id: row.room_id.parse()?,
                        user_id: row.owner_id.parse()?,
                        prompt: row.content,
                    })
                })
                .collect()
        })
        .await
    }
}
