use crate::models::{MessageRow, PendingPromptRow, RoomRow, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, tier: &str, created_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, tier, created_at) VALUES (?1, ?2, ?3)",
                (id, tier, created_at),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    /// Returns false when no such user exists.
    pub fn set_user_tier(&self, id: &str, tier: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute("UPDATE users SET tier = ?1 WHERE id = ?2", (tier, id))?;
            Ok(updated > 0)
        })
    }

    // -- Rooms --

    pub fn create_room(&self, id: &str, owner_id: &str, name: &str, created_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (id, owner_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, owner_id, name, created_at),
            )?;
            Ok(())
        })
    }

    pub fn get_rooms_for_owner(&self, owner_id: &str) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, name, created_at FROM rooms
                 WHERE owner_id = ?1
                 ORDER BY created_at, rowid",
            )?;
            let rows = stmt
                .query_map([owner_id], map_room)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Owner-scoped lookup: a room owned by someone else is reported as absent.
    pub fn get_room_for_owner(&self, id: &str, owner_id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, owner_id, name, created_at FROM rooms WHERE id = ?1 AND owner_id = ?2",
                (id, owner_id),
                map_room,
            )
            .optional()
        })
    }

    // -- Messages --

    pub fn get_messages(&self, room_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, room_id))
    }

    pub fn has_reply(&self, reply_to: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE reply_to = ?1)",
                [reply_to],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    /// User messages still waiting for a bot reply, oldest first.
    pub fn get_pending_prompts(&self) -> Result<Vec<PendingPromptRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.room_id, r.owner_id, m.content
                 FROM messages m
                 JOIN rooms r ON r.id = m.room_id
                 WHERE m.sender = 'user'
                   AND NOT EXISTS (SELECT 1 FROM messages b WHERE b.reply_to = m.id)
                 ORDER BY m.seq",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(PendingPromptRow {
                        message_id: row.get(0)?,
                        room_id: row.get(1)?,
                        owner_id: row.get(2)?,
                        content: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

/// Inserts a user message. Callers run this inside the transaction that also
/// charges the sender's daily quota.
pub fn insert_user_message(
    conn: &Connection,
    id: &str,
    room_id: &str,
    content: &str,
    created_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, room_id, sender, content, created_at) VALUES (?1, ?2, 'user', ?3, ?4)",
        (id, room_id, content, created_at),
    )?;
    Ok(())
}

/// Inserts a bot reply unless one already exists for `reply_to`.
/// Returns whether a row was written.
pub fn insert_bot_reply(
    conn: &Connection,
    id: &str,
    room_id: &str,
    reply_to: &str,
    content: &str,
    created_at: &str,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO messages (id, room_id, sender, content, reply_to, created_at)
         VALUES (?1, ?2, 'bot', ?3, ?4, ?5)
         ON CONFLICT(reply_to) DO NOTHING",
        (id, room_id, content, reply_to, created_at),
    )?;
    Ok(inserted > 0)
}

/// Creation time of the newest message in a room, if any.
pub fn latest_message_time(conn: &Connection, room_id: &str) -> Result<Option<String>> {
    let latest = conn.query_row(
        "SELECT MAX(created_at) FROM messages WHERE room_id = ?1",
        [room_id],
        |row| row.get(0),
    )?;
    Ok(latest)
}

fn query_user(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare("SELECT id, tier, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                tier: row.get(1)?,
                created_at: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_messages(conn: &Connection, room_id: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, sender, content, reply_to, created_at
         FROM messages
         WHERE room_id = ?1
         ORDER BY seq ASC",
    )?;

    let rows = stmt
        .query_map([room_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                sender: row.get(2)?,
                content: row.get(3)?,
                reply_to: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn map_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
