use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                tier        TEXT NOT NULL DEFAULT 'basic' CHECK (tier IN ('basic', 'pro')),
                created_at  TEXT NOT NULL
            );

            CREATE TABLE rooms (
                id          TEXT PRIMARY KEY,
                owner_id    TEXT NOT NULL REFERENCES users(id),
                name        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_rooms_owner
                ON rooms(owner_id, created_at);

            -- seq is the commit order
            CREATE TABLE messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                room_id     TEXT NOT NULL REFERENCES rooms(id),
                sender      TEXT NOT NULL CHECK (sender IN ('user', 'bot')),
                content     TEXT NOT NULL,
                reply_to    TEXT UNIQUE REFERENCES messages(id),
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_messages_room
                ON messages(room_id, created_at, seq);

            CREATE TABLE usage (
                user_id         TEXT NOT NULL REFERENCES users(id),
                day             TEXT NOT NULL,
                message_count   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (order messages by commit sequence)");
        conn.execute_batch(
            "
            DROP INDEX idx_messages_room;
            CREATE INDEX idx_messages_room_seq
                ON messages(room_id, seq);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
