//! Per-user, per-day message counters.
//!
//! These functions take a bare `Connection` so callers can run them inside
//! the same transaction as the message insert they account for.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;

use crate::queries::OptionalExt;

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Creates today's record with a zero count if it does not exist yet and
/// returns the current count. Creation never counts as a send.
pub fn ensure_record(conn: &Connection, user_id: &str, day: NaiveDate) -> Result<u32> {
    let day = day_key(day);
    conn.execute(
        "INSERT OR IGNORE INTO usage (user_id, day, message_count) VALUES (?1, ?2, 0)",
        (user_id, &day),
    )?;
    let count = conn.query_row(
        "SELECT message_count FROM usage WHERE user_id = ?1 AND day = ?2",
        (user_id, &day),
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Current count without creating a record.
pub fn count(conn: &Connection, user_id: &str, day: NaiveDate) -> Result<u32> {
    let count = conn
        .query_row(
            "SELECT message_count FROM usage WHERE user_id = ?1 AND day = ?2",
            (user_id, day_key(day)),
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

/// Atomic increment-and-compare. Bumps the counter only while it is below
/// `limit` (`None` is unlimited) and returns the new count, or `None` when the
/// limit was already reached. The record is created on first use.
pub fn try_increment(
    conn: &Connection,
    user_id: &str,
    day: NaiveDate,
    limit: Option<u32>,
) -> Result<Option<u32>> {
    if limit == Some(0) {
        return Ok(None);
    }

    conn.query_row(
        "INSERT INTO usage (user_id, day, message_count) VALUES (?1, ?2, 1)
         ON CONFLICT(user_id, day) DO UPDATE SET message_count = message_count + 1
         WHERE ?3 IS NULL OR usage.message_count < ?3
         RETURNING message_count",
        rusqlite::params![user_id, day_key(day), limit],
        |row| row.get(0),
    )
    .optional()
}
