use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use murmur_types::models::Room;

use crate::clock::Clock;
use crate::error::CacheError;

/// Key under which a user's room list snapshot is stored.
pub fn room_list_key(user_id: Uuid) -> String {
    format!("rooms:{}", user_id)
}

/// Serializes a room list. `DateTime<Utc>` goes out as RFC 3339 with full
/// sub-second precision, so the snapshot round-trips exactly.
pub fn encode_snapshot(rooms: &[Room]) -> Result<String, serde_json::Error> {
    serde_json::to_string(rooms)
}

pub fn decode_snapshot(snapshot: &str) -> Result<Vec<Room>, serde_json::Error> {
    serde_json::from_str(snapshot)
}

/// Key/value store for room list snapshots. Expiry is authoritative;
/// `invalidate` only shortens the staleness window.
///
/// Each user's key carries a generation that `invalidate` bumps. A writer
/// reads the generation before loading from the database and passes it to
/// `set`, which stores nothing if an invalidation happened in between, so a
/// list loaded before a room was created can never be cached after it.
#[async_trait]
pub trait RoomCache: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<String>, CacheError>;

    async fn generation(&self, user_id: Uuid) -> Result<u64, CacheError>;

    /// Stores `snapshot` if the user's generation is still `generation`.
    /// Returns whether it was stored.
    async fn set(
        &self,
        user_id: Uuid,
        snapshot: String,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheError>;

    async fn invalidate(&self, user_id: Uuid) -> Result<(), CacheError>;
}

struct CacheEntry {
    snapshot: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // Kept across purges: dropping a counter would let it repeat
    generations: HashMap<String, u64>,
}

/// In-process TTL cache.
pub struct MemoryRoomCache {
    state: RwLock<CacheState>,
    clock: Arc<dyn Clock>,
}

impl MemoryRoomCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            clock,
        }
    }

    /// Drops every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.expires_at > now);
        before - state.entries.len()
    }
}

/// Background task that evicts expired room lists so idle users don't pin
/// memory.
pub async fn run_purge_loop(cache: Arc<MemoryRoomCache>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let purged = cache.purge_expired().await;
        if purged > 0 {
            debug!("Cache purge: dropped {} expired room lists", purged);
        }
    }
}

#[async_trait]
impl RoomCache for MemoryRoomCache {
    async fn get(&self, user_id: Uuid) -> Result<Option<String>, CacheError> {
        let key = room_list_key(user_id);
        let now = self.clock.now();

        {
            let state = self.state.read().await;
            match state.entries.get(&key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.snapshot.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: remove unless a fresh set raced in meanwhile
        let mut state = self.state.write().await;
        if state.entries.get(&key).is_some_and(|entry| entry.expires_at <= now) {
            state.entries.remove(&key);
        }
        Ok(None)
    }

    async fn generation(&self, user_id: Uuid) -> Result<u64, CacheError> {
        let state = self.state.read().await;
        Ok(state.generations.get(&room_list_key(user_id)).copied().unwrap_or(0))
    }

    async fn set(
        &self,
        user_id: Uuid,
        snapshot: String,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Unavailable(format!("invalid ttl: {}", e)))?;
        let key = room_list_key(user_id);

        let mut state = self.state.write().await;
        if state.generations.get(&key).copied().unwrap_or(0) != generation {
            return Ok(false);
        }
        let entry = CacheEntry {
            snapshot,
            expires_at: self.clock.now() + ttl,
        };
        state.entries.insert(key, entry);
        Ok(true)
    }

    async fn invalidate(&self, user_id: Uuid) -> Result<(), CacheError> {
        let key = room_list_key(user_id);
        let mut state = self.state.write().await;
        state.entries.remove(&key);
        *state.generations.entry(key).or_insert(0) += 1;
        Ok(())
    }
}
