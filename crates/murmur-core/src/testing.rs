//! Shared fixtures for the pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use murmur_db::{Database, encode_timestamp, queries};
use murmur_types::models::Tier;

use crate::clock::{Clock, ManualClock};
use crate::error::ProviderError;
use crate::provider::CompletionProvider;
use crate::queue::GenerationJob;
use crate::store::MessageStore;

/// Provider that replays a fixed script, then keeps returning `fallback`.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(
        script: impl IntoIterator<Item = Result<String, ProviderError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn repeating(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(result), _) => result,
            (None, Some(reply)) => Ok(reply.clone()),
            (None, None) => Err(ProviderError::Transport("script exhausted".into())),
        }
    }
}

/// In-memory database with one user owning one room.
pub struct Harness {
    pub db: Arc<Database>,
    pub clock: Arc<ManualClock>,
    pub store: MessageStore,
    pub user_id: Uuid,
    pub room_id: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_tier(Tier::Basic).await
    }

    pub async fn with_tier(tier: Tier) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()));
        let user_id = Uuid::new_v4();
        db.create_user(&user_id.to_string(), tier.as_str(), &encode_timestamp(clock.now()))
            .unwrap();

        let store = MessageStore::new(db.clone(), clock.clone());
        let room_id = store.create_room(user_id, "scratch".into()).await.unwrap().id;

        Self {
            db,
            clock,
            store,
            user_id,
            room_id,
        }
    }

    pub fn dyn_clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Stores a user message without touching the quota and returns the job
    /// that would have been enqueued for it.
    pub async fn pending_job(&self, prompt: &str) -> GenerationJob {
        let message_id = Uuid::new_v4();
        let created_at = encode_timestamp(self.clock.now());
        self.db
            .with_conn(|conn| {
                queries::insert_user_message(
                    conn,
                    &message_id.to_string(),
                    &self.room_id.to_string(),
                    prompt,
                    &created_at,
                )
            })
            .unwrap();

        GenerationJob {
            reply_to: message_id,
            room_id: self.room_id,
            user_id: self.user_id,
            prompt: prompt.to_string(),
        }
    }
}
