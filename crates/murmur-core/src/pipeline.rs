use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_db::Database;
use murmur_types::api::{RoomDetail, SendReceipt, UsageReport};
use murmur_types::models::{Room, Tier};

use crate::admission::{Admission, AdmissionController};
use crate::cache::{RoomCache, decode_snapshot, encode_snapshot};
use crate::clock::Clock;
use crate::error::PipelineError;
use crate::ledger::UsageLedger;
use crate::queue::{GenerationJob, JobQueue, QueueClosed};
use crate::store::MessageStore;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Messages per UTC day for basic-tier users.
    pub basic_daily_limit: u32,
    pub room_cache_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            basic_daily_limit: 5,
            room_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Entry point for every room and message operation.
#[derive(Clone)]
pub struct Pipeline {
    store: MessageStore,
    ledger: UsageLedger,
    admission: AdmissionController,
    cache: Arc<dyn RoomCache>,
    queue: JobQueue,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        cache: Arc<dyn RoomCache>,
        queue: JobQueue,
        config: PipelineConfig,
    ) -> Self {
        let store = MessageStore::new(db.clone(), clock.clone());
        let ledger = UsageLedger::new(db, clock);
        let admission = AdmissionController::new(store.clone(), ledger.clone(), config.basic_daily_limit);
        Self {
            store,
            ledger,
            admission,
            cache,
            queue,
            config,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    // -- Rooms --

    pub async fn create_room(&self, user_id: Uuid, name: &str) -> Result<Room, PipelineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::InvalidInput("room name must not be empty".into()));
        }
        self.store
            .user(user_id)
            .await?
            .ok_or(PipelineError::UserNotFound)?;

        let room = self.store.create_room(user_id, name.to_string()).await?;

        if let Err(e) = self.cache.invalidate(user_id).await {
            // Expiry still bounds how long the stale list can be served
            warn!(user_id = %user_id, "Room cache invalidation failed: {}", e);
        }

        info!(user_id = %user_id, room_id = %room.id, "Room created");
        Ok(room)
    }

    /// Cache-aside read of the user's rooms. Cache failures degrade to a
    /// database read.
    pub async fn list_rooms(&self, user_id: Uuid) -> Result<Vec<Room>, PipelineError> {
        match self.cache.get(user_id).await {
            Ok(Some(snapshot)) => match decode_snapshot(&snapshot) {
                Ok(rooms) => {
                    debug!(user_id = %user_id, "Room list cache hit");
                    return Ok(rooms);
                }
                Err(e) => warn!(user_id = %user_id, "Discarding unreadable room snapshot: {}", e),
            },
            Ok(None) => debug!(user_id = %user_id, "Room list cache miss"),
            Err(e) => warn!(user_id = %user_id, "Room cache unavailable, reading through: {}", e),
        }

        // Read before the load so a create_room in between voids the set
        let generation = match self.cache.generation(user_id).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!(user_id = %user_id, "Room cache unavailable, not caching: {}", e);
                None
            }
        };

        let rooms = self.store.rooms_for(user_id).await?;

        let Some(generation) = generation else {
            return Ok(rooms);
        };
        match encode_snapshot(&rooms) {
            Ok(snapshot) => {
                match self
                    .cache
                    .set(user_id, snapshot, self.config.room_cache_ttl, generation)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(user_id = %user_id, "Room list changed while loading, not cached"),
                    Err(e) => warn!(user_id = %user_id, "Failed to cache room list: {}", e),
                }
            }
            Err(e) => warn!(user_id = %user_id, "Failed to serialize room list: {}", e),
        }

        Ok(rooms)
    }

    pub async fn room_detail(&self, user_id: Uuid, room_id: Uuid) -> Result<RoomDetail, PipelineError> {
        let room = self
            .store
            .room_for(user_id, room_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        let messages = self.store.messages(room_id).await?;
        Ok(RoomDetail { room, messages })
    }

    // -- Messages --

    /// Admits, persists and queues a user message, returning as soon as the
    /// job is queued. The bot reply arrives later through the workers.
    pub async fn send_message(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        content: &str,
    ) -> Result<SendReceipt, PipelineError> {
        if content.trim().is_empty() {
            return Err(PipelineError::InvalidInput("message must not be empty".into()));
        }

        let Admission::Allowed(ticket) = self.admission.admit(user_id).await? else {
            info!(user_id = %user_id, "Daily quota exhausted");
            return Err(PipelineError::QuotaExceeded);
        };

        self.store
            .room_for(user_id, room_id)
            .await?
            .ok_or(PipelineError::NotFound)?;

        let Some(message) = self
            .store
            .append_user_message(room_id, content.to_string(), ticket)
            .await?
        else {
            info!(user_id = %user_id, "Daily quota taken by a concurrent send");
            return Err(PipelineError::QuotaExceeded);
        };

        let job = GenerationJob {
            reply_to: message.id,
            room_id,
            user_id,
            prompt: message.content,
        };
        if let Err(QueueClosed(job)) = self.queue.enqueue(job) {
            warn!(reply_to = %job.reply_to, "Job queue closed; reply deferred to startup recovery");
        }

        debug!(user_id = %user_id, room_id = %room_id, message_id = %message.id, "Message queued");
        Ok(SendReceipt::queued(message.id))
    }

    // -- Subscription & usage --

    /// Applied by the billing integration. Takes effect on the next
    /// admission check.
    pub async fn set_tier(&self, user_id: Uuid, tier: Tier) -> Result<(), PipelineError> {
        if !self.store.set_tier(user_id, tier).await? {
            return Err(PipelineError::UserNotFound);
        }
        info!(user_id = %user_id, tier = %tier, "Subscription tier updated");
        Ok(())
    }

    pub async fn subscription(&self, user_id: Uuid) -> Result<Tier, PipelineError> {
        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or(PipelineError::UserNotFound)?;
        Ok(user.tier)
    }

    pub async fn usage(&self, user_id: Uuid) -> Result<UsageReport, PipelineError> {
        let tier = self.subscription(user_id).await?;
        let daily_limit = self.admission.limit_for(tier);
        let used_today = self.ledger.used_today(user_id).await?;
        Ok(UsageReport {
            tier,
            daily_limit,
            used_today,
            remaining: daily_limit.map(|limit| limit.saturating_sub(used_today)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use murmur_db::encode_timestamp;
    use tokio::sync::Notify;
    use murmur_types::models::Sender;

    use super::*;
    use crate::cache::MemoryRoomCache;
    use crate::error::{CacheError, ProviderError};
    use crate::queue::{JobReceiver, job_queue};
    use crate::testing::{Harness, ScriptedProvider};
    use crate::worker::{CompletionWorker, JobStatus, RetryPolicy};

    struct Setup {
        h: Harness,
        pipeline: Pipeline,
        rx: JobReceiver,
    }

    async fn setup(tier: Tier) -> Setup {
        let h = Harness::with_tier(tier).await;
        let cache = Arc::new(MemoryRoomCache::new(h.dyn_clock()));
        setup_with_cache(h, cache)
    }

    fn setup_with_cache(h: Harness, cache: Arc<dyn RoomCache>) -> Setup {
        let (queue, rx) = job_queue();
        let pipeline = Pipeline::new(h.db.clone(), h.dyn_clock(), cache, queue, PipelineConfig::default());
        Setup { h, pipeline, rx }
    }

    fn add_user(h: &Harness, tier: Tier) -> Uuid {
        let id = Uuid::new_v4();
        h.db.create_user(&id.to_string(), tier.as_str(), "2026-03-14T00:00:00.000000Z")
            .unwrap();
        id
    }

    struct BrokenCache;

    #[async_trait]
    impl RoomCache for BrokenCache {
        async fn get(&self, _: Uuid) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn generation(&self, _: Uuid) -> Result<u64, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: Uuid, _: String, _: Duration, _: u64) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn invalidate(&self, _: Uuid) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    /// Holds the first `set` until released, to interleave a writer with a
    /// concurrent room creation.
    struct GatedCache {
        inner: MemoryRoomCache,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RoomCache for GatedCache {
        async fn get(&self, user_id: Uuid) -> Result<Option<String>, CacheError> {
            self.inner.get(user_id).await
        }
        async fn generation(&self, user_id: Uuid) -> Result<u64, CacheError> {
            self.inner.generation(user_id).await
        }
        async fn set(
            &self,
            user_id: Uuid,
            snapshot: String,
            ttl: Duration,
            generation: u64,
        ) -> Result<bool, CacheError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.set(user_id, snapshot, ttl, generation).await
        }
        async fn invalidate(&self, user_id: Uuid) -> Result<(), CacheError> {
            self.inner.invalidate(user_id).await
        }
    }

    #[tokio::test]
    async fn basic_user_gets_five_messages_a_day() {
        let s = setup(Tier::Basic).await;
        let (user, room) = (s.h.user_id, s.h.room_id);

        for i in 0..5 {
            s.pipeline.send_message(user, room, &format!("message {}", i)).await.unwrap();
        }
        let err = s.pipeline.send_message(user, room, "one too many").await.unwrap_err();
        assert!(matches!(err, PipelineError::QuotaExceeded));

        let detail = s.pipeline.room_detail(user, room).await.unwrap();
        assert_eq!(detail.messages.len(), 5);
        assert_eq!(s.pipeline.usage(user).await.unwrap().used_today, 5);
    }

    #[tokio::test]
    async fn quota_resets_on_the_next_day() {
        let s = setup(Tier::Basic).await;
        let (user, room) = (s.h.user_id, s.h.room_id);
        for _ in 0..5 {
            s.pipeline.send_message(user, room, "hi").await.unwrap();
        }
        assert!(s.pipeline.send_message(user, room, "hi").await.is_err());

        s.h.clock.advance(chrono::Duration::days(1));
        s.pipeline.send_message(user, room, "good morning").await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_to_pro_lifts_the_limit_immediately() {
        let s = setup(Tier::Basic).await;
        let (user, room) = (s.h.user_id, s.h.room_id);
        for _ in 0..5 {
            s.pipeline.send_message(user, room, "hi").await.unwrap();
        }
        assert!(matches!(
            s.pipeline.send_message(user, room, "hi").await,
            Err(PipelineError::QuotaExceeded)
        ));

        s.pipeline.set_tier(user, Tier::Pro).await.unwrap();
        s.pipeline.send_message(user, room, "now unlimited").await.unwrap();
        assert_eq!(s.pipeline.subscription(user).await.unwrap(), Tier::Pro);
    }

    #[tokio::test]
    async fn pro_user_is_never_throttled() {
        let s = setup(Tier::Pro).await;
        for _ in 0..12 {
            s.pipeline.send_message(s.h.user_id, s.h.room_id, "again").await.unwrap();
        }
        let usage = s.pipeline.usage(s.h.user_id).await.unwrap();
        assert_eq!(usage.daily_limit, None);
        assert_eq!(usage.remaining, None);
        assert_eq!(usage.used_today, 12);
    }

    #[tokio::test]
    async fn unknown_room_is_rejected_without_charging() {
        let s = setup(Tier::Basic).await;
        let err = s
            .pipeline
            .send_message(s.h.user_id, Uuid::new_v4(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound));
        assert_eq!(s.pipeline.usage(s.h.user_id).await.unwrap().used_today, 0);
    }

    #[tokio::test]
    async fn foreign_room_is_not_found() {
        let s = setup(Tier::Basic).await;
        let mallory = add_user(&s.h, Tier::Pro);

        let send = s.pipeline.send_message(mallory, s.h.room_id, "let me in").await;
        assert!(matches!(send, Err(PipelineError::NotFound)));
        let detail = s.pipeline.room_detail(mallory, s.h.room_id).await;
        assert!(matches!(detail, Err(PipelineError::NotFound)));
    }

    #[tokio::test]
    async fn quota_is_checked_before_ownership() {
        let s = setup(Tier::Basic).await;
        for _ in 0..5 {
            s.pipeline.send_message(s.h.user_id, s.h.room_id, "hi").await.unwrap();
        }
        let err = s
            .pipeline
            .send_message(s.h.user_id, Uuid::new_v4(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QuotaExceeded));
    }

    #[tokio::test]
    async fn blank_message_is_invalid() {
        let s = setup(Tier::Basic).await;
        let err = s.pipeline.send_message(s.h.user_id, s.h.room_id, "   ").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_sender_is_reported() {
        let s = setup(Tier::Basic).await;
        let err = s
            .pipeline
            .send_message(Uuid::new_v4(), s.h.room_id, "who am i")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UserNotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_never_exceed_the_limit() {
        let s = setup(Tier::Basic).await;
        let sends: Vec<_> = (0..20)
            .map(|i| {
                let pipeline = s.pipeline.clone();
                let (user, room) = (s.h.user_id, s.h.room_id);
                tokio::spawn(async move { pipeline.send_message(user, room, &format!("burst {}", i)).await })
            })
            .collect();

        let mut accepted = 0;
        for send in sends {
            match send.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(PipelineError::QuotaExceeded) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(accepted, 5);
        assert_eq!(s.pipeline.usage(s.h.user_id).await.unwrap().used_today, 5);
        let detail = s.pipeline.room_detail(s.h.user_id, s.h.room_id).await.unwrap();
        assert_eq!(detail.messages.len(), 5);
    }

    #[tokio::test]
    async fn send_enqueues_a_job_for_the_stored_message() {
        let s = setup(Tier::Basic).await;
        let receipt = s.pipeline.send_message(s.h.user_id, s.h.room_id, "hello bot").await.unwrap();
        assert_eq!(receipt.status, "queued");

        let job = s.rx.recv().await.unwrap();
        assert_eq!(job.reply_to, receipt.message_id);
        assert_eq!(job.room_id, s.h.room_id);
        assert_eq!(job.prompt, "hello bot");
    }

    #[tokio::test]
    async fn send_survives_a_closed_queue() {
        let s = setup(Tier::Basic).await;
        s.rx.close().await;

        let receipt = s.pipeline.send_message(s.h.user_id, s.h.room_id, "late").await.unwrap();
        let pending = s.pipeline.store().pending_jobs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].reply_to, receipt.message_id);
    }

    #[tokio::test]
    async fn new_room_shows_up_despite_cached_list() {
        let s = setup(Tier::Basic).await;
        let before = s.pipeline.list_rooms(s.h.user_id).await.unwrap();
        assert_eq!(before.len(), 1);

        let room = s.pipeline.create_room(s.h.user_id, "A").await.unwrap();
        s.pipeline.send_message(s.h.user_id, room.id, "first!").await.unwrap();

        let after = s.pipeline.list_rooms(s.h.user_id).await.unwrap();
        assert!(after.iter().any(|r| r.name == "A"));
    }

    #[tokio::test]
    async fn cached_list_is_served_until_it_expires() {
        let s = setup(Tier::Basic).await;
        let first = s.pipeline.list_rooms(s.h.user_id).await.unwrap();
        let second = s.pipeline.list_rooms(s.h.user_id).await.unwrap();
        assert_eq!(first, second);

        // Written behind the pipeline's back, so nothing invalidates the cache
        let ts = encode_timestamp(s.h.clock.now());
        s.h.db
            .create_room(&Uuid::new_v4().to_string(), &s.h.user_id.to_string(), "sneaky", &ts)
            .unwrap();
        assert_eq!(s.pipeline.list_rooms(s.h.user_id).await.unwrap(), first);

        s.h.clock.advance(chrono::Duration::seconds(301));
        assert_eq!(s.pipeline.list_rooms(s.h.user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_loaded_before_a_room_was_created_is_not_cached() {
        let h = Harness::new().await;
        let gate = Arc::new(GatedCache {
            inner: MemoryRoomCache::new(h.dyn_clock()),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let s = setup_with_cache(h, gate.clone());
        let user = s.h.user_id;

        let slow_reader = {
            let pipeline = s.pipeline.clone();
            tokio::spawn(async move { pipeline.list_rooms(user).await })
        };
        gate.entered.notified().await;

        s.pipeline.create_room(user, "X").await.unwrap();
        gate.release.notify_one();
        let stale = slow_reader.await.unwrap().unwrap();
        assert_eq!(stale.len(), 1);

        let rooms = s.pipeline.list_rooms(user).await.unwrap();
        assert!(rooms.iter().any(|r| r.name == "X"));
    }

    #[tokio::test]
    async fn broken_cache_degrades_to_database_reads() {
        let h = Harness::new().await;
        let s = setup_with_cache(h, Arc::new(BrokenCache));

        s.pipeline.create_room(s.h.user_id, "still works").await.unwrap();
        let rooms = s.pipeline.list_rooms(s.h.user_id).await.unwrap();
        assert_eq!(rooms.len(), 2);
    }

    #[tokio::test]
    async fn blank_room_name_is_invalid() {
        let s = setup(Tier::Basic).await;
        let err = s.pipeline.create_room(s.h.user_id, "  ").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn room_detail_includes_replies_in_order() {
        let s = setup(Tier::Basic).await;
        let provider = ScriptedProvider::new([Ok("first answer".into()), Err(ProviderError::Timeout)]);
        let worker = CompletionWorker::new(
            s.pipeline.store().clone(),
            provider,
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
            },
        );

        s.pipeline.send_message(s.h.user_id, s.h.room_id, "question one").await.unwrap();
        s.pipeline.send_message(s.h.user_id, s.h.room_id, "question two").await.unwrap();
        let first = worker.process(&s.rx.recv().await.unwrap()).await;
        let second = worker.process(&s.rx.recv().await.unwrap()).await;
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(second.status, JobStatus::Failed);

        let detail = s.pipeline.room_detail(s.h.user_id, s.h.room_id).await.unwrap();
        let senders: Vec<Sender> = detail.messages.iter().map(|m| m.sender).collect();
        assert_eq!(senders, [Sender::User, Sender::User, Sender::Bot, Sender::Bot]);
        assert!(detail.messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let bot_replies: Vec<_> = detail.messages.iter().filter(|m| m.sender == Sender::Bot).collect();
        assert_eq!(bot_replies[0].content, "first answer");
        assert!(bot_replies[1].content.starts_with("[Assistant error"));
    }

    #[tokio::test]
    async fn reply_follows_its_prompt_when_the_clock_steps_back() {
        let s = setup(Tier::Basic).await;
        let worker = CompletionWorker::new(
            s.pipeline.store().clone(),
            ScriptedProvider::repeating("answer"),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
            },
        );

        s.pipeline.send_message(s.h.user_id, s.h.room_id, "question").await.unwrap();
        s.h.clock.advance(chrono::Duration::seconds(-2));
        worker.process(&s.rx.recv().await.unwrap()).await;
        s.pipeline.send_message(s.h.user_id, s.h.room_id, "follow-up").await.unwrap();

        let detail = s.pipeline.room_detail(s.h.user_id, s.h.room_id).await.unwrap();
        let senders: Vec<Sender> = detail.messages.iter().map(|m| m.sender).collect();
        assert_eq!(senders, [Sender::User, Sender::Bot, Sender::User]);
        assert_eq!(detail.messages[2].content, "follow-up");
        assert!(detail.messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn usage_report_counts_down() {
        let s = setup(Tier::Basic).await;
        s.pipeline.send_message(s.h.user_id, s.h.room_id, "one").await.unwrap();
        s.pipeline.send_message(s.h.user_id, s.h.room_id, "two").await.unwrap();

        let usage = s.pipeline.usage(s.h.user_id).await.unwrap();
        assert_eq!(
            usage,
            UsageReport {
                tier: Tier::Basic,
                daily_limit: Some(5),
                used_today: 2,
                remaining: Some(3),
            }
        );
    }

    #[tokio::test]
    async fn set_tier_on_unknown_user_fails() {
        let s = setup(Tier::Basic).await;
        let err = s.pipeline.set_tier(Uuid::new_v4(), Tier::Pro).await.unwrap_err();
        assert!(matches!(err, PipelineError::UserNotFound));
    }
}
