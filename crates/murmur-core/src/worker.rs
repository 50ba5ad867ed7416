//! Background completion workers.
//!
//! Each job moves `Queued -> InProgress -> Completed | Failed`. A failed job
//! still leaves a bot message in the room (an error description), so every
//! user message ends up with exactly one reply. Jobs whose reply already
//! exists are dropped as duplicates before the provider is called.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_types::models::Message;

use crate::error::ProviderError;
use crate::provider::{CompletionProvider, fallback_reply};
use crate::queue::{GenerationJob, JobQueue, JobReceiver};
use crate::store::MessageStore;

/// Bounded retry with exponential backoff. The fallback reply is written
/// only after the last attempt fails.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    /// Provider failed; an error reply was stored instead.
    Failed,
    /// A reply for this message already existed.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub reply_id: Option<Uuid>,
}

impl JobOutcome {
    fn duplicate() -> Self {
        Self {
            status: JobStatus::Duplicate,
            reply_id: None,
        }
    }
}

pub struct CompletionWorker {
    store: MessageStore,
    provider: Arc<dyn CompletionProvider>,
    retry: RetryPolicy,
}

impl CompletionWorker {
    pub fn new(store: MessageStore, provider: Arc<dyn CompletionProvider>, retry: RetryPolicy) -> Self {
        Self {
            store,
            provider,
            retry,
        }
    }

    /// Handles one job to a terminal state. Never fails: provider errors
    /// become an error reply, storage errors are logged.
    pub async fn process(&self, job: &GenerationJob) -> JobOutcome {
        match self.store.has_reply(job.reply_to).await {
            Ok(true) => {
                info!(reply_to = %job.reply_to, "Reply already stored, dropping duplicate job");
                return JobOutcome::duplicate();
            }
            Ok(false) => {}
            // The insert below is deduplicated too, so carry on
            Err(e) => warn!(reply_to = %job.reply_to, "Reply lookup failed: {:#}", e),
        }

        debug!(reply_to = %job.reply_to, status = ?JobStatus::InProgress, provider = self.provider.name());

        let (status, content) = match self.complete_with_retry(&job.prompt).await {
            Ok(text) => (JobStatus::Completed, text),
            Err(e) => {
                warn!(reply_to = %job.reply_to, "Completion failed: {}", e);
                (JobStatus::Failed, fallback_reply(&e))
            }
        };

        match self.store_reply(job, content).await {
            Ok(Some(reply)) => JobOutcome {
                status,
                reply_id: Some(reply.id),
            },
            Ok(None) => {
                info!(reply_to = %job.reply_to, "Concurrent delivery stored the reply first");
                JobOutcome::duplicate()
            }
            Err(e) => {
                // The recovery sweep picks this message up on the next start
                error!(reply_to = %job.reply_to, "Failed to store reply: {:#}", e);
                JobOutcome {
                    status: JobStatus::Failed,
                    reply_id: None,
                }
            }
        }
    }

    /// Writes the reply, retrying storage failures on the same schedule as
    /// provider calls.
    async fn store_reply(&self, job: &GenerationJob, content: String) -> anyhow::Result<Option<Message>> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .store
                .append_bot_reply(job.room_id, job.reply_to, content.clone())
                .await
            {
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(reply_to = %job.reply_to, attempt, "Storing reply failed, retrying in {:?}: {:#}", delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn complete_with_retry(&self, prompt: &str) -> Result<String, ProviderError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.provider.complete(prompt).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(attempt, max_attempts, "Provider error, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A fixed set of worker tasks sharing one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    rx: JobReceiver,
}

impl WorkerPool {
    pub fn spawn(worker: Arc<CompletionWorker>, rx: JobReceiver, workers: usize) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    worker.clone(),
                    rx.clone(),
                    shutdown.child_token(),
                ))
            })
            .collect();

        info!("Started {} completion workers", workers.max(1));
        Self {
            handles,
            shutdown,
            rx,
        }
    }

    /// Lets in-flight jobs finish, stops the workers and closes the queue.
    /// Jobs still queued are not lost: their messages have no reply yet, so
    /// the recovery sweep at the next startup re-enqueues them.
    pub async fn shutdown(self) -> usize {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Completion worker panicked: {}", e);
            }
        }

        let left = self.rx.close().await.len();
        if left > 0 {
            info!("{} queued jobs deferred to the next startup", left);
        }
        left
    }
}

async fn run_worker(
    id: usize,
    worker: Arc<CompletionWorker>,
    rx: JobReceiver,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "Completion worker running");
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let outcome = worker.process(&job).await;
        info!(worker = id, reply_to = %job.reply_to, status = ?outcome.status, "Job finished");
    }
    debug!(worker = id, "Completion worker stopped");
}

/// Re-enqueues every user message still lacking a reply. Run once at
/// startup, before the HTTP listener opens.
pub async fn recover_pending(store: &MessageStore, queue: &JobQueue) -> anyhow::Result<usize> {
    let jobs = store.pending_jobs().await?;
    let count = jobs.len();
    for job in jobs {
        debug!(reply_to = %job.reply_to, status = ?JobStatus::Queued, "Recovered job");
        queue.enqueue(job).map_err(|e| anyhow!(e))?;
    }
    if count > 0 {
        info!("Recovered {} unanswered messages", count);
    }
    Ok(count)
}
