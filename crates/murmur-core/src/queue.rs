use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Request to generate the bot reply for one user message. `reply_to` is the
/// triggering message id and doubles as the idempotency token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationJob {
    pub reply_to: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub prompt: String,
}

#[derive(Debug, thiserror::Error)]
#[error("job queue is closed")]
pub struct QueueClosed(pub GenerationJob);

/// Producer half of the job queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<GenerationJob>,
}

/// Consumer half, shared by every worker in the pool.
#[derive(Clone)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<GenerationJob>>>,
}

pub fn job_queue() -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        JobQueue { tx },
        JobReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl JobQueue {
    /// Never blocks. Fails only once every receiver is gone.
    pub fn enqueue(&self, job: GenerationJob) -> Result<(), QueueClosed> {
        self.tx.send(job).map_err(|e| QueueClosed(e.0))
    }
}

impl JobReceiver {
    /// Waits for the next job. `None` once all producers are dropped and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<GenerationJob> {
        self.rx.lock().await.recv().await
    }

    /// Closes the queue to new jobs and returns whatever was still waiting.
    pub async fn close(&self) -> Vec<GenerationJob> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut left = Vec::new();
        while let Ok(job) = rx.try_recv() {
            left.push(job);
        }
        left
    }
}
