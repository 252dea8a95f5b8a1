//! Validation worker pool
//!
//! A bounded mpsc queue feeds a fixed set of workers. Retries are delayed
//! by `backoff_base * 2^attempt` and re-enter the same queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ValidationConfig;
use crate::validator::{ChallengeValidator, ValidationJob, ValidationOutcome};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation queue is closed")]
    Closed,
}

/// Where challenge responses hand off validation work
#[async_trait]
pub trait ValidationQueue: Send + Sync {
    async fn enqueue(&self, job: ValidationJob) -> Result<(), QueueError>;
}

#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::Sender<ValidationJob>,
}

#[async_trait]
impl ValidationQueue for ChannelQueue {
    async fn enqueue(&self, job: ValidationJob) -> Result<(), QueueError> {
        self.sender.send(job).await.map_err(|_| QueueError::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub backoff_base: Duration,
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base: Duration::from_secs(2),
            queue_capacity: 1024,
        }
    }
}

impl From<&ValidationConfig> for WorkerPoolConfig {
    fn from(config: &ValidationConfig) -> Self {
        Self {
            workers: config.workers,
            backoff_base: config.backoff_base(),
            ..Default::default()
        }
    }
}

/// Delay before retrying after attempt `attempt` failed
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start the workers; the returned queue is their only input
    pub fn spawn(validator: Arc<ChallengeValidator>, config: WorkerPoolConfig) -> (ChannelQueue, WorkerPool) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    validator.clone(),
                    sender.downgrade(),
                    config.backoff_base,
                ))
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Validation workers started");
        (ChannelQueue { sender }, WorkerPool { handles })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
        info!("Validation workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<ValidationJob>>>,
    validator: Arc<ChallengeValidator>,
    retry_sender: mpsc::WeakSender<ValidationJob>,
    backoff_base: Duration,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            debug!(worker_id, "Validation queue closed");
            break;
        };

        debug!(worker_id, challenge_id = %job.challenge_id, attempt = job.attempt, "Validating challenge");
        match validator.validate(&job.challenge_id, job.attempt).await {
            Ok(ValidationOutcome::Retry(_)) => {
                schedule_retry(job, retry_sender.clone(), backoff_base);
            }
            Ok(_) => {}
            Err(err) => {
                error!(worker_id, challenge_id = %job.challenge_id, error = %err, "Validation attempt errored");
                let outcome = validator
                    .settle_errored_attempt(&job.challenge_id, job.attempt, err)
                    .await;
                if let ValidationOutcome::Retry(_) = outcome {
                    schedule_retry(job, retry_sender.clone(), backoff_base);
                }
            }
        }
    }
}

fn schedule_retry(job: ValidationJob, sender: mpsc::WeakSender<ValidationJob>, backoff_base: Duration) {
    let delay = backoff_delay(backoff_base, job.attempt);
    let next = ValidationJob {
        challenge_id: job.challenge_id,
        attempt: job.attempt + 1,
    };

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(sender) = sender.upgrade() else {
            return;
        };
        if sender.send(next.clone()).await.is_err() {
            warn!(challenge_id = %next.challenge_id, "Dropped retry, validation queue closed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_saturates() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 40), backoff_delay(base, 16));
    }

    #[tokio::test]
    async fn test_closed_queue_reports_error() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let queue = ChannelQueue { sender };
        let err = queue
            .enqueue(ValidationJob {
                challenge_id: "c".into(),
                attempt: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
