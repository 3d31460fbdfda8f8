//! Async retry queue: the dispatcher schedules retries through this
//! abstraction rather than sleeping in-process, so the scheduling policy
//! can be swapped (e.g. for a durable queue) without touching dispatch logic.

use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// A unit of retry work: dispatch the event with this internal id again.
#[derive(Debug, Clone)]
pub struct RetryJob {
    pub event_id: String,
    pub attempt: u32,
}

/// The async queue contract. A job scheduled with a delay becomes available
/// to [`RetryQueue::recv`] only after that delay has elapsed.
#[async_trait::async_trait]
pub trait RetryQueue: Send + Sync {
    async fn schedule(&self, job: RetryJob, delay: Duration);
    async fn recv(&self) -> Option<RetryJob>;
}

/// Exponential backoff with jitter: base 1s, capped at `max_delay`, ±20%
/// jitter to avoid synchronized retry storms across many events.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(max.as_millis());

    let mut rng = rand::thread_rng();
    let jitter_frac: f64 = rng.gen_range(-0.2..=0.2);
    let jittered = (capped as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// In-process retry queue backed by a tokio channel and a per-job delayed
/// task. Suitable for a single-instance deployment; a durable queue can
/// implement the same [`RetryQueue`] trait for multi-instance deployments.
pub struct InProcessQueue {
    sender: mpsc::UnboundedSender<RetryJob>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<RetryJob>>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RetryQueue for InProcessQueue {
    async fn schedule(&self, job: RetryJob, delay: Duration) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = sender.send(job);
        });
    }

    async fn recv(&self) -> Option<RetryJob> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_grows_exponentially_before_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        // With jitter of up to 20%, bound checks need slack either side.
        for attempt in 0..4 {
            let delay = backoff_delay(attempt, base, max);
            let expected_ms = 1000u128 * (1u128 << attempt);
            let lower = (expected_ms as f64 * 0.75) as u128;
            let upper = (expected_ms as f64 * 1.25) as u128;
            let actual = delay.as_millis();
            assert!(
                actual >= lower && actual <= upper,
                "attempt {attempt}: {actual} not in [{lower}, {upper}]"
            );
        }
    }

    #[test]
    fn backoff_respects_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let delay = backoff_delay(10, base, max);
        assert!(delay.as_millis() <= (60_000.0 * 1.25) as u128);
    }

    #[tokio::test]
    async fn scheduled_job_arrives_after_delay() {
        let queue = InProcessQueue::new();
        queue
            .schedule(
                RetryJob {
                    event_id: "evt_1".to_string(),
                    attempt: 1,
                },
                Duration::from_millis(10),
            )
            .await;

        let job = queue.recv().await.unwrap();
        assert_eq!(job.event_id, "evt_1");
        assert_eq!(job.attempt, 1);
    }
}
