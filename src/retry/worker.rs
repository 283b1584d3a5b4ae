use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::payments::PaymentService;
use crate::retry::queue::RetryQueue;

/// Entries taken per sweep
pub const BATCH_SIZE: usize = 550;
/// Pause after a sweep that left the queue empty
pub const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// Background workers re-dispatching queued payloads.
///
/// No backoff and no attempt cap: a payload that keeps failing cycles
/// through the queue until it succeeds or is dropped for lack of room.
pub struct RetryWorker {
    queue: Arc<RetryQueue>,
    service: Arc<PaymentService>,
    workers: usize,
}

impl RetryWorker {
    pub fn new(queue: Arc<RetryQueue>, service: Arc<PaymentService>, workers: usize) -> Self {
        Self {
            queue,
            service,
            workers: workers.max(1),
        }
    }

    /// Start the workers (run in background)
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(
            "🔁 Starting {} retry worker(s), queue capacity {}",
            self.workers,
            self.queue.capacity()
        );

        (0..self.workers)
            .map(|id| {
                let queue = self.queue.clone();
                let service = self.service.clone();
                tokio::spawn(async move {
                    loop {
                        let swept = Self::sweep(&queue, &service).await;
                        if swept > 0 {
                            debug!(
                                "Retry worker {} swept {} payloads ({} queued, {} dropped so far)",
                                id,
                                swept,
                                queue.len(),
                                queue.dropped()
                            );
                        }
                        if swept < BATCH_SIZE {
                            tokio::time::sleep(IDLE_SLEEP).await;
                        }
                    }
                })
            })
            .collect()
    }

    /// Process one batch. Returns how many entries were taken off the queue.
    pub async fn sweep(queue: &RetryQueue, service: &PaymentService) -> usize {
        let batch = queue.drain_batch(BATCH_SIZE);
        let taken = batch.len();

        for payload in batch {
            match service.process_payment(&payload).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    debug!("Retry failed again: {}", e);
                    queue.enqueue(payload);
                }
                Err(e) => warn!("Dropping queued payload: {}", e),
            }
        }

        taken
    }
}
