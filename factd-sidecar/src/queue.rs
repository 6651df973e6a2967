//! Per-graph transaction queue.
//!
//! Jobs run strictly in submission order, one at a time, each on the
//! blocking pool. The next job starts only after the previous one has
//! committed or failed.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{SidecarError, SidecarResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
}

impl QueueStats {
    pub fn pending(&self) -> u64 {
        self.submitted - self.completed
    }
}

struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
}

pub struct TxQueue {
    graph: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl TxQueue {
    /// Start the queue's worker. Must be called inside a tokio runtime.
    pub fn new(graph: impl Into<String>) -> Self {
        let graph = graph.into();
        let (sender, mut jobs) = mpsc::unbounded_channel::<Job>();
        let counters = Arc::new(Counters {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        let worker_counters = counters.clone();
        let worker_graph = graph.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    log::error!("Transaction job for {worker_graph} failed: {e}");
                }
                worker_counters.completed.fetch_add(1, Ordering::SeqCst);
            }
            log::debug!("Transaction queue for {worker_graph} drained");
        });

        Self {
            graph,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    /// Enqueue `job` now and return a future for its result.
    ///
    /// The position in the queue is fixed when `submit` is called, not when
    /// the returned future is first polled.
    pub fn submit<F, T>(&self, job: F) -> impl Future<Output = SidecarResult<T>> + Send + 'static
    where
        F: FnOnce() -> SidecarResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: Job = Box::new(move || {
            let _ = tx.send(job());
        });

        let queued = {
            let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
            match sender.as_ref() {
                Some(sender) => sender.send(boxed).is_ok(),
                None => false,
            }
        };
        if queued {
            self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        }

        let graph = self.graph.clone();
        async move {
            if !queued {
                return Err(SidecarError::GraphClosed(graph));
            }
            rx.await.map_err(|_| {
                SidecarError::Application(format!("transaction job for {graph} panicked"))
            })?
        }
    }

    /// Stop accepting jobs and wait for the queued ones to finish.
    pub async fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("Transaction queue worker for {} failed: {e}", self.graph);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_none()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let queue = TxQueue::new("g");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut futures = Vec::new();
        for i in 0..20u64 {
            let log = log.clone();
            futures.push(queue.submit(move || {
                // Earlier jobs take longer; order must still hold
                std::thread::sleep(Duration::from_millis(20 - i));
                log.lock().unwrap().push(i);
                Ok(i)
            }));
        }
        // Await in reverse to show results don't depend on polling order
        for (i, fut) in futures.into_iter().enumerate().rev() {
            assert_eq!(fut.await.unwrap(), i as u64);
        }
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_one_job_at_a_time() {
        let queue = TxQueue::new("g");
        let running = Arc::new(AtomicU64::new(0));
        let mut futures = Vec::new();
        for _ in 0..10 {
            let running = running.clone();
            futures.push(queue.submit(move || {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                std::thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        for fut in futures {
            fut.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_queue() {
        let queue = TxQueue::new("g");
        let failed = queue.submit(|| -> SidecarResult<()> {
            Err(SidecarError::Application("boom".into()))
        });
        let ok = queue.submit(|| Ok(5));
        assert!(failed.await.is_err());
        assert_eq!(ok.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_close_drains_then_rejects() {
        let queue = TxQueue::new("g");
        let slow = queue.submit(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok("done")
        });
        queue.close().await;
        assert_eq!(queue.stats().pending(), 0);
        assert_eq!(slow.await.unwrap(), "done");
        assert!(matches!(
            queue.submit(|| Ok(())).await,
            Err(SidecarError::GraphClosed(_))
        ));
    }
}
