//! Bounded Background Task Pool
//!
//! Detached work (cache promotion, replication dispatch) is submitted here
//! instead of being spawned bare. Concurrency is bounded by a semaphore and
//! the backlog by `max_pending`; every task's outcome is counted and logged,
//! and callers that care can await it through a [`TaskHandle`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::telemetry::TASKS;

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskPoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    /// Accepted but not yet finished (queued or running)
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    in_flight: AtomicUsize,
}

/// Bounded worker pool on top of the tokio runtime
#[derive(Clone)]
pub struct TaskPool {
    name: Arc<str>,
    permits: Arc<Semaphore>,
    max_pending: usize,
    counters: Arc<Counters>,
}

/// Handle to a submitted task. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task and return its own result
    pub async fn wait(self) -> Result<T> {
        self.inner
            .await
            .map_err(|e| Error::Internal(format!("background task aborted: {}", e)))?
    }

    /// Check if the task has finished
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl TaskPool {
    /// Create a pool running at most `workers` tasks at once and holding at
    /// most `max_pending` accepted-but-unfinished tasks.
    pub fn new(name: impl Into<String>, workers: usize, max_pending: usize) -> Self {
        Self {
            name: Arc::from(name.into()),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            max_pending: max_pending.max(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Pool name used in logs and metrics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a task. Fails fast with a queue-full error when the backlog is
    /// saturated; the future is dropped unstarted in that case.
    pub fn submit<F, T>(&self, label: impl Into<String>, fut: F) -> Result<TaskHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        let pending = self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        if pending >= self.max_pending {
            self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            TASKS.with_label_values(&[&*self.name, "rejected"]).inc();
            warn!(pool = %self.name, task = %label, "task rejected: queue full");
            return Err(Error::Internal(format!(
                "{} pool queue full ({} pending)",
                self.name, pending
            )));
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        let name = Arc::clone(&self.name);

        let inner = tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => fut.await,
                Err(e) => Err(Error::Internal(format!("task pool closed: {}", e))),
            };

            counters.in_flight.fetch_sub(1, Ordering::AcqRel);
            match &result {
                Ok(_) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    TASKS.with_label_values(&[&*name, "completed"]).inc();
                    debug!(pool = %name, task = %label, "task completed");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    TASKS.with_label_values(&[&*name, "failed"]).inc();
                    warn!(pool = %name, task = %label, error = %e, "task failed");
                }
            }
            result
        });

        Ok(TaskHandle { inner })
    }

    /// Current counters
    pub fn stats(&self) -> TaskPoolStats {
        TaskPoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
        }
    }

    /// Wait until every accepted task has finished (test and shutdown helper)
    pub async fn drain(&self) {
        while self.counters.in_flight.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
