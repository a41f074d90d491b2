//! Per-run pending work and worker accounting
//!
//! The [`Scheduler`] tracks what each suspended run is waiting for and which
//! runs are being driven right now:
//!
//! ```text
//!  pending:  run-id ──► WorkItem (Signal | Timer)      at most one per run
//!  timers:   run-id ──► JoinHandle (sleeping task)     aborted on cancel
//!  workers:  Semaphore(max_workers) ──► WorkerGuard    busy while held
//! ```
//!
//! A run being driven holds a [`WorkerGuard`]; dropping the guard releases the
//! worker slot and the run's busy count, so no code path can leak a busy
//! worker.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{FlowError, Result};
use crate::steps::Wait;

/// Something a run is waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Signal { name: String },
    Timer { deadline: DateTime<Utc> },
}

impl From<&Wait> for WorkItem {
    fn from(wait: &Wait) -> Self {
        match wait {
            Wait::Signal { name } => Self::Signal { name: name.clone() },
            Wait::Until { deadline } => Self::Timer {
                deadline: *deadline,
            },
        }
    }
}

/// Held while a run is being driven
#[derive(Debug)]
pub struct WorkerGuard {
    run_id: String,
    busy: Arc<Mutex<HashMap<String, usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut busy = self.busy.lock();
        if let Some(count) = busy.get_mut(&self.run_id) {
            *count -= 1;
            if *count == 0 {
                busy.remove(&self.run_id);
            }
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    pending: DashMap<String, WorkItem>,
    timers: DashMap<String, JoinHandle<()>>,
    workers: Arc<Semaphore>,
    busy: Arc<Mutex<HashMap<String, usize>>>,
    max_workers: usize,
}

impl Scheduler {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            pending: DashMap::new(),
            timers: DashMap::new(),
            workers: Arc::new(Semaphore::new(max_workers)),
            busy: Arc::new(Mutex::new(HashMap::new())),
            max_workers,
        }
    }

    /// Record what `run_id` waits for, replacing any earlier item
    pub fn enqueue(&self, run_id: &str, item: WorkItem) {
        tracing::trace!(run_id = %run_id, item = ?item, "Work enqueued");
        self.pending.insert(run_id.to_string(), item);
    }

    /// Remove and return the item `run_id` waits for if `accept` agrees
    pub fn take_if<F>(&self, run_id: &str, accept: F) -> Option<WorkItem>
    where
        F: FnOnce(&WorkItem) -> bool,
    {
        self.pending
            .remove_if(run_id, |_, item| accept(item))
            .map(|(_, item)| item)
    }

    /// Work still queued for `run_id`
    pub fn pending(&self, run_id: &str) -> Vec<WorkItem> {
        self.pending
            .get(run_id)
            .map(|item| vec![item.clone()])
            .unwrap_or_default()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Track the task that fires `run_id`'s timer
    pub fn register_timer(&self, run_id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert(run_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Forget the timer task of `run_id` without aborting it; called by the
    /// task itself once it fires
    pub fn timer_fired(&self, run_id: &str) {
        self.timers.remove(run_id);
    }

    /// Drop all queued work for `run_id` and abort its timer
    pub fn cancel(&self, run_id: &str) {
        self.pending.remove(run_id);
        if let Some((_, handle)) = self.timers.remove(run_id) {
            handle.abort();
        }
    }

    /// Abort every timer; queued items are kept
    pub fn abort_timers(&self) {
        let runs: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for run_id in runs {
            if let Some((_, handle)) = self.timers.remove(&run_id) {
                handle.abort();
            }
        }
    }

    /// Wait for a free worker and mark `run_id` busy until the guard drops
    pub async fn acquire_worker(&self, run_id: &str) -> Result<WorkerGuard> {
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| FlowError::InvalidState("worker pool is closed".to_string()))?;
        *self.busy.lock().entry(run_id.to_string()).or_insert(0) += 1;
        Ok(WorkerGuard {
            run_id: run_id.to_string(),
            busy: Arc::clone(&self.busy),
            _permit: permit,
        })
    }

    /// Stop handing out workers; waiters get an error
    pub fn close(&self) {
        self.workers.close();
    }

    /// Workers currently driving any run
    pub fn busy_workers(&self) -> usize {
        self.busy.lock().values().sum()
    }

    pub fn is_busy(&self, run_id: &str) -> bool {
        self.busy.lock().contains_key(run_id)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_take_if_matches_item() {
        let scheduler = Scheduler::new(2);
        scheduler.enqueue(
            "r",
            WorkItem::Signal {
                name: "halt".to_string(),
            },
        );

        let wrong = scheduler.take_if("r", |i| matches!(i, WorkItem::Signal { name } if name == "go"));
        assert!(wrong.is_none());
        assert_eq!(scheduler.pending("r").len(), 1);

        let right =
            scheduler.take_if("r", |i| matches!(i, WorkItem::Signal { name } if name == "halt"));
        assert!(right.is_some());
        assert!(scheduler.pending("r").is_empty());
        assert!(scheduler.queue_is_empty());
    }

    #[test]
    fn test_pool_has_at_least_one_worker() {
        assert_eq!(Scheduler::new(0).max_workers(), 1);
        assert_eq!(Scheduler::new(4).max_workers(), 4);
    }

    #[tokio::test]
    async fn test_worker_guard_tracks_busy() {
        let scheduler = Scheduler::new(2);
        let a = scheduler.acquire_worker("a").await.unwrap();
        let b = scheduler.acquire_worker("b").await.unwrap();
        assert_eq!(scheduler.busy_workers(), 2);
        assert!(scheduler.is_busy("a"));

        drop(a);
        assert_eq!(scheduler.busy_workers(), 1);
        assert!(!scheduler.is_busy("a"));
        drop(b);
        assert_eq!(scheduler.busy_workers(), 0);
    }

    #[tokio::test]
    async fn test_worker_limit_blocks() {
        let scheduler = Arc::new(Scheduler::new(1));
        let held = scheduler.acquire_worker("a").await.unwrap();

        let waiting = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                let _guard = scheduler.acquire_worker("b").await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(held);
        waiting.await.unwrap();
        assert_eq!(scheduler.busy_workers(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_timer() {
        let scheduler = Scheduler::new(1);
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        scheduler.enqueue(
            "r",
            WorkItem::Timer {
                deadline: Utc::now(),
            },
        );
        scheduler.register_timer("r", handle);

        scheduler.cancel("r");
        assert!(scheduler.pending("r").is_empty());
        assert!(scheduler.timers.is_empty());
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_workers() {
        let scheduler = Scheduler::new(1);
        scheduler.close();
        assert!(scheduler.acquire_worker("a").await.is_err());
        assert_eq!(scheduler.busy_workers(), 0);
    }

    #[test]
    fn test_work_item_from_wait() {
        let item = WorkItem::from(&Wait::Signal {
            name: "x".to_string(),
        });
        assert_eq!(item, WorkItem::Signal { name: "x".to_string() });
    }
}
