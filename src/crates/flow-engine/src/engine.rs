//! Process-level engine facade
//!
//! [`Engine`] owns every run found under the storage root and is the only
//! entry point external callers use:
//!
//! ```text
//!            Engine::open(config, steps)
//!                       │
//!        ┌──────────────┼───────────────────────────┐
//!        ▼              ▼                           ▼
//!  load run dirs   spawn resume task per      Scheduler (work items,
//!                  non-terminal run           timers, worker guards)
//!
//!  start_run ─► create ─► drive ─► Wait ─► schedule ─┐
//!                                                    │
//!  signal(name) / timer fires ─► deliver ─► drive ───┘ ... ─► terminal
//! ```
//!
//! # Stopping
//!
//! [`Engine::shutdown`] is the orderly stop: timers are cancelled, every live
//! run is flushed as its durability level requires and marked as cleanly
//! persisted. Dropping an engine without calling it is an abrupt stop: tasks
//! are aborted and nothing further reaches the disk.
//!
//! # Unloadable runs
//!
//! A run directory whose graph or record cannot be loaded is marked `Failure`
//! on disk and kept in a separate table. It has no execution, but
//! [`Engine::phase`], [`Engine::wait_for_completion`], [`Engine::resume`] and
//! [`Engine::abort`] report it as terminal instead of unknown.
//!
//! # Per-run exclusivity
//!
//! Each run sits behind its own async mutex. Driving, resuming, aborting and
//! shutting down a run all take that lock, so a run has at most one active
//! driver while different runs proceed independently.

use crate::config::EngineConfig;
use crate::definition::Script;
use crate::durability::DurabilityLevel;
use crate::error::{FlowError, Result};
use crate::execution::{FlowExecution, Phase, ResumeOutcome};
use crate::record::RunRecord;
use crate::scheduler::{Scheduler, WorkItem};
use crate::steps::{StepRegistry, Wait};
use chrono::Utc;
use dashmap::DashMap;
use flow_storage::{RunResult, StorageError};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Shared handle to one run
pub type ExecutionHandle = Arc<tokio::sync::Mutex<FlowExecution>>;

#[derive(Clone)]
struct RunSlot {
    execution: ExecutionHandle,
    phase: watch::Receiver<Phase>,
}

/// Completion signal of a run's resume
#[derive(Debug, Clone)]
pub struct ResumeHandle {
    run_id: String,
    phase: watch::Receiver<Phase>,
}

impl ResumeHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Wait until the run has left `Suspended`/`Resuming`
    pub async fn wait(mut self, timeout: Duration) -> Result<Phase> {
        let settled = tokio::time::timeout(
            timeout,
            self.phase
                .wait_for(|p| !matches!(p, Phase::Suspended | Phase::Resuming)),
        )
        .await;

        let phase = match settled {
            Ok(Ok(phase)) => *phase,
            Ok(Err(_)) => {
                return Err(FlowError::InvalidState(format!(
                    "run {} was released while resuming",
                    self.run_id
                )))
            }
            Err(_) => return Err(FlowError::ResumeTimeout(timeout)),
        };
        Ok(phase)
    }
}

struct EngineInner {
    config: EngineConfig,
    steps: Arc<StepRegistry>,
    runs: DashMap<String, RunSlot>,
    /// Runs found on disk that could not be loaded, with their final result
    unloadable: DashMap<String, RunResult>,
    scheduler: Scheduler,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Durable execution engine
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.inner.config.storage.root)
            .field("runs", &self.inner.runs.len())
            .field("unloadable", &self.inner.unloadable.len())
            .field("max_workers", &self.inner.scheduler.max_workers())
            .field("busy_workers", &self.inner.scheduler.busy_workers())
            .finish()
    }
}

impl Engine {
    /// Open the engine over `config.storage.root`, loading every run found
    /// there and resuming the ones that were still building
    #[tracing::instrument(skip_all, fields(root = %config.storage.root.display()))]
    pub async fn open(config: EngineConfig, steps: StepRegistry) -> Result<Self> {
        config.validate()?;
        let runs_dir = config.runs_dir();
        tokio::fs::create_dir_all(&runs_dir)
            .await
            .map_err(StorageError::from)?;

        let inner = Arc::new(EngineInner {
            scheduler: Scheduler::new(config.execution.max_workers),
            steps: Arc::new(steps),
            runs: DashMap::new(),
            unloadable: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            config,
        });

        let mut suspended = Vec::new();
        let mut entries = tokio::fs::read_dir(&runs_dir)
            .await
            .map_err(StorageError::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::from)? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match FlowExecution::load(&path, Arc::clone(&inner.steps), inner.config.retry_policy()).await {
                Ok(execution) => {
                    let run_id = execution.run_id().to_string();
                    if execution.phase() == Phase::Suspended {
                        suspended.push(run_id.clone());
                    }
                    inner.insert(execution);
                }
                Err(e) => {
                    let (run_id, result) = EngineInner::mark_unloadable(&path, &e).await;
                    inner.unloadable.insert(run_id, result);
                }
            }
        }

        tracing::info!(
            runs = inner.runs.len(),
            unloadable = inner.unloadable.len(),
            resuming = suspended.len(),
            max_workers = inner.scheduler.max_workers(),
            "Engine opened"
        );

        for run_id in suspended {
            let weak = Arc::downgrade(&inner);
            let handle = tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.resume_run(&run_id).await {
                        tracing::error!(run_id = %run_id, error = %e, "Resume task failed");
                    }
                }
            });
            inner.tasks.lock().push(handle);
        }

        Ok(Self { inner })
    }

    /// Start a run of the YAML definition `source` and drive it to its first
    /// suspension point. Returns the new run id.
    #[tracing::instrument(skip(self, source))]
    pub async fn start_run(&self, source: &str, durability: Option<DurabilityLevel>) -> Result<String> {
        self.inner.ensure_open()?;
        let script = Script::parse(source)?;
        script.validate(&self.inner.steps)?;

        let level = durability
            .or(script.definition().durability)
            .unwrap_or(self.inner.config.execution.default_durability);
        let run_id = Uuid::new_v4().to_string();
        let run_dir = self.inner.config.runs_dir().join(&run_id);

        let execution = FlowExecution::create(
            &run_id,
            &run_dir,
            Arc::new(script),
            level,
            Arc::clone(&self.inner.steps),
            self.inner.config.retry_policy(),
        )
        .await?;
        self.inner.insert(execution);

        self.inner.advance(&run_id, None).await?;
        Ok(run_id)
    }

    /// Deliver the external signal `name` to a run waiting on it
    #[tracing::instrument(skip(self))]
    pub async fn signal(&self, run_id: &str, name: &str) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.slot(run_id)?;
        let taken = self
            .inner
            .scheduler
            .take_if(run_id, |item| matches!(item, WorkItem::Signal { name: n } if n == name));
        if taken.is_none() {
            return Err(FlowError::NoSuchWait {
                run_id: run_id.to_string(),
                signal: name.to_string(),
            });
        }
        self.inner
            .advance(run_id, Some(Value::String(name.to_string())))
            .await
    }

    /// Abort a run from any phase. Returns false if it had already ended.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, run_id: &str) -> Result<bool> {
        if self.inner.unloadable.contains_key(run_id) {
            return Ok(false);
        }
        let slot = self.inner.slot(run_id)?;
        let mut execution = slot.execution.lock().await;
        let aborted = execution.abort().await;
        self.inner.scheduler.cancel(run_id);
        Ok(aborted)
    }

    /// Run the resume protocol for `run_id`; a no-op once the run is live or
    /// terminal
    pub async fn resume(&self, run_id: &str) -> Result<ResumeOutcome> {
        self.inner.resume_run(run_id).await
    }

    /// Handle that resolves once the run's resume has settled
    pub fn resume_handle(&self, run_id: &str) -> Result<ResumeHandle> {
        let slot = self.inner.slot(run_id)?;
        Ok(ResumeHandle {
            run_id: run_id.to_string(),
            phase: slot.phase,
        })
    }

    /// Wait until the run is terminal and return its result
    pub async fn wait_for_completion(&self, run_id: &str, timeout: Duration) -> Result<RunResult> {
        if let Some(result) = self.unloadable_result(run_id) {
            return Ok(result);
        }
        let slot = self.inner.slot(run_id)?;
        let mut phase = slot.phase.clone();
        let settled = tokio::time::timeout(timeout, phase.wait_for(|p| p.is_terminal())).await;
        let done = matches!(settled, Ok(Ok(_)));
        drop(settled);
        if !done {
            return Err(FlowError::InvalidState(format!(
                "run {} did not complete within {:?}",
                run_id, timeout
            )));
        }

        let execution = slot.execution.lock().await;
        execution
            .result()
            .ok_or_else(|| FlowError::InvalidState(format!("run {} has no result", run_id)))
    }

    /// Orderly shutdown of every run
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.scheduler.abort_timers();

        let flushed = join_all(self.inner.slots().into_iter().map(|slot| async move {
            let mut execution = slot.execution.lock().await;
            execution.shutdown().await.map_err(|e| {
                tracing::error!(run_id = %execution.run_id(), error = %e, "Run could not be flushed");
                e
            })
        }))
        .await;
        let first_error = flushed.into_iter().find_map(|r| r.err());
        self.inner.scheduler.close();

        tracing::info!(runs = self.inner.runs.len(), "Engine shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The execution of `run_id`
    pub fn execution(&self, run_id: &str) -> Option<ExecutionHandle> {
        self.inner.runs.get(run_id).map(|slot| Arc::clone(&slot.execution))
    }

    /// Current phase of `run_id`
    pub fn phase(&self, run_id: &str) -> Option<Phase> {
        if self.inner.unloadable.contains_key(run_id) {
            return Some(Phase::FailedCleanly);
        }
        self.inner.runs.get(run_id).map(|slot| *slot.phase.borrow())
    }

    /// Recorded result of a run whose directory could not be loaded
    pub fn unloadable_result(&self, run_id: &str) -> Option<RunResult> {
        self.inner.unloadable.get(run_id).map(|entry| *entry.value())
    }

    /// Ids of the runs that could not be loaded at open
    pub fn unloadable_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.unloadable.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Work items still queued for `run_id`
    pub fn pending_work(&self, run_id: &str) -> Vec<WorkItem> {
        self.inner.scheduler.pending(run_id)
    }

    pub fn busy_workers(&self) -> usize {
        self.inner.scheduler.busy_workers()
    }

    pub fn is_worker_busy(&self, run_id: &str) -> bool {
        self.inner.scheduler.is_busy(run_id)
    }

    pub fn queue_is_empty(&self) -> bool {
        self.inner.scheduler.queue_is_empty()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.inner.steps
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.inner.shut_down.load(Ordering::SeqCst) {
            tracing::warn!("Engine dropped without shutdown, stopping abruptly");
        }
        self.inner.scheduler.abort_timers();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl EngineInner {
    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(FlowError::InvalidState("engine is shut down".to_string()));
        }
        Ok(())
    }

    fn insert(&self, execution: FlowExecution) {
        let run_id = execution.run_id().to_string();
        let phase = execution.subscribe();
        self.runs.insert(
            run_id,
            RunSlot {
                execution: Arc::new(tokio::sync::Mutex::new(execution)),
                phase,
            },
        );
    }

    fn slot(&self, run_id: &str) -> Result<RunSlot> {
        self.runs
            .get(run_id)
            .map(|slot| slot.clone())
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    fn slots(&self) -> Vec<RunSlot> {
        self.runs.iter().map(|e| e.value().clone()).collect()
    }

    async fn resume_run(self: &Arc<Self>, run_id: &str) -> Result<ResumeOutcome> {
        if self.unloadable.contains_key(run_id) {
            return Ok(ResumeOutcome::AlreadyTerminal);
        }
        self.ensure_open()?;
        let slot = self.slot(run_id)?;
        let _worker = self.scheduler.acquire_worker(run_id).await?;
        let mut execution = slot.execution.lock().await;
        // Shutdown may have flushed the run while this call waited for the lock
        self.ensure_open()?;

        let outcome = execution.resume(self.config.resume_timeout()).await;
        if let ResumeOutcome::Resumed(wait) = &outcome {
            self.schedule(run_id, wait);
        }
        Ok(outcome)
    }

    /// Drive `run_id` forward, first resolving its wait with `value` if given
    async fn advance(self: &Arc<Self>, run_id: &str, value: Option<Value>) -> Result<()> {
        let slot = self.slot(run_id)?;
        let _worker = self.scheduler.acquire_worker(run_id).await?;
        let mut execution = slot.execution.lock().await;

        let next = match value {
            Some(value) => execution.deliver(value).await,
            None => execution.drive().await,
        };
        // Scheduled under the run lock so an abort cannot slip in between
        if let Some(wait) = next {
            self.schedule(run_id, &wait);
        }
        Ok(())
    }

    fn schedule(self: &Arc<Self>, run_id: &str, wait: &Wait) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        self.scheduler.enqueue(run_id, WorkItem::from(wait));

        if let Wait::Until { deadline } = wait {
            let delay = (*deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let weak: Weak<Self> = Arc::downgrade(self);
            let run = run_id.to_string();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.fire_timer(&run).await;
                }
            });
            self.scheduler.register_timer(run_id, handle);
        }
    }

    async fn fire_timer(self: &Arc<Self>, run_id: &str) {
        self.scheduler.timer_fired(run_id);
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let due = self
            .scheduler
            .take_if(run_id, |item| matches!(item, WorkItem::Timer { .. }));
        if due.is_none() {
            return;
        }

        tracing::debug!(run_id = %run_id, "Timer fired");
        if let Err(e) = self.advance(run_id, Some(Value::Null)).await {
            tracing::error!(run_id = %run_id, error = %e, "Timer could not drive run");
        }
    }

    /// A run directory that cannot be loaded is failed without a resume.
    /// Returns the run id and the result the run is reported with.
    async fn mark_unloadable(run_dir: &Path, error: &FlowError) -> (String, RunResult) {
        tracing::error!(path = %run_dir.display(), error = %error, "Run cannot be loaded");
        let dir_name = run_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        match RunRecord::load(run_dir).await {
            Ok(mut record) if record.is_building() => {
                record.complete(RunResult::Failure);
                if let Err(e) = record.save(run_dir).await {
                    tracing::error!(path = %run_dir.display(), error = %e, "Could not mark run failed");
                }
                (record.run_id, RunResult::Failure)
            }
            Ok(record) => {
                let result = record.result.unwrap_or(RunResult::Failure);
                (record.run_id, result)
            }
            Err(e) => {
                tracing::warn!(path = %run_dir.display(), error = %e, "Run directory has no usable record");
                (dir_name, RunResult::Failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNAL: &str = "name: s\nsteps:\n  - step: semaphore\n    args: go\n  - step: echo\n    args: { message: hi }\n";

    async fn engine(dir: &Path) -> Engine {
        Engine::open(EngineConfig::with_root(dir), StepRegistry::with_builtins())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_signal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;

        let run_id = engine.start_run(SIGNAL, None).await.unwrap();
        assert_eq!(
            engine.pending_work(&run_id),
            vec![WorkItem::Signal {
                name: "go".to_string()
            }]
        );
        assert_eq!(engine.busy_workers(), 0);

        assert!(matches!(
            engine.signal(&run_id, "stop").await,
            Err(FlowError::NoSuchWait { .. })
        ));
        engine.signal(&run_id, "go").await.unwrap();

        let result = engine
            .wait_for_completion(&run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, RunResult::Success);
        assert!(engine.queue_is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run_and_bad_definition() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        assert!(matches!(
            engine.signal("nope", "go").await,
            Err(FlowError::RunNotFound(_))
        ));
        assert!(engine
            .start_run("name: x\nsteps:\n  - step: warp\n", None)
            .await
            .is_err());
        assert!(engine.run_ids().is_empty());
    }

    #[tokio::test]
    async fn test_durability_choice_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;

        let defined = "name: d\ndurability: no_promises\nsteps:\n  - step: echo\n    args: { message: x }\n";
        let a = engine.start_run(defined, None).await.unwrap();
        let b = engine
            .start_run(defined, Some(DurabilityLevel::SurviveCleanRestart))
            .await
            .unwrap();
        let c = engine.start_run(SIGNAL, None).await.unwrap();

        let level = |id: &str| {
            let exec = engine.execution(id).unwrap();
            async move { exec.lock().await.durability() }
        };
        assert_eq!(level(&a).await, DurabilityLevel::NoPromises);
        assert_eq!(level(&b).await, DurabilityLevel::SurviveCleanRestart);
        assert_eq!(level(&c).await, DurabilityLevel::FullyDurable);
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();
        assert!(matches!(
            engine.start_run(SIGNAL, None).await,
            Err(FlowError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_unloadable_run_is_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = {
            let engine = engine(dir.path()).await;
            let id = engine
                .start_run(SIGNAL, Some(DurabilityLevel::FullyDurable))
                .await
                .unwrap();
            engine.shutdown().await.unwrap();
            id
        };

        // Orphan node: parent 7 does not exist
        let nodes = dir.path().join("runs").join(&run_id).join(flow_storage::NODES_DIR);
        std::fs::write(
            nodes.join("9.json"),
            r#"{"id":9,"kind":{"type":"atom","function":"echo"},"parents":[7],"actions":[]}"#,
        )
        .unwrap();

        let engine = engine(dir.path()).await;
        assert!(engine.execution(&run_id).is_none());
        let record = RunRecord::load(&dir.path().join("runs").join(&run_id)).await.unwrap();
        assert!(!record.is_building());
        assert_eq!(record.result, Some(RunResult::Failure));

        // Visible as a terminal failure rather than an unknown run
        assert_eq!(engine.unloadable_runs(), vec![run_id.clone()]);
        assert_eq!(engine.unloadable_result(&run_id), Some(RunResult::Failure));
        assert_eq!(engine.phase(&run_id), Some(Phase::FailedCleanly));
        assert_eq!(
            engine
                .wait_for_completion(&run_id, Duration::from_secs(1))
                .await
                .unwrap(),
            RunResult::Failure
        );
        assert_eq!(engine.resume(&run_id).await.unwrap(), ResumeOutcome::AlreadyTerminal);
        assert!(!engine.abort(&run_id).await.unwrap());
        assert!(engine.pending_work(&run_id).is_empty());
        let report = crate::verify::verify_completed_cleanly(&engine, &run_id).await.unwrap();
        assert_eq!(report.violations.len(), 1);

        // Still reported on the next open
        drop(engine);
        let engine = self::engine(dir.path()).await;
        assert_eq!(engine.phase(&run_id), Some(Phase::FailedCleanly));
    }

    #[tokio::test]
    async fn test_resume_after_shutdown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let run_id = engine.start_run(SIGNAL, None).await.unwrap();
        engine.shutdown().await.unwrap();

        match engine.resume(&run_id).await {
            Err(FlowError::InvalidState(message)) => assert_eq!(message, "engine is shut down"),
            other => panic!("expected InvalidState, got {:?}", other),
        }
        assert_eq!(engine.phase(&run_id), Some(Phase::Suspended));
    }
}
