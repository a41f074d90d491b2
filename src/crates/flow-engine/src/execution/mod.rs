//! The execution aggregate of one run
//!
//! [`FlowExecution`] owns everything a run has: its record, its flow graph
//! (and through it the node storage), its continuation store and, while the
//! run is live, the resident [`Interpreter`].
//!
//! # Phases
//!
//! ```text
//!                      load from disk
//!                            │
//!                            ▼
//!   create ──────────►  ┌─────────┐   resume()   ┌──────────┐
//!        │              │Suspended│ ───────────► │ Resuming │
//!        │              └─────────┘              └──────────┘
//!        │                   ▲ shutdown()          │     │
//!        ▼                   │                     │     │ continuation unusable,
//!   ┌─────────┐ ◄────────────┴─────────────────────┘     │ not permitted, timeout
//!   │ Running │                                           ▼
//!   └─────────┘ ── step error / abort() ──────►  ┌───────────────┐
//!        │                                       │ FailedCleanly │
//!        └── script finished ──► ┌───────────┐   └───────────────┘
//!                                │ Completed │
//!                                └───────────┘
//! ```
//!
//! Phase changes are published on a `watch` channel; waiting for a run to
//! settle means waiting on that channel, never polling.
//!
//! # Terminal cleanup
//!
//! Both terminal phases leave the same state behind: a single `FlowEnd` head,
//! every block closed, no resident interpreter, a terminal record and no
//! continuation unit on disk.

mod drive;
mod resume;

pub use resume::ResumeOutcome;

use crate::definition::Script;
use crate::durability::{DurabilityLevel, DurabilityPolicy};
use crate::error::{FlowError, Result};
use crate::graph::{DepthFirstScanner, FlowGraph};
use crate::interpreter::Interpreter;
use crate::record::RunRecord;
use crate::retry::RetryPolicy;
use crate::steps::{StepRegistry, Wait};
use flow_storage::{ContinuationStore, FlowNode, RunResult, StorageError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// On disk and not yet resumed
    Suspended,
    /// Resume protocol in progress
    Resuming,
    /// Interpreter resident
    Running,
    Completed,
    FailedCleanly,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::FailedCleanly)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Suspended => "suspended",
            Self::Resuming => "resuming",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::FailedCleanly => "failed_cleanly",
        };
        f.write_str(name)
    }
}

/// One run and everything it owns
pub struct FlowExecution {
    run_id: String,
    run_dir: PathBuf,
    policy: DurabilityPolicy,
    record: RunRecord,
    script: Arc<Script>,
    steps: Arc<StepRegistry>,
    graph: FlowGraph,
    continuations: ContinuationStore,
    interpreter: Option<Interpreter>,
    phase: watch::Sender<Phase>,
}

impl fmt::Debug for FlowExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowExecution")
            .field("run_id", &self.run_id)
            .field("durability", &self.policy.level)
            .field("phase", &self.phase())
            .field("nodes", &self.graph.index().len())
            .field("interpreter", &self.interpreter.is_some())
            .finish()
    }
}

impl FlowExecution {
    /// Create a new run in `run_dir` and write its start node
    pub async fn create(
        run_id: &str,
        run_dir: &Path,
        script: Arc<Script>,
        level: DurabilityLevel,
        steps: Arc<StepRegistry>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(run_dir)
            .await
            .map_err(StorageError::from)?;

        let policy = level.policy();
        let record = RunRecord::new(run_id, &script, level);
        record.save(run_dir).await?;

        let mut graph = FlowGraph::create(run_id, policy.storage, run_dir, retry).await?;
        graph.start_run().await?;

        let interpreter = Interpreter::new(run_id, run_dir, Arc::clone(&script), Arc::clone(&steps));
        let (phase, _) = watch::channel(Phase::Running);

        tracing::info!(
            run_id = %run_id,
            name = %script.name(),
            durability = %level,
            storage = %policy.storage,
            "Run created"
        );
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            policy,
            record,
            script,
            steps,
            graph,
            continuations: ContinuationStore::open(run_dir, None),
            interpreter: Some(interpreter),
            phase,
        })
    }

    /// Load a run from its directory without resuming it
    pub async fn load(run_dir: &Path, steps: Arc<StepRegistry>, retry: RetryPolicy) -> Result<Self> {
        let record = RunRecord::load(run_dir).await?;
        let script = Arc::new(Script::parse(&record.script)?);
        let policy = record.durability.policy();
        let graph = FlowGraph::load(&record.run_id, policy.storage, run_dir, retry).await?;
        let continuations = ContinuationStore::open(run_dir, record.continuation);

        let phase = match (record.is_building(), record.result) {
            (true, _) => Phase::Suspended,
            (false, Some(RunResult::Success)) => Phase::Completed,
            (false, _) => Phase::FailedCleanly,
        };
        let (phase, _) = watch::channel(phase);

        Ok(Self {
            run_id: record.run_id.clone(),
            run_dir: run_dir.to_path_buf(),
            policy,
            record,
            script,
            steps,
            graph,
            continuations,
            interpreter: None,
            phase,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Durability level the run was created with
    pub fn durability(&self) -> DurabilityLevel {
        self.policy.level
    }

    pub fn policy(&self) -> &DurabilityPolicy {
        &self.policy
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// The run's definition source, available whether or not the run is live
    pub fn script_source(&self) -> &str {
        &self.record.script
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn current_heads(&self) -> Vec<&FlowNode> {
        self.graph.current_heads()
    }

    pub fn all_nodes(&self) -> DepthFirstScanner<'_> {
        self.graph.all_nodes()
    }

    pub fn result(&self) -> Option<RunResult> {
        self.record.result
    }

    pub fn is_building(&self) -> bool {
        self.record.is_building()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver that observes every phase change
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Whether an interpreter for this run is resident
    pub fn has_interpreter(&self) -> bool {
        self.interpreter.is_some()
    }

    /// What the run is currently suspended on
    pub fn pending_wait(&self) -> Option<&Wait> {
        self.interpreter
            .as_ref()
            .and_then(|i| i.pending())
            .map(|p| &p.wait)
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(run_id = %self.run_id, from = %previous, to = %phase, "Phase changed");
        }
    }

    /// Terminate the run with `result`, leaving nothing live behind.
    ///
    /// Best effort: storage failures are logged, the in-memory state still
    /// becomes terminal.
    pub async fn fail_cleanly(&mut self, result: RunResult, reason: &FlowError) {
        if self.phase().is_terminal() {
            return;
        }
        tracing::warn!(run_id = %self.run_id, result = %result, reason = %reason, "Failing run");

        self.interpreter = None;
        if let Err(e) = self.graph.terminate(result).await {
            tracing::error!(run_id = %self.run_id, error = %e, "Could not persist run termination");
        }
        self.finish_record(result).await;
        self.set_phase(Phase::FailedCleanly);
    }

    /// Abort the run. Returns false if it had already ended.
    pub async fn abort(&mut self) -> bool {
        if self.phase().is_terminal() {
            return false;
        }
        self.fail_cleanly(RunResult::Aborted, &FlowError::InvalidState("aborted".to_string()))
            .await;
        true
    }

    /// Orderly shutdown: flush what the policy asks for and mark the
    /// interruption as clean
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.phase() {
            Phase::Completed | Phase::FailedCleanly | Phase::Suspended => return Ok(()),
            Phase::Resuming | Phase::Running => {}
        }

        self.graph.flush().await?;
        if self.policy.persists_on_shutdown() {
            self.persist_continuation().await?;
        }
        self.record.persisted_clean = true;
        self.record.save(&self.run_dir).await?;

        self.interpreter = None;
        self.set_phase(Phase::Suspended);
        tracing::info!(run_id = %self.run_id, durability = %self.policy.level, "Run flushed for shutdown");
        Ok(())
    }

    async fn persist_continuation(&mut self) -> Result<()> {
        let Some(interpreter) = &self.interpreter else {
            return Ok(());
        };
        let bytes = interpreter.continuation().encode()?;
        let handle = self.continuations.persist(&bytes).await?;
        self.record.continuation = Some(handle);
        self.record.save(&self.run_dir).await
    }

    async fn finish_record(&mut self, result: RunResult) {
        self.record.complete(result);
        if let Err(e) = self.record.save(&self.run_dir).await {
            tracing::error!(run_id = %self.run_id, error = %e, "Could not write terminal run record");
        }
        if let Err(e) = self.continuations.discard().await {
            tracing::warn!(run_id = %self.run_id, error = %e, "Could not discard continuation");
        }
    }
}
