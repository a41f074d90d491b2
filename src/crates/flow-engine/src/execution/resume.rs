//! Resume protocol
//!
//! Runs once per loaded run, on process start:
//!
//! ```text
//!  graph already ends in FlowEnd? ── yes ──► terminal, nothing to do
//!          │ no
//!          ▼
//!  clear persisted_clean, write record
//!          │
//!          ▼                              ┌──────────────────────┐
//!  ┌─ within resume timeout ───────────┐  │                      │
//!  │ level permits this interruption?  │──┤ any "no", any error, │
//!  │ continuation handle recorded?     │  │ or the timeout fires │
//!  │ continuation loads and decodes?   │  │          │           │
//!  │ graph agrees with continuation?   │  │          ▼           │
//!  │ suspended step's on_resume() ok?  │  │    fail_cleanly()    │
//!  └───────────────────────────────────┘  └──────────────────────┘
//!          │ all yes
//!          ▼
//!       Running, suspended on the same wait as before
//! ```
//!
//! Clearing `persisted_clean` first means a crash during or after the resume
//! is seen as abrupt by the next process.

use super::{FlowExecution, Phase};
use crate::continuation::Continuation;
use crate::error::{FlowError, Result};
use crate::interpreter::Interpreter;
use crate::steps::Wait;
use flow_storage::{NodeId, RunResult};
use std::sync::Arc;
use std::time::Duration;

/// What a call to [`FlowExecution::resume`] did
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The run is live again and suspended on this wait
    Resumed(Wait),
    /// The run was already resumed or never stopped
    AlreadyActive,
    /// The run had already ended
    AlreadyTerminal,
    /// The run could not resume and was failed cleanly
    Failed,
}

impl FlowExecution {
    /// Resume a suspended run. Calling it again is a no-op.
    pub async fn resume(&mut self, timeout: Duration) -> ResumeOutcome {
        match self.phase() {
            Phase::Running | Phase::Resuming => return ResumeOutcome::AlreadyActive,
            Phase::Completed | Phase::FailedCleanly => return ResumeOutcome::AlreadyTerminal,
            Phase::Suspended => {}
        }

        if let Some(result) = self.graph.index().flow_end().and_then(|n| n.flow_result()) {
            tracing::info!(run_id = %self.run_id, result = %result, "Run already ended, not resuming");
            self.finish_record(result).await;
            self.set_phase(if result.is_success() {
                Phase::Completed
            } else {
                Phase::FailedCleanly
            });
            return ResumeOutcome::AlreadyTerminal;
        }

        self.set_phase(Phase::Resuming);
        let orderly = self.record.persisted_clean;

        match tokio::time::timeout(timeout, self.try_resume(orderly)).await {
            Ok(Ok(wait)) => {
                self.set_phase(Phase::Running);
                tracing::info!(
                    run_id = %self.run_id,
                    durability = %self.policy.level,
                    orderly,
                    wait = %wait,
                    "Run resumed"
                );
                ResumeOutcome::Resumed(wait)
            }
            Ok(Err(e)) => {
                if !e.forces_clean_failure() {
                    tracing::error!(run_id = %self.run_id, error = %e, "Unexpected error while resuming");
                }
                self.interpreter = None;
                self.fail_cleanly(RunResult::Failure, &e).await;
                ResumeOutcome::Failed
            }
            Err(_) => {
                self.interpreter = None;
                self.fail_cleanly(RunResult::Failure, &FlowError::ResumeTimeout(timeout))
                    .await;
                ResumeOutcome::Failed
            }
        }
    }

    async fn try_resume(&mut self, orderly: bool) -> Result<Wait> {
        self.record.persisted_clean = false;
        self.record.save(&self.run_dir).await?;

        if !self.policy.permits_resume(orderly) {
            return Err(FlowError::InvalidState(format!(
                "durability level {} does not permit resuming after {} interruption",
                self.policy.level,
                if orderly { "an orderly" } else { "an abrupt" }
            )));
        }

        let handle = self.record.continuation.ok_or_else(|| {
            FlowError::CorruptContinuation("no continuation was persisted".to_string())
        })?;
        let bytes = self.continuations.load(&handle).await.ok_or_else(|| {
            FlowError::CorruptContinuation(format!(
                "continuation generation {} is not loadable",
                handle.generation
            ))
        })?;
        let continuation = Continuation::decode(&bytes, &self.script)?;
        let wait = self.check_against_graph(&continuation)?;

        let interpreter = Interpreter::from_continuation(
            &self.run_id,
            &self.run_dir,
            Arc::clone(&self.script),
            Arc::clone(&self.steps),
            continuation,
        );
        interpreter.on_resume().await?;
        self.interpreter = Some(interpreter);
        Ok(wait)
    }

    /// The continuation must describe the graph that was loaded
    fn check_against_graph(&self, continuation: &Continuation) -> Result<Wait> {
        let pending = continuation.pending.as_ref().ok_or_else(|| {
            FlowError::CorruptContinuation("continuation is not suspended in a step".to_string())
        })?;

        let index = self.graph.index();
        if index.head_ids() != vec![pending.node] {
            return Err(FlowError::GraphConsistency(format!(
                "suspended step {} is not the only head (heads {:?})",
                pending.node,
                index.head_ids()
            )));
        }

        let mut expected: Vec<NodeId> = continuation
            .open_blocks()
            .flat_map(|b| [b.start, b.body_start])
            .collect();
        expected.sort();
        let mut actual: Vec<NodeId> = index.open_blocks().iter().map(|n| n.id()).collect();
        actual.sort();
        if expected != actual {
            return Err(FlowError::GraphConsistency(format!(
                "open blocks {:?} do not match continuation {:?}",
                actual, expected
            )));
        }

        Ok(pending.wait.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Script;
    use crate::durability::DurabilityLevel;
    use crate::record::RunRecord;
    use crate::retry::RetryPolicy;
    use crate::steps::StepRegistry;
    use std::path::Path;

    const BASIC: &str = r#"
name: basic
steps:
  - block: node
    body:
      - step: semaphore
        args: { name: halt }
  - step: echo
    args: { message: done }
"#;

    fn steps() -> Arc<StepRegistry> {
        Arc::new(StepRegistry::with_builtins())
    }

    async fn suspended_run(level: DurabilityLevel, dir: &Path) -> FlowExecution {
        let mut exec = FlowExecution::create(
            "run-1",
            dir,
            Arc::new(Script::parse(BASIC).unwrap()),
            level,
            steps(),
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        exec.drive().await.unwrap();
        exec
    }

    async fn reload(dir: &Path) -> FlowExecution {
        FlowExecution::load(dir, steps(), RetryPolicy::none())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_orderly_restart_resumes_clean_restart_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = suspended_run(DurabilityLevel::SurviveCleanRestart, dir.path()).await;
        exec.shutdown().await.unwrap();
        drop(exec);

        let mut exec = reload(dir.path()).await;
        assert_eq!(exec.phase(), Phase::Suspended);
        let outcome = exec.resume(Duration::from_secs(5)).await;
        assert_eq!(
            outcome,
            ResumeOutcome::Resumed(Wait::Signal {
                name: "halt".to_string()
            })
        );
        assert!(!RunRecord::load(dir.path()).await.unwrap().persisted_clean);

        // Second call is a no-op
        assert_eq!(exec.resume(Duration::from_secs(5)).await, ResumeOutcome::AlreadyActive);

        assert!(exec.deliver(serde_json::Value::Null).await.is_none());
        assert_eq!(exec.result(), Some(RunResult::Success));
        assert_eq!(exec.graph().index().len(), 8);
    }

    #[tokio::test]
    async fn test_abrupt_stop_fails_clean_restart_level() {
        let dir = tempfile::tempdir().unwrap();
        let exec = suspended_run(DurabilityLevel::SurviveCleanRestart, dir.path()).await;
        drop(exec);

        let mut exec = reload(dir.path()).await;
        assert_eq!(exec.resume(Duration::from_secs(5)).await, ResumeOutcome::Failed);
        assert_eq!(exec.phase(), Phase::FailedCleanly);
        assert_eq!(exec.result(), Some(RunResult::Failure));
        assert!(exec.current_heads()[0].is_flow_end());
        assert_eq!(exec.resume(Duration::from_secs(5)).await, ResumeOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_abrupt_stop_resumes_fully_durable_level() {
        let dir = tempfile::tempdir().unwrap();
        let exec = suspended_run(DurabilityLevel::FullyDurable, dir.path()).await;
        drop(exec);

        let mut exec = reload(dir.path()).await;
        assert!(matches!(
            exec.resume(Duration::from_secs(5)).await,
            ResumeOutcome::Resumed(_)
        ));
        assert!(exec.has_interpreter());
    }

    #[tokio::test]
    async fn test_no_promises_never_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = suspended_run(DurabilityLevel::NoPromises, dir.path()).await;
        exec.shutdown().await.unwrap();
        drop(exec);

        let mut exec = reload(dir.path()).await;
        assert_eq!(exec.resume(Duration::from_secs(5)).await, ResumeOutcome::Failed);
        assert!(!exec.has_interpreter());
    }

    #[tokio::test]
    async fn test_corrupt_continuation_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let exec = suspended_run(DurabilityLevel::FullyDurable, dir.path()).await;
        drop(exec);
        std::fs::write(dir.path().join(flow_storage::CONTINUATION_FILE), b"garbage").unwrap();

        let mut exec = reload(dir.path()).await;
        assert_eq!(exec.resume(Duration::from_secs(5)).await, ResumeOutcome::Failed);
        assert!(exec.graph().index().open_blocks().is_empty());
        assert!(!dir.path().join(flow_storage::CONTINUATION_FILE).exists());
    }

    #[tokio::test]
    async fn test_graph_ahead_of_continuation_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let exec = suspended_run(DurabilityLevel::FullyDurable, dir.path()).await;
        assert_eq!(exec.graph().index().head_ids(), vec![NodeId(4)]);
        drop(exec);

        // A node after the suspended semaphore that the continuation never saw
        std::fs::write(
            dir.path().join(flow_storage::NODES_DIR).join("5.json"),
            r#"{"id":5,"kind":{"type":"atom","function":"echo"},"parents":[4],"actions":[]}"#,
        )
        .unwrap();

        let mut exec = reload(dir.path()).await;
        assert_eq!(exec.graph().index().head_ids(), vec![NodeId(5)]);
        assert_eq!(exec.resume(Duration::from_secs(5)).await, ResumeOutcome::Failed);
        assert_eq!(exec.phase(), Phase::FailedCleanly);
        assert_eq!(exec.result(), Some(RunResult::Failure));
        assert!(!exec.has_interpreter());

        let heads = exec.current_heads();
        assert_eq!(heads.len(), 1);
        assert!(heads[0].is_flow_end());
        assert!(exec.graph().index().open_blocks().is_empty());
    }

    #[tokio::test]
    async fn test_flow_end_head_means_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = suspended_run(DurabilityLevel::FullyDurable, dir.path()).await;
        exec.graph.terminate(RunResult::Aborted).await.unwrap();
        drop(exec);

        // Record still says building, the graph says otherwise
        let mut exec = reload(dir.path()).await;
        assert_eq!(exec.phase(), Phase::Suspended);
        assert_eq!(exec.resume(Duration::from_secs(5)).await, ResumeOutcome::AlreadyTerminal);
        assert_eq!(exec.phase(), Phase::FailedCleanly);
        assert_eq!(exec.result(), Some(RunResult::Aborted));
        assert!(!exec.is_building());
    }
}
