//! Driving a live run forward

use super::{FlowExecution, Phase};
use crate::error::Result;
use crate::interpreter::Advance;
use crate::steps::Wait;
use flow_storage::RunResult;
use serde_json::Value;

impl FlowExecution {
    /// Run the interpreter until the run suspends or ends.
    ///
    /// Returns the wait the run is suspended on, or `None` once it is
    /// terminal. Errors never escape: they fail the run cleanly.
    pub async fn drive(&mut self) -> Option<Wait> {
        let interpreter = self.interpreter.as_mut()?;
        let advance = interpreter.advance(&mut self.graph).await;

        match advance {
            Ok(Advance::Suspended(wait)) => match self.on_suspended().await {
                Ok(()) => Some(wait),
                Err(e) => {
                    self.fail_cleanly(RunResult::Failure, &e).await;
                    None
                }
            },
            Ok(Advance::Finished) => {
                self.complete().await;
                None
            }
            Err(e) => {
                self.fail_cleanly(RunResult::Failure, &e).await;
                None
            }
        }
    }

    /// Resolve the current wait with `value` and keep going
    pub async fn deliver(&mut self, value: Value) -> Option<Wait> {
        let interpreter = self.interpreter.as_mut()?;
        if let Err(e) = interpreter.complete_pending(&mut self.graph, value).await {
            self.fail_cleanly(RunResult::Failure, &e).await;
            return None;
        }
        self.drive().await
    }

    async fn on_suspended(&mut self) -> Result<()> {
        self.set_phase(Phase::Running);
        if self.policy.persists_on_suspension() {
            self.persist_continuation().await?;
        }
        Ok(())
    }

    async fn complete(&mut self) {
        self.interpreter = None;
        let heads = self.graph.index().head_ids();
        match self.graph.end_run(heads, RunResult::Success).await {
            Ok(_) => {
                self.finish_record(RunResult::Success).await;
                self.set_phase(Phase::Completed);
            }
            Err(e) => self.fail_cleanly(RunResult::Failure, &e).await,
        }
    }
}
