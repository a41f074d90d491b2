//! Statement interpreter
//!
//! [`Interpreter`] runs a script statement by statement against a
//! [`FlowGraph`], stopping at the first step that has to wait:
//!
//! ```text
//! block: node        StepStart(node) ─► StepStart(node, body)
//!   step: semaphore    Atom(semaphore)          ◄── suspends here
//! (end of body)      StepEnd(body)   ─► StepEnd(node)
//! step: echo         Atom(echo)
//! (end of script)    Finished
//! ```
//!
//! All progress lives in its [`Continuation`], so an interpreter rebuilt from
//! a persisted continuation continues exactly where the old one stopped.

use crate::continuation::{Continuation, Frame, OpenBlock, PendingStep};
use crate::definition::{Script, Statement};
use crate::error::{FlowError, Result};
use crate::graph::FlowGraph;
use crate::steps::{StepContext, StepOutcome, StepRegistry, Wait};
use flow_storage::atomic::write_atomic;
use flow_storage::{FlowNode, NodeAction, StorageError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory for step logs inside a run directory
pub const LOGS_DIR: &str = "logs";

/// Where the interpreter stopped
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Waiting for the wait to be resolved
    Suspended(Wait),
    /// Every statement has run
    Finished,
}

/// Executes one run's script
pub struct Interpreter {
    run_id: String,
    run_dir: PathBuf,
    script: Arc<Script>,
    steps: Arc<StepRegistry>,
    continuation: Continuation,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("run_id", &self.run_id)
            .field("continuation", &self.continuation)
            .finish()
    }
}

impl Interpreter {
    /// Interpreter positioned before the first statement
    pub fn new(run_id: &str, run_dir: &Path, script: Arc<Script>, steps: Arc<StepRegistry>) -> Self {
        let continuation = Continuation::new(&script);
        Self::from_continuation(run_id, run_dir, script, steps, continuation)
    }

    /// Interpreter continuing from a restored continuation
    pub fn from_continuation(
        run_id: &str,
        run_dir: &Path,
        script: Arc<Script>,
        steps: Arc<StepRegistry>,
        continuation: Continuation,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            script,
            steps,
            continuation,
        }
    }

    pub fn continuation(&self) -> &Continuation {
        &self.continuation
    }

    pub fn pending(&self) -> Option<&PendingStep> {
        self.continuation.pending.as_ref()
    }

    pub fn bindings(&self) -> &BTreeMap<String, Value> {
        &self.continuation.bindings
    }

    /// Let the suspended step recover after a restart
    pub async fn on_resume(&self) -> Result<()> {
        if let Some(pending) = &self.continuation.pending {
            let step = self.steps.get(&pending.function)?;
            step.on_resume(&pending.wait).await?;
        }
        Ok(())
    }

    /// Finish the suspended step with `value`
    pub async fn complete_pending(&mut self, graph: &mut FlowGraph, value: Value) -> Result<()> {
        let pending = self
            .continuation
            .pending
            .clone()
            .ok_or_else(|| FlowError::InvalidState("no step is suspended".to_string()))?;
        let node = graph.index().get(pending.node).cloned().ok_or_else(|| {
            FlowError::GraphConsistency(format!("suspended node {} is missing", pending.node))
        })?;

        graph.complete_timing(node).await?;
        graph.flush().await?;
        if let Some(name) = &pending.bind {
            self.continuation.bindings.insert(name.clone(), value);
        }
        self.continuation.pending = None;

        tracing::debug!(run_id = %self.run_id, node = %pending.node, "Completed suspended step");
        Ok(())
    }

    /// Run statements until a step suspends or the script ends
    pub async fn advance(&mut self, graph: &mut FlowGraph) -> Result<Advance> {
        if let Some(pending) = &self.continuation.pending {
            return Ok(Advance::Suspended(pending.wait.clone()));
        }

        loop {
            let Some(frame) = self.continuation.frames.last() else {
                return Ok(Advance::Finished);
            };
            let path = frame.path.clone();
            let index = frame.next;
            let statement = self.script.statements(&path)?.get(index).cloned();

            let Some(statement) = statement else {
                self.close_frame(graph).await?;
                continue;
            };

            match statement {
                Statement::Block { block, args, .. } => {
                    let args = resolve(&args, &self.continuation.bindings);
                    let start = graph
                        .start_step(graph.index().head_ids(), &block, &args, false)
                        .await?;
                    let body_start = graph
                        .start_step(vec![start.id()], &block, &Value::Null, true)
                        .await?;

                    self.bump(index);
                    let mut body_path = path;
                    body_path.push(index);
                    self.continuation.frames.push(Frame {
                        path: body_path,
                        next: 0,
                        block: Some(OpenBlock {
                            function: block,
                            start: start.id(),
                            body_start: body_start.id(),
                        }),
                    });
                }
                Statement::Step { step, args, bind } => {
                    let args = resolve(&args, &self.continuation.bindings);
                    let function = self.steps.get(&step)?;
                    let node = graph
                        .atom_step(graph.index().head_ids(), &step, &args)
                        .await?;
                    self.bump(index);

                    let mut ctx = StepContext::new(&self.run_id, node.id(), args);
                    let outcome = function.start(&mut ctx).await;
                    let node = self.write_log(graph, node, ctx.take_log()).await?;

                    match outcome? {
                        StepOutcome::Completed(value) => {
                            graph.complete_timing(node).await?;
                            graph.flush().await?;
                            if let Some(name) = bind {
                                self.continuation.bindings.insert(name, value);
                            }
                        }
                        StepOutcome::Waiting(wait) => {
                            tracing::debug!(
                                run_id = %self.run_id,
                                node = %node.id(),
                                wait = %wait,
                                "Step suspended"
                            );
                            self.continuation.pending = Some(PendingStep {
                                node: node.id(),
                                function: step,
                                wait: wait.clone(),
                                bind,
                            });
                            return Ok(Advance::Suspended(wait));
                        }
                    }
                }
            }
        }
    }

    fn bump(&mut self, index: usize) {
        if let Some(frame) = self.continuation.frames.last_mut() {
            frame.next = index + 1;
        }
    }

    async fn close_frame(&mut self, graph: &mut FlowGraph) -> Result<()> {
        if let Some(Frame {
            block: Some(block), ..
        }) = self.continuation.frames.last().cloned()
        {
            graph.end_step(block.body_start).await?;
            graph.end_step(block.start).await?;
        }
        self.continuation.frames.pop();
        Ok(())
    }

    /// Write the step's log lines and reference them from its node
    async fn write_log(
        &self,
        graph: &mut FlowGraph,
        mut node: FlowNode,
        lines: Vec<String>,
    ) -> Result<FlowNode> {
        if lines.is_empty() {
            return Ok(node);
        }

        let relative = format!("{}/{}.log", LOGS_DIR, node.id());
        let mut text = lines.join("\n");
        text.push('\n');
        tokio::fs::create_dir_all(self.run_dir.join(LOGS_DIR))
            .await
            .map_err(StorageError::from)?;
        write_atomic(
            &self.run_dir.join(&relative),
            text.as_bytes(),
            graph.is_persisted_fully(),
        )
        .await?;

        node.add_action(NodeAction::Log { path: relative });
        graph.update_node(node.clone()).await?;
        Ok(node)
    }
}

/// Replace `"${name}"` strings with bound values
fn resolve(args: &Value, bindings: &BTreeMap<String, Value>) -> Value {
    match args {
        Value::String(s) => s
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .and_then(|name| bindings.get(name))
            .cloned()
            .unwrap_or_else(|| args.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, bindings)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, bindings)))
                .collect(),
        ),
        other => other.clone(),
    }
}
