//! The flow graph of a run
//!
//! [`FlowGraph`] is the write path for a run's execution trace. Each operation
//! appends exactly one node, moves the head set, and hands the node to the
//! run's [`NodeStore`]:
//!
//! ```text
//!  start_run()          ──►  FlowStart
//!  start_step(parents)  ──►  StepStart ─┐
//!  atom_step(parents)   ──►  Atom       │ nested / sequenced
//!  end_step(start)      ──►  StepEnd  ◄─┘
//!  end_run(parents)     ──►  FlowEnd
//! ```
//!
//! The in-memory [`NodeIndex`] only changes after the storage accepted the
//! node, so a failed write leaves the graph exactly as it was and the caller
//! sees the error.
//!
//! # Checkpoints
//!
//! With the lump strategy the buffered nodes are flushed when the run starts,
//! after every completed step and when the run ends. The per-node strategy is
//! durable on every save and its flush is a no-op.

pub mod index;
pub mod scanner;

pub use index::NodeIndex;
pub use scanner::DepthFirstScanner;

use crate::error::{FlowError, Result};
use crate::retry::RetryPolicy;
use chrono::Utc;
use flow_storage::{
    FlowNode, FlowNodeStorage, NodeAction, NodeId, NodeKind, NodeStore, RunResult, StorageError,
    StorageStrategy,
};
use serde_json::Value;
use std::path::Path;

/// Flow graph of one run, backed by its node storage
#[derive(Debug)]
pub struct FlowGraph {
    run_id: String,
    index: NodeIndex,
    store: NodeStore,
    retry: RetryPolicy,
}

impl FlowGraph {
    /// Open an empty graph for a new run
    pub async fn create(
        run_id: &str,
        strategy: StorageStrategy,
        run_dir: &Path,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let store = NodeStore::open(strategy, run_dir).await?;
        Ok(Self {
            run_id: run_id.to_string(),
            index: NodeIndex::new(),
            store,
            retry,
        })
    }

    /// Load the graph of an existing run and rebuild its head set
    pub async fn load(
        run_id: &str,
        strategy: StorageStrategy,
        run_dir: &Path,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let store = NodeStore::open(strategy, run_dir).await?;
        let nodes = store.load_all().await?;
        let index = NodeIndex::from_nodes(nodes)?;

        tracing::debug!(
            run_id = %run_id,
            nodes = index.len(),
            heads = ?index.head_ids(),
            "Loaded flow graph"
        );
        Ok(Self {
            run_id: run_id.to_string(),
            index,
            store,
            retry,
        })
    }

    /// Append the start node of the run
    pub async fn start_run(&mut self) -> Result<FlowNode> {
        if !self.index.is_empty() {
            return Err(FlowError::GraphConsistency(format!(
                "run {} already started",
                self.run_id
            )));
        }
        let node = FlowNode::new(NodeId(1), NodeKind::FlowStart, vec![]).with_action(
            NodeAction::Timing {
                started_at: Utc::now(),
                elapsed_ms: None,
            },
        );
        self.append(node.clone()).await?;
        self.flush().await?;
        Ok(node)
    }

    /// Append the start of a block step, or of its body when `body` is set
    pub async fn start_step(
        &mut self,
        parents: Vec<NodeId>,
        function: &str,
        args: &Value,
        body: bool,
    ) -> Result<FlowNode> {
        let kind = NodeKind::StepStart {
            function: function.to_string(),
            body,
        };
        let node = self.step_node(kind, parents, args);
        self.append(node.clone()).await?;
        Ok(node)
    }

    /// Append a plain step invocation
    pub async fn atom_step(
        &mut self,
        parents: Vec<NodeId>,
        function: &str,
        args: &Value,
    ) -> Result<FlowNode> {
        let kind = NodeKind::Atom {
            function: function.to_string(),
        };
        let node = self.step_node(kind, parents, args);
        self.append(node.clone()).await?;
        Ok(node)
    }

    fn step_node(&self, kind: NodeKind, parents: Vec<NodeId>, args: &Value) -> FlowNode {
        let mut node = FlowNode::new(self.index.next_id(), kind, parents).with_action(
            NodeAction::Timing {
                started_at: Utc::now(),
                elapsed_ms: None,
            },
        );
        if !args.is_null() {
            node.add_action(NodeAction::Arguments {
                values: args.clone(),
            });
        }
        if let Some(name) = args.get("name").and_then(Value::as_str) {
            node.add_action(NodeAction::Label {
                text: name.to_string(),
            });
        }
        node
    }

    /// Close the step opened by `start`, after the current heads
    pub async fn end_step(&mut self, start: NodeId) -> Result<FlowNode> {
        let (node, opened) = self.step_end_node(start)?;
        self.append(node.clone()).await?;
        self.complete_timing(opened).await?;
        self.flush().await?;
        Ok(node)
    }

    fn step_end_node(&self, start: NodeId) -> Result<(FlowNode, FlowNode)> {
        let opened = self.index.get(start).cloned().ok_or_else(|| {
            FlowError::GraphConsistency(format!("cannot end unknown step {}", start))
        })?;
        let function = match opened.kind() {
            NodeKind::StepStart { function, .. } => function.clone(),
            _ => {
                return Err(FlowError::GraphConsistency(format!(
                    "node {} is not a step start",
                    start
                )))
            }
        };

        let node = FlowNode::new(
            self.index.next_id(),
            NodeKind::StepEnd { start, function },
            self.index.head_ids(),
        );
        Ok((node, opened))
    }

    fn flow_end_node(&self, parents: Vec<NodeId>, result: RunResult) -> Result<FlowNode> {
        let start = self
            .index
            .flow_start()
            .map(|n| n.id())
            .ok_or_else(|| FlowError::GraphConsistency("run has no start node".to_string()))?;
        Ok(FlowNode::new(
            self.index.next_id(),
            NodeKind::FlowEnd { start, result },
            parents,
        ))
    }

    /// Close every open block, innermost first, and end the run.
    ///
    /// Once a write fails the remaining nodes are only added in memory, so the
    /// graph is terminal either way; the first storage error is returned.
    pub async fn terminate(&mut self, result: RunResult) -> Result<()> {
        let mut failure: Option<FlowError> = None;

        while let Some(start) = self.index.open_blocks().first().map(|n| n.id()) {
            if failure.is_none() {
                if let Err(e) = self.end_step(start).await {
                    failure = Some(e);
                }
            }
            if self.index.open_blocks().first().map(|n| n.id()) == Some(start) {
                let (node, _) = self.step_end_node(start)?;
                self.index.append(node)?;
            }
        }

        if self.index.flow_end().is_none() {
            if failure.is_none() {
                if let Err(e) = self.end_run(self.index.head_ids(), result).await {
                    failure = Some(e);
                }
            }
            if self.index.flow_end().is_none() {
                let node = self.flow_end_node(self.index.head_ids(), result)?;
                tracing::warn!(
                    run_id = %self.run_id,
                    node = %node.id(),
                    "Run ended in memory only, storage refused the end node"
                );
                self.index.append(node)?;
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record the elapsed time of a finished step node
    pub async fn complete_timing(&mut self, mut node: FlowNode) -> Result<FlowNode> {
        if let Some((started_at, None)) = node.timing() {
            let elapsed = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
            node.add_action(NodeAction::Timing {
                started_at,
                elapsed_ms: Some(elapsed),
            });
            self.update_node(node.clone()).await?;
        }
        Ok(node)
    }

    /// Append the end node of the run
    pub async fn end_run(&mut self, parents: Vec<NodeId>, result: RunResult) -> Result<FlowNode> {
        if self.index.flow_end().is_some() {
            return Err(FlowError::GraphConsistency(format!(
                "run {} already ended",
                self.run_id
            )));
        }

        let node = self.flow_end_node(parents, result)?;
        self.append(node.clone()).await?;
        self.flush().await?;

        tracing::info!(run_id = %self.run_id, node = %node.id(), result = %result, "Run ended");
        Ok(node)
    }

    /// Store a new version of an existing node
    pub async fn update_node(&mut self, node: FlowNode) -> Result<()> {
        self.save(&node).await?;
        self.index.replace(node)
    }

    /// Make every node written so far durable
    pub async fn flush(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.flush().await {
                Ok(()) => return Ok(()),
                Err(e) => self.backoff(attempt, e).await?,
            }
        }
    }

    async fn append(&mut self, node: FlowNode) -> Result<()> {
        self.save(&node).await?;
        self.index.append(node)
    }

    async fn save(&mut self, node: &FlowNode) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save(node).await {
                Ok(()) => {
                    tracing::trace!(run_id = %self.run_id, node = %node.id(), "Saved node");
                    return Ok(());
                }
                Err(e) => self.backoff(attempt, e).await?,
            }
        }
    }

    /// Wait before the next attempt, or give up with the error
    async fn backoff(&self, attempt: usize, error: StorageError) -> Result<()> {
        if !error.is_transient() {
            return Err(error.into());
        }
        if !self.retry.should_retry(attempt) {
            tracing::error!(
                run_id = %self.run_id,
                attempt,
                error = %error,
                "Storage write failed, giving up"
            );
            return Err(FlowError::TransientStorage {
                attempts: attempt,
                source: error,
            });
        }

        let delay = self.retry.calculate_delay(attempt - 1);
        tracing::warn!(
            run_id = %self.run_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Storage write failed, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn index(&self) -> &NodeIndex {
        &self.index
    }

    /// Current heads, ordered by id
    pub fn current_heads(&self) -> Vec<&FlowNode> {
        self.index.heads()
    }

    /// Restartable depth-first traversal of every node
    pub fn all_nodes(&self) -> DepthFirstScanner<'_> {
        self.index.scan()
    }

    /// The node storage backing this graph
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.store.strategy()
    }

    pub fn is_persisted_fully(&self) -> bool {
        self.store.is_persisted_fully()
    }
}
