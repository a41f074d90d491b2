//! Flow node data structures
//!
//! A run's execution history is recorded as a graph of **[`FlowNode`]**s. Every
//! node points at its predecessors (its parents); the graph grows at its heads
//! and nothing is ever removed while the run is alive.
//!
//! # Node Kinds
//!
//! | Kind | Created when | Notes |
//! |------|--------------|-------|
//! | `FlowStart` | The run starts | Exactly one per run, no parents |
//! | `StepStart` | A block step opens, and again when its body starts | `body` marks the second one |
//! | `Atom` | A plain step is invoked | The generic action node |
//! | `StepEnd` | A block body ends, and again when the block closes | Points back at its `StepStart` |
//! | `FlowEnd` | The run reaches a terminal state | Carries the [`RunResult`] |
//!
//! A block wrapping one plain step, followed by another plain step, produces:
//!
//! ```text
//! FlowStart(1) -> StepStart(2) -> StepStart(3, body) -> Atom(4)
//!              -> StepEnd(5, start=3) -> StepEnd(6, start=2) -> Atom(7) -> FlowEnd(8)
//! ```
//!
//! # Metadata
//!
//! [`NodeAction`]s can be attached after a node is created (timing is completed
//! when a step finishes, a log reference appears once the step writes output).
//! At most one action of each variant is kept; attaching another replaces it.
//! The id, kind and parents never change once the node exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;

/// Identifier of a node within a single run.
///
/// Ids are handed out in increasing order, so a parent always has a smaller id
/// than its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The id following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a terminated run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Failure,
    Aborted,
}

impl RunResult {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
        };
        f.write_str(label)
    }
}

/// What a node represents in the execution trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Start of the run
    FlowStart,

    /// End of the run
    FlowEnd { start: NodeId, result: RunResult },

    /// Start of a block step, or of its body when `body` is set
    StepStart { function: String, body: bool },

    /// End of a block step or of its body
    StepEnd { start: NodeId, function: String },

    /// A plain step invocation
    Atom { function: String },
}

/// Metadata attached to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NodeAction {
    /// When the node started and, once known, how long it took
    Timing {
        started_at: DateTime<Utc>,
        elapsed_ms: Option<u64>,
    },

    /// Arguments the step was invoked with
    Arguments { values: serde_json::Value },

    /// Location of the step's log output, relative to the run directory
    Log { path: String },

    /// Display name
    Label { text: String },
}

/// A single vertex of the flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    id: NodeId,
    kind: NodeKind,
    parents: Vec<NodeId>,
    #[serde(default)]
    actions: Vec<NodeAction>,
}

impl FlowNode {
    /// Create a node. Parents keep the order they are given in.
    pub fn new(id: NodeId, kind: NodeKind, parents: Vec<NodeId>) -> Self {
        Self {
            id,
            kind,
            parents,
            actions: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn actions(&self) -> &[NodeAction] {
        &self.actions
    }

    /// Attach an action, replacing any existing action of the same variant
    pub fn add_action(&mut self, action: NodeAction) {
        let slot = mem::discriminant(&action);
        self.actions.retain(|a| mem::discriminant(a) != slot);
        self.actions.push(action);
    }

    /// Builder form of [`add_action`](Self::add_action)
    pub fn with_action(mut self, action: NodeAction) -> Self {
        self.add_action(action);
        self
    }

    pub fn is_flow_start(&self) -> bool {
        matches!(self.kind, NodeKind::FlowStart)
    }

    pub fn is_flow_end(&self) -> bool {
        matches!(self.kind, NodeKind::FlowEnd { .. })
    }

    pub fn is_step_start(&self) -> bool {
        matches!(self.kind, NodeKind::StepStart { .. })
    }

    pub fn is_step_end(&self) -> bool {
        matches!(self.kind, NodeKind::StepEnd { .. })
    }

    pub fn is_atom(&self) -> bool {
        matches!(self.kind, NodeKind::Atom { .. })
    }

    /// Nodes that represent a step being invoked: block starts and atoms.
    pub fn is_step_node(&self) -> bool {
        self.is_step_start() || self.is_atom()
    }

    /// Name of the step function behind this node, if any
    pub fn function_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::StepStart { function, .. }
            | NodeKind::StepEnd { function, .. }
            | NodeKind::Atom { function } => Some(function),
            NodeKind::FlowStart | NodeKind::FlowEnd { .. } => None,
        }
    }

    /// Human readable name: the label if one is attached, otherwise derived
    /// from the kind.
    pub fn display_name(&self) -> String {
        if let Some(label) = self.label() {
            return label.to_string();
        }
        match &self.kind {
            NodeKind::FlowStart => "Start of Workflow".to_string(),
            NodeKind::FlowEnd { .. } => "End of Workflow".to_string(),
            NodeKind::StepStart { function, body: false } => format!("{} : Start", function),
            NodeKind::StepStart { function, body: true } => format!("{} : Body : Start", function),
            NodeKind::StepEnd { function, .. } => format!("{} : End", function),
            NodeKind::Atom { function } => function.clone(),
        }
    }

    pub fn timing(&self) -> Option<(DateTime<Utc>, Option<u64>)> {
        self.actions.iter().find_map(|a| match a {
            NodeAction::Timing {
                started_at,
                elapsed_ms,
            } => Some((*started_at, *elapsed_ms)),
            _ => None,
        })
    }

    pub fn arguments(&self) -> Option<&serde_json::Value> {
        self.actions.iter().find_map(|a| match a {
            NodeAction::Arguments { values } => Some(values),
            _ => None,
        })
    }

    pub fn log_path(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| match a {
            NodeAction::Log { path } => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn label(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| match a {
            NodeAction::Label { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Result carried by a `FlowEnd` node
    pub fn flow_result(&self) -> Option<RunResult> {
        match self.kind {
            NodeKind::FlowEnd { result, .. } => Some(result),
            _ => None,
        }
    }

    /// For a `StepEnd`, the `StepStart` it closes
    pub fn start_node(&self) -> Option<NodeId> {
        match self.kind {
            NodeKind::StepEnd { start, .. } | NodeKind::FlowEnd { start, .. } => Some(start),
            _ => None,
        }
    }
}

impl fmt::Display for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[id={}]", self.display_name(), self.id)
    }
}
