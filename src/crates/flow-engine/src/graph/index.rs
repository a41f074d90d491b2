//! In-memory index of a run's flow graph
//!
//! [`NodeIndex`] holds every node of one run together with the current head
//! set. It performs no I/O; [`FlowGraph`](super::FlowGraph) keeps it in step
//! with the node storage.
//!
//! # Structural rules
//!
//! ```text
//!   1 FlowStart            exactly one, no parents
//!   │
//!   2 StepStart(node)      every other node has >= 1 parent,
//!   │                      and every parent id < the child id
//!   3 StepStart(body)
//!   │
//!   4 Atom(semaphore)      heads = nodes nobody names as a parent
//! ```
//!
//! Because parent ids are strictly smaller than child ids the graph is acyclic,
//! and because only the start node is parentless every head reaches it.

use crate::error::{FlowError, Result};
use flow_storage::{FlowNode, NodeId, NodeKind};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::scanner::DepthFirstScanner;

/// Nodes and head set of one flow graph
#[derive(Debug, Clone, Default)]
pub struct NodeIndex {
    nodes: BTreeMap<NodeId, FlowNode>,
    heads: BTreeSet<NodeId>,
}

impl NodeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from stored nodes, checking the structural rules
    pub fn from_nodes(nodes: impl IntoIterator<Item = FlowNode>) -> Result<Self> {
        let nodes: BTreeMap<NodeId, FlowNode> = nodes.into_iter().map(|n| (n.id(), n)).collect();

        let mut referenced = HashSet::new();
        let mut starts = 0;
        for node in nodes.values() {
            Self::check_parents(&nodes, node)?;
            if node.is_flow_start() {
                starts += 1;
            }
            referenced.extend(node.parents().iter().copied());
        }

        if !nodes.is_empty() && starts != 1 {
            return Err(FlowError::GraphConsistency(format!(
                "expected exactly one start node, found {}",
                starts
            )));
        }

        let heads = nodes
            .keys()
            .copied()
            .filter(|id| !referenced.contains(id))
            .collect();

        Ok(Self { nodes, heads })
    }

    fn check_parents(nodes: &BTreeMap<NodeId, FlowNode>, node: &FlowNode) -> Result<()> {
        if node.is_flow_start() {
            if !node.parents().is_empty() {
                return Err(FlowError::GraphConsistency(format!(
                    "start node {} has parents",
                    node.id()
                )));
            }
            return Ok(());
        }

        if node.parents().is_empty() {
            return Err(FlowError::GraphConsistency(format!(
                "node {} has no parents",
                node.id()
            )));
        }
        for parent in node.parents() {
            if *parent >= node.id() || !nodes.contains_key(parent) {
                return Err(FlowError::GraphConsistency(format!(
                    "node {} names invalid parent {}",
                    node.id(),
                    parent
                )));
            }
        }
        if let Some(start) = node.start_node() {
            if start >= node.id() || !nodes.contains_key(&start) {
                return Err(FlowError::GraphConsistency(format!(
                    "node {} closes unknown start {}",
                    node.id(),
                    start
                )));
            }
        }
        Ok(())
    }

    /// Add a newly created node, replacing its parents in the head set
    pub fn append(&mut self, node: FlowNode) -> Result<()> {
        if node.id() != self.next_id() {
            return Err(FlowError::GraphConsistency(format!(
                "node {} appended out of order, expected {}",
                node.id(),
                self.next_id()
            )));
        }
        if node.is_flow_start() && !self.nodes.is_empty() {
            return Err(FlowError::GraphConsistency(
                "a start node already exists".to_string(),
            ));
        }
        Self::check_parents(&self.nodes, &node)?;

        for parent in node.parents() {
            self.heads.remove(parent);
        }
        self.heads.insert(node.id());
        self.nodes.insert(node.id(), node);
        Ok(())
    }

    /// Replace a stored node with a new version carrying more metadata
    pub fn replace(&mut self, node: FlowNode) -> Result<()> {
        match self.nodes.get(&node.id()) {
            Some(existing) if existing.kind() == node.kind() && existing.parents() == node.parents() => {
                self.nodes.insert(node.id(), node);
                Ok(())
            }
            Some(_) => Err(FlowError::GraphConsistency(format!(
                "node {} identity cannot change",
                node.id()
            ))),
            None => Err(FlowError::GraphConsistency(format!(
                "node {} does not exist",
                node.id()
            ))),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Id the next appended node must carry
    pub fn next_id(&self) -> NodeId {
        self.nodes
            .keys()
            .next_back()
            .map(|id| id.next())
            .unwrap_or(NodeId(1))
    }

    /// Current head ids, ordered by id
    pub fn head_ids(&self) -> Vec<NodeId> {
        self.heads.iter().copied().collect()
    }

    /// Current head nodes, ordered by id
    pub fn heads(&self) -> Vec<&FlowNode> {
        self.heads.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    /// The unique start node
    pub fn flow_start(&self) -> Option<&FlowNode> {
        self.nodes.values().next().filter(|n| n.is_flow_start())
    }

    /// The end node, if the graph has been terminated
    pub fn flow_end(&self) -> Option<&FlowNode> {
        self.heads().into_iter().find(|n| n.is_flow_end())
    }

    /// Step starts that no step end closes yet, innermost first
    pub fn open_blocks(&self) -> Vec<&FlowNode> {
        let closed: HashSet<NodeId> = self
            .nodes
            .values()
            .filter_map(|n| match n.kind() {
                NodeKind::StepEnd { start, .. } => Some(*start),
                _ => None,
            })
            .collect();

        self.nodes
            .values()
            .rev()
            .filter(|n| n.is_step_start() && !closed.contains(&n.id()))
            .collect()
    }

    /// Every node, ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    /// Depth-first traversal from the heads back to the start node
    pub fn scan(&self) -> DepthFirstScanner<'_> {
        DepthFirstScanner::new(self)
    }

    /// Lazily yield the nodes matching `predicate`, in traversal order
    pub fn filter<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = &'a FlowNode> + 'a
    where
        P: FnMut(&&'a FlowNode) -> bool + 'a,
    {
        self.scan().filter(predicate)
    }
}
