//! Depth-first traversal of a flow graph
//!
//! [`DepthFirstScanner`] walks from the heads back towards the start node,
//! visiting each node once. It is lazy: nothing is visited until the iterator
//! is polled, and a fresh scanner can be created at any time to restart.

use flow_storage::{FlowNode, NodeId};
use std::collections::HashSet;

use super::index::NodeIndex;

/// Iterator over the nodes of a [`NodeIndex`], heads first
#[derive(Debug)]
pub struct DepthFirstScanner<'a> {
    index: &'a NodeIndex,
    stack: Vec<NodeId>,
    visited: HashSet<NodeId>,
}

impl<'a> DepthFirstScanner<'a> {
    pub fn new(index: &'a NodeIndex) -> Self {
        let mut stack = index.head_ids();
        stack.reverse();
        Self {
            index,
            stack,
            visited: HashSet::new(),
        }
    }
}

impl<'a> Iterator for DepthFirstScanner<'a> {
    type Item = &'a FlowNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if !self.visited.insert(id) {
                continue;
            }
            let Some(node) = self.index.get(id) else {
                continue;
            };
            // First parent is explored first
            self.stack.extend(node.parents().iter().rev().copied());
            return Some(node);
        }
        None
    }
}
