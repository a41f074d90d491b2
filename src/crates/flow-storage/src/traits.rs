//! Node storage capability shared by every persistence strategy
//!
//! This module defines **[`FlowNodeStorage`]** - the seam between the flow graph
//! and the disk. The graph hands every new or updated node to `save()`; when
//! and how that node reaches durable storage is the strategy's business.
//!
//! # Strategies
//!
//! | Strategy | Write cost | Survives a crash | `is_persisted_fully()` |
//! |----------|------------|------------------|------------------------|
//! | [`LumpNodeStorage`](crate::LumpNodeStorage) | Memory only until `flush()` | Up to the last flush | `false` |
//! | [`PerNodeStorage`](crate::PerNodeStorage) | One synced file per `save()` | Every saved node | `true` |
//!
//! Both strategies answer reads from memory for nodes saved in the same
//! process, so read-after-write is always consistent.
//!
//! # Ownership
//!
//! Writers take `&mut self`: a run's storage has exactly one owner, which
//! serializes writes for that run without any locking. Different runs own
//! different storage values and never contend.

use crate::error::Result;
use crate::node::{FlowNode, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which persistence strategy a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    /// Batch nodes in memory, write them as one unit at checkpoints
    Lump,
    /// Write every node synchronously as its own unit
    PerNode,
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lump => f.write_str("lump"),
            Self::PerNode => f.write_str("per-node"),
        }
    }
}

/// Persistence of individual flow nodes
#[async_trait]
pub trait FlowNodeStorage: Send + Sync {
    /// Store a new node or a new version of an existing node.
    ///
    /// Returns once the node is readable through [`load`](Self::load). Whether
    /// it is also durable depends on [`is_persisted_fully`](Self::is_persisted_fully).
    async fn save(&mut self, node: &FlowNode) -> Result<()>;

    /// Load a single node
    async fn load(&self, id: NodeId) -> Result<FlowNode>;

    /// Load every stored node, ordered by id
    async fn load_all(&self) -> Result<Vec<FlowNode>>;

    /// Make every saved node durable
    async fn flush(&mut self) -> Result<()>;

    /// Whether each `save()` is durable on return
    fn is_persisted_fully(&self) -> bool;
}
