//! Strategy selection for a run's node storage
//!
//! A run picks its strategy once, when it is created, and keeps it for its
//! whole life. [`NodeStore`] is a closed set of the two strategies rather than
//! a boxed trait object, so the choice is visible (and checkable) through
//! [`NodeStore::strategy`].

use crate::error::Result;
use crate::lump::LumpNodeStorage;
use crate::node::{FlowNode, NodeId};
use crate::per_node::PerNodeStorage;
use crate::traits::{FlowNodeStorage, StorageStrategy};
use async_trait::async_trait;
use std::path::Path;

/// The node storage owned by one run
#[derive(Debug)]
pub enum NodeStore {
    Lump(LumpNodeStorage),
    PerNode(PerNodeStorage),
}

impl NodeStore {
    /// Open the storage for `strategy` inside `run_dir`
    pub async fn open(strategy: StorageStrategy, run_dir: &Path) -> Result<Self> {
        Ok(match strategy {
            StorageStrategy::Lump => Self::Lump(LumpNodeStorage::open(run_dir).await?),
            StorageStrategy::PerNode => Self::PerNode(PerNodeStorage::open(run_dir).await?),
        })
    }

    /// Which strategy backs this store
    pub fn strategy(&self) -> StorageStrategy {
        match self {
            Self::Lump(_) => StorageStrategy::Lump,
            Self::PerNode(_) => StorageStrategy::PerNode,
        }
    }
}

#[async_trait]
impl FlowNodeStorage for NodeStore {
    async fn save(&mut self, node: &FlowNode) -> Result<()> {
        match self {
            Self::Lump(s) => s.save(node).await,
            Self::PerNode(s) => s.save(node).await,
        }
    }

    async fn load(&self, id: NodeId) -> Result<FlowNode> {
        match self {
            Self::Lump(s) => s.load(id).await,
            Self::PerNode(s) => s.load(id).await,
        }
    }

    async fn load_all(&self) -> Result<Vec<FlowNode>> {
        match self {
            Self::Lump(s) => s.load_all().await,
            Self::PerNode(s) => s.load_all().await,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Lump(s) => s.flush().await,
            Self::PerNode(s) => s.flush().await,
        }
    }

    fn is_persisted_fully(&self) -> bool {
        match self {
            Self::Lump(s) => s.is_persisted_fully(),
            Self::PerNode(s) => s.is_persisted_fully(),
        }
    }
}
