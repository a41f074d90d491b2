//! Batched node storage
//!
//! [`LumpNodeStorage`] keeps every node of a run in memory and writes them all
//! to a single file, `flow-nodes.json`, when [`flush`](FlowNodeStorage::flush)
//! is called. Saves cost nothing beyond a map insert; in exchange, nodes
//! created since the last flush are lost if the process dies.

use crate::atomic::write_atomic;
use crate::error::{Result, StorageError};
use crate::node::{FlowNode, NodeId};
use crate::serializer::{JsonSerializer, SerializerProtocol};
use crate::traits::FlowNodeStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the lump unit inside a run directory
pub const LUMP_FILE: &str = "flow-nodes.json";

#[derive(Serialize, Deserialize)]
struct LumpFile {
    nodes: Vec<FlowNode>,
}

/// Node storage that flushes all nodes as one unit
#[derive(Debug)]
pub struct LumpNodeStorage {
    path: PathBuf,
    nodes: BTreeMap<NodeId, FlowNode>,
    dirty: bool,
    serializer: JsonSerializer,
}

impl LumpNodeStorage {
    /// Open the lump unit in `dir`, loading whatever was last flushed
    pub async fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(LUMP_FILE);
        let serializer = JsonSerializer::new();

        let nodes = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: LumpFile = serializer.loads(&bytes).map_err(|e| {
                    StorageError::corrupt(path.display().to_string(), e.to_string())
                })?;
                file.nodes.into_iter().map(|n| (n.id(), n)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), nodes = nodes.len(), "Opened lump node storage");

        Ok(Self {
            path,
            nodes,
            dirty: false,
            serializer,
        })
    }

    /// Whether saved nodes are waiting for a flush
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of nodes held in memory
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl FlowNodeStorage for LumpNodeStorage {
    async fn save(&mut self, node: &FlowNode) -> Result<()> {
        self.nodes.insert(node.id(), node.clone());
        self.dirty = true;
        Ok(())
    }

    async fn load(&self, id: NodeId) -> Result<FlowNode> {
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("flow node {}", id)))
    }

    async fn load_all(&self) -> Result<Vec<FlowNode>> {
        Ok(self.nodes.values().cloned().collect())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let file = LumpFile {
            nodes: self.nodes.values().cloned().collect(),
        };
        let bytes = self.serializer.dumps(&file)?;
        write_atomic(&self.path, &bytes, false).await?;
        self.dirty = false;

        tracing::trace!(path = %self.path.display(), nodes = file.nodes.len(), "Flushed lump node storage");
        Ok(())
    }

    fn is_persisted_fully(&self) -> bool {
        false
    }
}
