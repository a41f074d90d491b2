//! Node storage with one durable file per node
//!
//! [`PerNodeStorage`] writes `nodes/<id>.json` synchronously on every
//! [`save`](FlowNodeStorage::save), fsyncing before it returns. After a crash
//! the directory holds every node that any `save()` call reported as stored.

use crate::atomic::{is_temp_file, write_atomic};
use crate::error::{Result, StorageError};
use crate::node::{FlowNode, NodeId};
use crate::serializer::{JsonSerializer, SerializerProtocol};
use crate::traits::FlowNodeStorage;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Directory holding node files inside a run directory
pub const NODES_DIR: &str = "nodes";

/// Node storage writing each node as its own durable unit
#[derive(Debug)]
pub struct PerNodeStorage {
    dir: PathBuf,
    cache: BTreeMap<NodeId, FlowNode>,
    serializer: JsonSerializer,
}

impl PerNodeStorage {
    /// Open (creating if needed) the node directory under `run_dir`
    pub async fn open(run_dir: &Path) -> Result<Self> {
        let dir = run_dir.join(NODES_DIR);
        fs::create_dir_all(&dir).await?;

        Ok(Self {
            dir,
            cache: BTreeMap::new(),
            serializer: JsonSerializer::new(),
        })
    }

    fn node_path(&self, id: NodeId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read_node(&self, path: &Path) -> Result<FlowNode> {
        let bytes = fs::read(path).await?;
        self.serializer
            .loads(&bytes)
            .map_err(|e| StorageError::corrupt(path.display().to_string(), e.to_string()))
    }
}

#[async_trait]
impl FlowNodeStorage for PerNodeStorage {
    async fn save(&mut self, node: &FlowNode) -> Result<()> {
        let bytes = self.serializer.dumps(node)?;
        write_atomic(&self.node_path(node.id()), &bytes, true).await?;
        self.cache.insert(node.id(), node.clone());
        Ok(())
    }

    async fn load(&self, id: NodeId) -> Result<FlowNode> {
        if let Some(node) = self.cache.get(&id) {
            return Ok(node.clone());
        }

        let path = self.node_path(id);
        match self.read_node(&path).await {
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("flow node {}", id)))
            }
            other => other,
        }
    }

    async fn load_all(&self) -> Result<Vec<FlowNode>> {
        let mut nodes = BTreeMap::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let node = self.read_node(&path).await?;
            nodes.insert(node.id(), node);
        }

        // Anything saved in this process is at least as fresh as the disk.
        for (id, node) in &self.cache {
            nodes.insert(*id, node.clone());
        }

        Ok(nodes.into_values().collect())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_persisted_fully(&self) -> bool {
        true
    }
}
