//! # flow-storage - Durable State for Workflow Runs
//!
//! **Persistence primitives** for the flow graph and the suspended program of a
//! workflow run. The execution engine (`flow-engine`) decides *when* to write;
//! this crate decides *how* the bytes reach disk so that a crash at any point
//! leaves something loadable behind.
//!
//! ## Overview
//!
//! A run directory holds three independently loadable units:
//!
//! ```text
//! runs/<run-id>/
//! ├── run.json            run record (written by flow-engine)
//! ├── flow-nodes.json     lump strategy: every node, one file
//! ├── nodes/<id>.json     per-node strategy: one file per node
//! └── program.dat         continuation envelope
//! ```
//!
//! - **[`FlowNode`]** - one vertex of the execution trace, with metadata actions
//! - **[`FlowNodeStorage`]** - the save/load/flush capability for nodes
//! - **[`LumpNodeStorage`]** - nodes batched in memory, flushed as one unit
//! - **[`PerNodeStorage`]** - each node written and synced on save
//! - **[`NodeStore`]** - the strategy a run was created with
//! - **[`ContinuationStore`]** - all-or-nothing storage of opaque program bytes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flow_storage::{FlowNode, FlowNodeStorage, NodeId, NodeKind, NodeStore, StorageStrategy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = std::path::Path::new("/tmp/run-1");
//!     let mut store = NodeStore::open(StorageStrategy::PerNode, dir).await?;
//!
//!     store.save(&FlowNode::new(NodeId(1), NodeKind::FlowStart, vec![])).await?;
//!     assert!(store.is_persisted_fully());
//!
//!     let start = store.load(NodeId(1)).await?;
//!     println!("Loaded {}", start);
//!     Ok(())
//! }
//! ```
//!
//! ## Crash Consistency
//!
//! Every unit is replaced through [`atomic::write_atomic`] (temp file, sync,
//! rename). A reader sees the previous contents or the new contents. The
//! continuation envelope additionally carries a generation and a SHA-256
//! digest, so a handle only ever loads the exact payload it was issued for.
//!
//! ## Module Organization
//!
//! - [`node`] - [`FlowNode`], [`NodeKind`], [`NodeAction`], [`RunResult`]
//! - [`traits`] - [`FlowNodeStorage`] and [`StorageStrategy`]
//! - [`lump`] / [`per_node`] - the two strategies
//! - [`store`] - [`NodeStore`]
//! - [`continuation`] - [`ContinuationStore`] and [`ContinuationHandle`]
//! - [`serializer`] - JSON and bincode serialization protocols
//! - [`error`] - [`StorageError`]

pub mod atomic;
pub mod continuation;
pub mod error;
pub mod lump;
pub mod node;
pub mod per_node;
pub mod serializer;
pub mod store;
pub mod traits;

// Re-export main types
pub use continuation::{ContinuationHandle, ContinuationStore, CONTINUATION_FILE};
pub use error::{Result, StorageError};
pub use lump::{LumpNodeStorage, LUMP_FILE};
pub use node::{FlowNode, NodeAction, NodeId, NodeKind, RunResult};
pub use per_node::{PerNodeStorage, NODES_DIR};
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use store::NodeStore;
pub use traits::{FlowNodeStorage, StorageStrategy};
