//! # flow-engine - Durable Execution of Suspendable Workflow Runs
//!
//! **Runs that survive restarts.** A workflow run is a YAML definition of
//! steps and blocks. While it executes, the engine records every step as a
//! node of an append-only flow graph and keeps the suspended program (the
//! continuation) so a restarted process can pick the run up where it waited.
//!
//! ## Overview
//!
//! - **Flow graph** - every step start, end and invocation becomes a
//!   [`FlowNode`](flow_storage::FlowNode); the graph is the run's history
//! - **Durability levels** - each run chooses how much it survives, trading
//!   write cost for restart safety
//! - **Resume protocol** - on start, every non-terminal run is either resumed
//!   on the wait it was suspended at or failed cleanly, never left half-live
//! - **Clean completion** - a terminal run leaves one `FlowEnd` head, closed
//!   blocks, no queued work and no resident interpreter
//!
//! ## Durability Levels
//!
//! ```text
//!  level                   node storage   continuation written    survives
//!  ─────────────────────   ────────────   ────────────────────    ─────────────────────
//!  no_promises             lump           never                   nothing
//!  survive_clean_restart   lump           on orderly shutdown     orderly restart
//!  fully_durable           per node       at every suspension     orderly and abrupt
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flow_engine::{DurabilityLevel, Engine, EngineConfig, StepRegistry};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> flow_engine::Result<()> {
//!     let engine = Engine::open(EngineConfig::with_root("/tmp/flows"), StepRegistry::with_builtins()).await?;
//!
//!     let run_id = engine
//!         .start_run(
//!             "name: hello\nsteps:\n  - step: semaphore\n    args: go\n  - step: echo\n    args: { message: hi }\n",
//!             Some(DurabilityLevel::FullyDurable),
//!         )
//!         .await?;
//!
//!     engine.signal(&run_id, "go").await?;
//!     let result = engine.wait_for_completion(&run_id, Duration::from_secs(5)).await?;
//!     println!("{} finished: {}", run_id, result);
//!
//!     engine.shutdown().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - [`Engine`], the process-level facade
//! - [`execution`] - [`FlowExecution`], phases, driving and the resume protocol
//! - [`graph`] - [`FlowGraph`], the node index and depth-first scanning
//! - [`interpreter`] - walks the definition and records nodes
//! - [`continuation`] - the serializable suspended program
//! - [`definition`] - YAML workflow definitions
//! - [`steps`] - the [`Step`] trait, built-in steps and the registry
//! - [`durability`] - [`DurabilityLevel`] and the policy it selects
//! - [`scheduler`] - queued work, timers and worker accounting
//! - [`record`] - the per-run record file
//! - [`verify`] - post-completion cleanup checks
//! - [`config`] / [`logging`] - engine configuration and tracing setup
//! - [`retry`] - backoff for transient storage failures
//! - [`error`] - [`FlowError`]

pub mod config;
pub mod continuation;
pub mod definition;
pub mod durability;
pub mod engine;
pub mod error;
pub mod execution;
pub mod graph;
pub mod interpreter;
pub mod logging;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod steps;
pub mod verify;

// Re-export main types
pub use config::{ConfigLoader, EngineConfig};
pub use continuation::Continuation;
pub use definition::{Script, Statement, WorkflowDefinition};
pub use durability::{ContinuationFlush, DurabilityLevel, DurabilityPolicy};
pub use engine::{Engine, ExecutionHandle, ResumeHandle};
pub use error::{FlowError, Result};
pub use execution::{FlowExecution, Phase, ResumeOutcome};
pub use graph::{DepthFirstScanner, FlowGraph, NodeIndex};
pub use logging::init_tracing;
pub use record::{RunRecord, RunStatus};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, WorkItem};
pub use steps::{Step, StepContext, StepOutcome, StepRegistry, Wait};
pub use verify::{verify_completed_cleanly, CleanupReport};

pub use flow_storage::{FlowNode, NodeAction, NodeId, NodeKind, RunResult, StorageStrategy};
