//! Error types for run execution and recovery
//!
//! # Error Hierarchy
//!
//! ```text
//! FlowError
//! ├── Storage              - Node/continuation storage failure (after retries)
//! ├── TransientStorage     - Storage kept failing for the whole retry budget
//! ├── CorruptContinuation  - Continuation present but unusable
//! ├── GraphConsistency     - Flow graph violates its structural invariants
//! ├── ResumeTimeout        - Resume did not settle within its bound
//! ├── StepFailed           - A step reported failure
//! ├── UnknownStep          - Definition names a step nobody registered
//! ├── Definition           - Workflow definition could not be parsed
//! ├── NoSuchWait           - Signal for a run that is not waiting on it
//! ├── RunNotFound          - No run with the given id
//! ├── InvalidState         - Operation not valid in the run's current phase
//! ├── Config               - Engine configuration problem
//! └── Serialization        - JSON encode/decode failure
//! ```
//!
//! # Where Errors Stop
//!
//! Storage and continuation errors raised while resuming never escape the
//! resume protocol: they turn the resume into a clean failure of that run.
//! Errors raised while a run is executing fail that run only. Nothing here
//! is allowed to take the host process down.

use flow_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors that can occur while running or recovering a workflow
#[derive(Error, Debug)]
pub enum FlowError {
    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Storage failure that persisted through every retry
    #[error("Storage still failing after {attempts} attempts: {source}")]
    TransientStorage {
        attempts: usize,
        #[source]
        source: StorageError,
    },

    /// Continuation exists but cannot be used
    #[error("Corrupt continuation: {0}")]
    CorruptContinuation(String),

    /// Flow graph structure is broken
    #[error("Graph consistency error: {0}")]
    GraphConsistency(String),

    /// Resume did not finish in time
    #[error("Resume did not complete within {0:?}")]
    ResumeTimeout(Duration),

    /// A step failed
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// Step function not registered
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// Workflow definition problem
    #[error("Invalid definition: {0}")]
    Definition(String),

    /// Signal not expected by the run
    #[error("Run {run_id} is not waiting for signal '{signal}'")]
    NoSuchWait { run_id: String, signal: String },

    /// Unknown run
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Operation not valid right now
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Create a step failure
    pub fn step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Errors after which a resume attempt falls back to failing the run
    /// instead of being retried
    pub fn forces_clean_failure(&self) -> bool {
        matches!(
            self,
            Self::CorruptContinuation(_)
                | Self::ResumeTimeout(_)
                | Self::GraphConsistency(_)
                | Self::Storage(_)
                | Self::TransientStorage { .. }
        )
    }
}
