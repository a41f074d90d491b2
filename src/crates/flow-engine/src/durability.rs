//! Durability levels and the policy they select
//!
//! A run picks its [`DurabilityLevel`] when it is defined and keeps it for its
//! whole life. The level resolves to a [`DurabilityPolicy`]:
//!
//! | Level | Node storage | Continuation flushed | Survives orderly restart | Survives crash |
//! |-------|--------------|----------------------|--------------------------|----------------|
//! | `NoPromises` | lump | never | no | no |
//! | `SurviveCleanRestart` | lump | on orderly shutdown | yes | no |
//! | `FullyDurable` | per node | at every suspension | yes | yes |
//!
//! The policy is a pure value. It holds no state and is consulted by the flow
//! graph (which strategy to open) and by the execution (when to write the
//! continuation).

use flow_storage::StorageStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much of a run survives a process restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    /// Nodes flushed best-effort, continuation never persisted
    NoPromises,
    /// Nodes and continuation flushed on orderly shutdown only
    SurviveCleanRestart,
    /// Every node synced as written, continuation persisted at each suspension
    FullyDurable,
}

impl DurabilityLevel {
    /// Every level, weakest first
    pub const ALL: [DurabilityLevel; 3] = [
        DurabilityLevel::NoPromises,
        DurabilityLevel::SurviveCleanRestart,
        DurabilityLevel::FullyDurable,
    ];

    /// The policy this level selects
    pub fn policy(self) -> DurabilityPolicy {
        DurabilityPolicy::for_level(self)
    }
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        Self::FullyDurable
    }
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoPromises => "no_promises",
            Self::SurviveCleanRestart => "survive_clean_restart",
            Self::FullyDurable => "fully_durable",
        };
        f.write_str(name)
    }
}

impl FromStr for DurabilityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_promises" => Ok(Self::NoPromises),
            "survive_clean_restart" => Ok(Self::SurviveCleanRestart),
            "fully_durable" => Ok(Self::FullyDurable),
            other => Err(format!("unknown durability level '{}'", other)),
        }
    }
}

/// When the suspended continuation is written to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationFlush {
    Never,
    OnOrderlyShutdown,
    OnEverySuspension,
}

/// Concrete persistence behavior for one durability level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityPolicy {
    pub level: DurabilityLevel,
    pub storage: StorageStrategy,
    pub continuation: ContinuationFlush,
}

impl DurabilityPolicy {
    pub fn for_level(level: DurabilityLevel) -> Self {
        let (storage, continuation) = match level {
            DurabilityLevel::NoPromises => (StorageStrategy::Lump, ContinuationFlush::Never),
            DurabilityLevel::SurviveCleanRestart => {
                (StorageStrategy::Lump, ContinuationFlush::OnOrderlyShutdown)
            }
            DurabilityLevel::FullyDurable => {
                (StorageStrategy::PerNode, ContinuationFlush::OnEverySuspension)
            }
        };
        Self {
            level,
            storage,
            continuation,
        }
    }

    /// Whether the continuation is written each time the run suspends
    pub fn persists_on_suspension(&self) -> bool {
        self.continuation == ContinuationFlush::OnEverySuspension
    }

    /// Whether an orderly shutdown writes the continuation
    pub fn persists_on_shutdown(&self) -> bool {
        self.continuation != ContinuationFlush::Never
    }

    /// Whether a run interrupted in the given way may be resumed.
    ///
    /// `orderly` is true when the last process to own the run finished its
    /// shutdown flush.
    pub fn permits_resume(&self, orderly: bool) -> bool {
        match self.continuation {
            ContinuationFlush::Never => false,
            ContinuationFlush::OnOrderlyShutdown => orderly,
            ContinuationFlush::OnEverySuspension => true,
        }
    }
}
