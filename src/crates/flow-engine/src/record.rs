//! Persistent run record
//!
//! `run.json` is the small piece of state that tells a restarting process
//! what a run directory contains: which durability level the run was created
//! with, whether it is still building, whether the last owner shut down in an
//! orderly way, and which continuation generation is current. It also keeps
//! the run's script, so the definition stays retrievable after the run ends.

use crate::definition::Script;
use crate::durability::DurabilityLevel;
use crate::error::{FlowError, Result};
use chrono::{DateTime, Utc};
use flow_storage::atomic::write_atomic;
use flow_storage::{ContinuationHandle, JsonSerializer, RunResult, SerializerProtocol, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of the record inside a run directory
pub const RUN_RECORD_FILE: &str = "run.json";

/// Whether the run can still make progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Building,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub name: String,
    pub durability: DurabilityLevel,
    pub script: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default)]
    pub result: Option<RunResult>,
    /// Set by an orderly shutdown, cleared as soon as a resume starts
    #[serde(default)]
    pub persisted_clean: bool,
    #[serde(default)]
    pub continuation: Option<ContinuationHandle>,
}

impl RunRecord {
    pub fn new(run_id: &str, script: &Script, durability: DurabilityLevel) -> Self {
        Self {
            run_id: run_id.to_string(),
            name: script.name().to_string(),
            durability,
            script: script.source().to_string(),
            created_at: Utc::now(),
            status: RunStatus::Building,
            result: None,
            persisted_clean: false,
            continuation: None,
        }
    }

    pub async fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(RUN_RECORD_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FlowError::RunNotFound(run_dir.display().to_string())
            } else {
                FlowError::Storage(StorageError::Io(e))
            }
        })?;
        Ok(JsonSerializer::new().loads(&bytes)?)
    }

    pub async fn save(&self, run_dir: &Path) -> Result<()> {
        let bytes = JsonSerializer::new().dumps(self)?;
        write_atomic(&run_dir.join(RUN_RECORD_FILE), &bytes, true).await?;
        Ok(())
    }

    pub fn is_building(&self) -> bool {
        self.status == RunStatus::Building
    }

    /// Mark the run terminal with `result`
    pub fn complete(&mut self, result: RunResult) {
        self.status = RunStatus::Completed;
        self.result = Some(result);
        self.continuation = None;
        self.persisted_clean = false;
    }
}
