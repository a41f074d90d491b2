//! Post-completion cleanup checks
//!
//! A terminal run, whether it succeeded, failed or was aborted, must leave
//! nothing behind. [`verify_completed_cleanly`] inspects a run through the
//! engine and reports every leftover it finds instead of stopping at the
//! first one.

use crate::engine::Engine;
use crate::error::{FlowError, Result};
use flow_storage::NodeId;
use std::collections::HashSet;

/// Result of [`verify_completed_cleanly`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub run_id: String,
    pub violations: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check that `run_id` is terminal and left nothing live behind:
///
/// - the graph has exactly one head and it is a `FlowEnd`
/// - no work is queued and no worker is driving the run
/// - no interpreter is resident
/// - the definition is still retrievable
/// - every block start has its end, and every step node carries timing
///
/// A run that could not be loaded is reported with a single violation.
pub async fn verify_completed_cleanly(engine: &Engine, run_id: &str) -> Result<CleanupReport> {
    if engine.unloadable_result(run_id).is_some() {
        return Ok(CleanupReport {
            run_id: run_id.to_string(),
            violations: vec!["run directory could not be loaded, its graph was not inspected".to_string()],
        });
    }
    let execution = engine
        .execution(run_id)
        .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
    let execution = execution.lock().await;

    let mut report = CleanupReport {
        run_id: run_id.to_string(),
        violations: Vec::new(),
    };
    let mut violation = |message: String| report.violations.push(message);

    if !execution.phase().is_terminal() || execution.is_building() {
        violation(format!("run is not terminal (phase {})", execution.phase()));
    }

    let heads = execution.current_heads();
    match heads.as_slice() {
        [head] if head.is_flow_end() => {}
        _ => violation(format!(
            "expected a single FlowEnd head, found {:?}",
            heads.iter().map(|n| n.id()).collect::<Vec<_>>()
        )),
    }

    let pending = engine.pending_work(run_id);
    if !pending.is_empty() {
        violation(format!("work still queued: {:?}", pending));
    }
    if engine.is_worker_busy(run_id) {
        violation("a worker is still driving the run".to_string());
    }
    if execution.has_interpreter() {
        violation("interpreter is still resident".to_string());
    }
    if execution.script_source().trim().is_empty() {
        violation("definition source is not retrievable".to_string());
    }

    let closed: HashSet<NodeId> = execution
        .graph()
        .index()
        .iter()
        .filter(|n| n.is_step_end())
        .filter_map(|n| n.start_node())
        .collect();
    for node in execution.graph().index().iter() {
        if node.is_step_start() && !closed.contains(&node.id()) {
            violation(format!("block started at node {} was never closed", node.id()));
        }
        if (node.is_step_start() || node.is_atom()) && node.timing().is_none() {
            violation(format!("node {} has no timing", node.id()));
        }
    }

    if !report.is_clean() {
        tracing::warn!(run_id = %run_id, violations = report.violations.len(), "Run left state behind");
    }
    Ok(report)
}
