//! Common test utilities: engine setup and restart simulation

#![allow(dead_code)]

use flow_engine::{Engine, EngineConfig, Phase, StepRegistry};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Block with a signal wait inside, then a plain step
pub const BASIC_JOB: &str = r#"
name: basic
steps:
  - block: node
    body:
      - step: semaphore
        args: { name: halt }
  - step: echo
    args: { message: done }
"#;

/// Nodes of a finished [`BASIC_JOB`] run:
/// FlowStart, node start, body start, semaphore, body end, node end, echo, FlowEnd
pub const BASIC_JOB_NODES: usize = 8;

pub const SLEEPER_JOB: &str = r#"
name: sleeper
steps:
  - step: sleep
    args: { time: 300, unit: milliseconds }
"#;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_root(root);
    config.storage.retry.max_attempts = 2;
    config.storage.retry.initial_interval_ms = 5;
    config
}

pub async fn engine(root: &Path) -> Engine {
    engine_with(root, StepRegistry::with_builtins()).await
}

pub async fn engine_with(root: &Path, steps: StepRegistry) -> Engine {
    Engine::open(config(root), steps)
        .await
        .expect("Failed to open engine")
}

/// Stop without any orderly flush, as a killed process would.
///
/// The on-disk state is copied into a fresh directory before the engine is
/// dropped, so the returned root holds exactly what had reached the disk.
pub fn simulate_abrupt_failure(running: Engine, root: &Path) -> TempDir {
    let snapshot = TempDir::new().expect("Failed to create temp dir");
    copy_tree(root, snapshot.path()).expect("Failed to snapshot run state");
    drop(running);
    snapshot
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Orderly shutdown followed by a fresh engine over the same root
pub async fn clean_restart(running: Engine, root: &Path) -> Engine {
    running.shutdown().await.expect("Shutdown failed");
    drop(running);
    engine(root).await
}

/// Wait for the resume started by [`Engine::open`] to settle
pub async fn settled(engine: &Engine, run_id: &str) -> Phase {
    engine
        .resume_handle(run_id)
        .expect("Run not loaded")
        .wait(TIMEOUT)
        .await
        .expect("Resume did not settle")
}

pub async fn node_count(engine: &Engine, run_id: &str) -> usize {
    let execution = engine.execution(run_id).expect("Run not loaded");
    let execution = execution.lock().await;
    execution.all_nodes().count()
}
