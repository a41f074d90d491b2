//! Durability levels across restarts
//!
//! Each level is exercised against an orderly restart (shutdown, then a new
//! engine over the same root) and an abrupt one (the engine is dropped with
//! nothing flushed). Every run must end in a terminal state that passes the
//! cleanup checks.

mod common;

use common::*;
use flow_engine::{
    verify_completed_cleanly, DurabilityLevel, Engine, FlowError, NodeAction, Phase,
    ResumeOutcome, RunResult, Step, StepContext, StepOutcome, StepRegistry, Wait, WorkItem,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn assert_clean(engine: &Engine, run_id: &str) {
    let report = verify_completed_cleanly(engine, run_id).await.unwrap();
    assert!(report.is_clean(), "violations: {:?}", report.violations);
}

async fn start_basic(engine: &Engine, level: DurabilityLevel) -> String {
    let run_id = engine.start_run(BASIC_JOB, Some(level)).await.unwrap();
    assert_eq!(
        engine.pending_work(&run_id),
        vec![WorkItem::Signal {
            name: "halt".to_string()
        }]
    );
    run_id
}

#[tokio::test]
async fn test_completes_and_loads_at_every_level() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;

    let mut runs = Vec::new();
    for level in DurabilityLevel::ALL {
        let run_id = start_basic(&engine, level).await;
        engine.signal(&run_id, "halt").await.unwrap();
        assert_eq!(
            engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
            RunResult::Success
        );
        assert_eq!(node_count(&engine, &run_id).await, BASIC_JOB_NODES);
        assert_clean(&engine, &run_id).await;
        runs.push(run_id);
    }

    // Completed runs load as completed and stay put
    let engine = clean_restart(engine, dir.path()).await;
    for run_id in &runs {
        assert_eq!(engine.phase(run_id), Some(Phase::Completed));
        assert_eq!(engine.resume(run_id).await.unwrap(), ResumeOutcome::AlreadyTerminal);
        assert_eq!(node_count(&engine, run_id).await, BASIC_JOB_NODES);
        assert_clean(&engine, run_id).await;
    }
}

#[tokio::test]
async fn test_clean_restart_level_survives_orderly_restart() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let run_id = start_basic(&engine, DurabilityLevel::SurviveCleanRestart).await;

    let engine = clean_restart(engine, dir.path()).await;
    assert_eq!(settled(&engine, &run_id).await, Phase::Running);
    assert_eq!(
        engine.pending_work(&run_id),
        vec![WorkItem::Signal {
            name: "halt".to_string()
        }]
    );

    engine.signal(&run_id, "halt").await.unwrap();
    assert_eq!(
        engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
        RunResult::Success
    );
    assert_eq!(node_count(&engine, &run_id).await, BASIC_JOB_NODES);
    assert_clean(&engine, &run_id).await;
}

#[tokio::test]
async fn test_clean_restart_level_fails_after_abrupt_stop() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let run_id = start_basic(&engine, DurabilityLevel::SurviveCleanRestart).await;

    let snapshot = simulate_abrupt_failure(engine, dir.path());
    let engine = common::engine(snapshot.path()).await;

    assert_eq!(settled(&engine, &run_id).await, Phase::FailedCleanly);
    assert_eq!(
        engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
        RunResult::Failure
    );
    assert!(engine.pending_work(&run_id).is_empty());
    assert_clean(&engine, &run_id).await;
}

#[tokio::test]
async fn test_no_promises_fails_after_any_restart() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let orderly = start_basic(&engine, DurabilityLevel::NoPromises).await;
    let engine = clean_restart(engine, dir.path()).await;
    assert_eq!(settled(&engine, &orderly).await, Phase::FailedCleanly);

    let abrupt = start_basic(&engine, DurabilityLevel::NoPromises).await;
    let snapshot = simulate_abrupt_failure(engine, dir.path());
    let engine = common::engine(snapshot.path()).await;
    assert_eq!(settled(&engine, &abrupt).await, Phase::FailedCleanly);

    for run_id in [&orderly, &abrupt] {
        assert_eq!(
            engine.wait_for_completion(run_id, TIMEOUT).await.unwrap(),
            RunResult::Failure
        );
        assert_clean(&engine, run_id).await;
    }
}

#[tokio::test]
async fn test_fully_durable_survives_both_restarts() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let orderly = start_basic(&engine, DurabilityLevel::FullyDurable).await;
    let abrupt = start_basic(&engine, DurabilityLevel::FullyDurable).await;

    // Orderly restart first, then an abrupt one after both have resumed
    let engine = clean_restart(engine, dir.path()).await;
    assert_eq!(settled(&engine, &orderly).await, Phase::Running);
    assert_eq!(settled(&engine, &abrupt).await, Phase::Running);
    let snapshot = simulate_abrupt_failure(engine, dir.path());

    let engine = common::engine(snapshot.path()).await;
    for run_id in [&orderly, &abrupt] {
        assert_eq!(settled(&engine, run_id).await, Phase::Running);
        engine.signal(run_id, "halt").await.unwrap();
        assert_eq!(
            engine.wait_for_completion(run_id, TIMEOUT).await.unwrap(),
            RunResult::Success
        );
        assert_eq!(node_count(&engine, run_id).await, BASIC_JOB_NODES);
        assert_clean(&engine, run_id).await;
    }
}

#[tokio::test]
async fn test_sleeping_step_resumes_with_its_metadata() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let run_id = engine
        .start_run(SLEEPER_JOB, Some(DurabilityLevel::FullyDurable))
        .await
        .unwrap();
    assert!(matches!(
        engine.pending_work(&run_id).as_slice(),
        [WorkItem::Timer { .. }]
    ));

    let snapshot = simulate_abrupt_failure(engine, dir.path());
    let engine = common::engine(snapshot.path()).await;
    assert_eq!(
        engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
        RunResult::Success
    );
    assert_clean(&engine, &run_id).await;

    let execution = engine.execution(&run_id).unwrap();
    let execution = execution.lock().await;
    let sleep = execution
        .all_nodes()
        .find(|n| n.function_name() == Some("sleep"))
        .expect("sleep node");

    let (_, elapsed) = sleep.timing().expect("timing");
    assert!(elapsed.is_some());
    assert_eq!(
        sleep.arguments().and_then(|a| a.get("unit")).and_then(|u| u.as_str()),
        Some("milliseconds")
    );
    let log = sleep.log_path().expect("log action");
    let text = std::fs::read_to_string(execution.run_dir().join(log)).unwrap();
    assert!(text.contains("Sleeping for 300 milliseconds"));
    assert_eq!(
        sleep
            .actions()
            .iter()
            .filter(|a| matches!(a, NodeAction::Timing { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_resume_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let run_id = start_basic(&engine, DurabilityLevel::FullyDurable).await;
    let engine = clean_restart(engine, dir.path()).await;

    let first = engine.resume(&run_id).await.unwrap();
    let second = engine.resume(&run_id).await.unwrap();
    assert!(matches!(
        (&first, &second),
        (ResumeOutcome::Resumed(_), ResumeOutcome::AlreadyActive)
            | (ResumeOutcome::AlreadyActive, ResumeOutcome::AlreadyActive)
    ));
    assert_eq!(settled(&engine, &run_id).await, Phase::Running);
    assert_eq!(engine.pending_work(&run_id).len(), 1);

    engine.signal(&run_id, "halt").await.unwrap();
    assert_eq!(
        engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
        RunResult::Success
    );
    assert_eq!(node_count(&engine, &run_id).await, BASIC_JOB_NODES);
}

/// Waits on a signal and never finishes resuming
#[derive(Debug)]
struct StuckStep;

#[async_trait::async_trait]
impl Step for StuckStep {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn start(&self, _ctx: &mut StepContext) -> flow_engine::Result<StepOutcome> {
        Ok(StepOutcome::Waiting(Wait::Signal {
            name: "never".to_string(),
        }))
    }

    async fn on_resume(&self, _wait: &Wait) -> flow_engine::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_resume_timeout_fails_run_cleanly() {
    let dir = TempDir::new().unwrap();
    let steps = || {
        let mut steps = StepRegistry::with_builtins();
        steps.register(Arc::new(StuckStep));
        steps
    };
    let mut config = common::config(dir.path());
    config.execution.resume_timeout_ms = 100;

    let engine = Engine::open(config.clone(), steps()).await.unwrap();
    let run_id = engine
        .start_run(
            "name: stuck\nsteps:\n  - step: stuck\n",
            Some(DurabilityLevel::FullyDurable),
        )
        .await
        .unwrap();
    let snapshot = simulate_abrupt_failure(engine, dir.path());
    config.storage.root = snapshot.path().to_path_buf();

    let engine = Engine::open(config, steps()).await.unwrap();
    assert_eq!(settled(&engine, &run_id).await, Phase::FailedCleanly);
    assert_eq!(
        engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
        RunResult::Failure
    );
    assert_clean(&engine, &run_id).await;
}

#[tokio::test]
async fn test_storage_failure_fails_run_cleanly() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let run_id = start_basic(&engine, DurabilityLevel::FullyDurable).await;

    let nodes = dir
        .path()
        .join("runs")
        .join(&run_id)
        .join(flow_storage::NODES_DIR);
    std::fs::remove_dir_all(&nodes).unwrap();
    std::fs::write(&nodes, b"not a directory").unwrap();

    engine.signal(&run_id, "halt").await.unwrap();
    assert_eq!(
        engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
        RunResult::Failure
    );
    assert_clean(&engine, &run_id).await;
}

#[tokio::test]
async fn test_abort_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let waiting = start_basic(&engine, DurabilityLevel::SurviveCleanRestart).await;
    let sleeping = engine
        .start_run(
            "name: long\nsteps:\n  - step: sleep\n    args: { time: 1, unit: hours }\n",
            None,
        )
        .await
        .unwrap();

    for run_id in [&waiting, &sleeping] {
        assert!(engine.abort(run_id).await.unwrap());
        assert!(!engine.abort(run_id).await.unwrap());
        assert_eq!(
            engine.wait_for_completion(run_id, TIMEOUT).await.unwrap(),
            RunResult::Aborted
        );
        assert_clean(&engine, run_id).await;
    }
    assert!(engine.queue_is_empty());
    assert!(matches!(
        engine.signal(&waiting, "halt").await,
        Err(FlowError::NoSuchWait { .. })
    ));
}

#[tokio::test]
async fn test_failing_step_fails_run_cleanly() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let run_id = engine
        .start_run(
            "name: broken\nsteps:\n  - block: stage\n    args: { name: build }\n    body:\n      - step: error\n        args: { message: boom }\n",
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
        RunResult::Failure
    );
    assert_clean(&engine, &run_id).await;

    let execution = engine.execution(&run_id).unwrap();
    let execution = execution.lock().await;
    let stage = execution
        .graph()
        .index()
        .filter(|n| n.is_step_start() && n.function_name() == Some("stage"))
        .next()
        .expect("stage start");
    assert_eq!(stage.label(), Some("build"));
}

#[tokio::test]
async fn test_oversized_sleep_fails_run_cleanly() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;

    for (time, unit) in [("10000000000000", "seconds"), ("18446744073709551615", "hours")] {
        let source = format!(
            "name: long-nap\nsteps:\n  - step: sleep\n    args: {{ time: {}, unit: {} }}\n",
            time, unit
        );
        let run_id = engine
            .start_run(&source, Some(DurabilityLevel::FullyDurable))
            .await
            .unwrap();

        assert_eq!(
            engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
            RunResult::Failure
        );
        assert_eq!(engine.phase(&run_id), Some(Phase::FailedCleanly));
        assert!(engine.pending_work(&run_id).is_empty());
        assert_clean(&engine, &run_id).await;
    }

    // Nothing left to resume after a restart
    let engine = clean_restart(engine, dir.path()).await;
    for run_id in engine.run_ids() {
        assert_eq!(engine.resume(&run_id).await.unwrap(), ResumeOutcome::AlreadyTerminal);
    }
}

#[tokio::test]
async fn test_only_fully_durable_is_persisted_fully() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;

    for level in DurabilityLevel::ALL {
        let run_id = start_basic(&engine, level).await;
        let execution = engine.execution(&run_id).unwrap();
        let execution = execution.lock().await;
        assert_eq!(
            execution.graph().is_persisted_fully(),
            level == DurabilityLevel::FullyDurable,
            "{}",
            level
        );
    }
}

#[tokio::test]
async fn test_busy_workers_return_to_zero() {
    let dir = TempDir::new().unwrap();
    let engine = engine(dir.path()).await;
    let runs = futures::future::join_all(
        (0..6).map(|_| engine.start_run(SLEEPER_JOB, Some(DurabilityLevel::NoPromises))),
    )
    .await;

    for run_id in runs {
        let run_id = run_id.unwrap();
        assert_eq!(
            engine.wait_for_completion(&run_id, TIMEOUT).await.unwrap(),
            RunResult::Success
        );
        assert_clean(&engine, &run_id).await;
    }
    assert_eq!(engine.busy_workers(), 0);
    assert!(engine.queue_is_empty());
}
