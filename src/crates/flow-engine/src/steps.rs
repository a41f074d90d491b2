//! Step implementations and the registry that resolves them
//!
//! A [`Step`] runs when the interpreter reaches a statement naming it. It
//! either completes right away with a value or asks the run to suspend until
//! a [`Wait`] is resolved (a signal arrives or a deadline passes). The
//! suspension is where the continuation gets persisted.
//!
//! # Built-in steps
//!
//! | Name | Arguments | Behavior |
//! |------|-----------|----------|
//! | `echo` | `message` | logs the message and returns it |
//! | `sleep` | `time`, `unit` | waits until `time` units from now |
//! | `semaphore` | `name` | waits for the signal `name` |
//! | `error` | `message` | fails the run |
//!
//! `node` and `stage` are registered as block steps: they only wrap a body.

use crate::error::{FlowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_storage::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a suspended step is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Wait {
    /// An external signal with this name
    Signal { name: String },
    /// A point in time
    Until { deadline: DateTime<Utc> },
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal { name } => write!(f, "signal '{}'", name),
            Self::Until { deadline } => write!(f, "until {}", deadline.to_rfc3339()),
        }
    }
}

/// Result of starting a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    Waiting(Wait),
}

/// Everything a step sees while it starts
#[derive(Debug)]
pub struct StepContext {
    run_id: String,
    node: NodeId,
    args: Value,
    log: Vec<String>,
}

impl StepContext {
    pub fn new(run_id: impl Into<String>, node: NodeId, args: Value) -> Self {
        Self {
            run_id: run_id.into(),
            node,
            args,
            log: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// String argument by name; a bare string is accepted for `name`-like
    /// single-argument steps
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        match &self.args {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get(key).and_then(Value::as_str),
            _ => None,
        }
    }

    /// Append a line to the step's log
    pub fn log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    /// Lines logged so far, draining the buffer
    pub fn take_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }
}

/// A unit of work a definition can invoke
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in definitions
    fn name(&self) -> &str;

    /// Run the step
    async fn start(&self, ctx: &mut StepContext) -> Result<StepOutcome>;

    /// Called while a run suspended in this step is being resumed
    async fn on_resume(&self, _wait: &Wait) -> Result<()> {
        Ok(())
    }
}

/// Logs and returns its message
#[derive(Debug, Default)]
pub struct EchoStep;

#[async_trait]
impl Step for EchoStep {
    fn name(&self) -> &str {
        "echo"
    }

    async fn start(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let message = ctx.arg_str("message").unwrap_or_default().to_string();
        ctx.log(message.clone());
        Ok(StepOutcome::Completed(Value::String(message)))
    }
}

/// Waits for a duration
#[derive(Debug, Default)]
pub struct SleepStep;

impl SleepStep {
    fn duration(args: &Value) -> Result<(u64, String, Duration)> {
        let time = args
            .get("time")
            .and_then(Value::as_u64)
            .ok_or_else(|| FlowError::step_failed("sleep", "missing numeric 'time' argument"))?;
        let unit = args
            .get("unit")
            .and_then(Value::as_str)
            .unwrap_or("seconds")
            .to_string();

        let seconds = |factor: u64| {
            time.checked_mul(factor).map(Duration::from_secs).ok_or_else(|| {
                FlowError::step_failed("sleep", format!("{} {} is too long", time, unit))
            })
        };
        let duration = match unit.as_str() {
            "milliseconds" => Duration::from_millis(time),
            "seconds" => Duration::from_secs(time),
            "minutes" => seconds(60)?,
            "hours" => seconds(3600)?,
            other => {
                return Err(FlowError::step_failed(
                    "sleep",
                    format!("unknown time unit '{}'", other),
                ))
            }
        };
        Ok((time, unit, duration))
    }
}

#[async_trait]
impl Step for SleepStep {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn start(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let (time, unit, duration) = Self::duration(ctx.args())?;
        let delta = chrono::Duration::from_std(duration)
            .map_err(|e| FlowError::step_failed("sleep", e.to_string()))?;

        let deadline = Utc::now().checked_add_signed(delta).ok_or_else(|| {
            FlowError::step_failed(
                "sleep",
                format!("{} {} is past the latest deadline", time, unit),
            )
        })?;

        ctx.log(format!("Sleeping for {} {}", time, unit));
        Ok(StepOutcome::Waiting(Wait::Until { deadline }))
    }
}

/// Waits for a named external signal
#[derive(Debug, Default)]
pub struct SemaphoreStep;

#[async_trait]
impl Step for SemaphoreStep {
    fn name(&self) -> &str {
        "semaphore"
    }

    async fn start(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let name = ctx
            .arg_str("name")
            .ok_or_else(|| FlowError::step_failed("semaphore", "missing 'name' argument"))?
            .to_string();
        ctx.log(format!("Waiting for signal '{}'", name));
        Ok(StepOutcome::Waiting(Wait::Signal { name }))
    }
}

/// Fails the run
#[derive(Debug, Default)]
pub struct ErrorStep;

#[async_trait]
impl Step for ErrorStep {
    fn name(&self) -> &str {
        "error"
    }

    async fn start(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let message = ctx.arg_str("message").unwrap_or("error step").to_string();
        ctx.log(message.clone());
        Err(FlowError::step_failed("error", message))
    }
}

/// Steps and block names available to definitions
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
    blocks: HashSet<String>,
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<&String> = self.steps.keys().collect();
        steps.sort();
        f.debug_struct("StepRegistry")
            .field("steps", &steps)
            .field("blocks", &self.blocks)
            .finish()
    }
}

impl StepRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in steps and blocks
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoStep));
        registry.register(Arc::new(SleepStep));
        registry.register(Arc::new(SemaphoreStep));
        registry.register(Arc::new(ErrorStep));
        registry.register_block("node");
        registry.register_block("stage");
        registry
    }

    /// Register a step under its own name, replacing any previous one
    pub fn register(&mut self, step: Arc<dyn Step>) -> &mut Self {
        self.steps.insert(step.name().to_string(), step);
        self
    }

    /// Allow `name` to be used as a block
    pub fn register_block(&mut self, name: impl Into<String>) -> &mut Self {
        self.blocks.insert(name.into());
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::UnknownStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn is_block(&self, name: &str) -> bool {
        self.blocks.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_logs_and_returns_message() {
        let mut ctx = StepContext::new("run", NodeId(2), json!({"message": "hello"}));
        let outcome = EchoStep.start(&mut ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Completed(json!("hello")));
        assert_eq!(ctx.take_log(), vec!["hello".to_string()]);
        assert!(ctx.take_log().is_empty());
    }

    #[tokio::test]
    async fn test_sleep_waits_until_deadline() {
        let before = Utc::now();
        let mut ctx = StepContext::new("run", NodeId(4), json!({"time": 2, "unit": "minutes"}));
        match SleepStep.start(&mut ctx).await.unwrap() {
            StepOutcome::Waiting(Wait::Until { deadline }) => {
                assert!(deadline >= before + chrono::Duration::minutes(2));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ctx.take_log(), vec!["Sleeping for 2 minutes".to_string()]);
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_arguments() {
        let mut ctx = StepContext::new("run", NodeId(4), json!({"time": 2, "unit": "fortnights"}));
        assert!(SleepStep.start(&mut ctx).await.is_err());

        let mut ctx = StepContext::new("run", NodeId(4), json!({}));
        assert!(SleepStep.start(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_sleep_too_long_fails_instead_of_overflowing() {
        for args in [
            json!({"time": 10_000_000_000_000u64, "unit": "seconds"}),
            json!({"time": u64::MAX, "unit": "hours"}),
            json!({"time": u64::MAX / 60, "unit": "minutes"}),
        ] {
            let mut ctx = StepContext::new("run", NodeId(4), args);
            let err = SleepStep.start(&mut ctx).await.unwrap_err();
            assert!(matches!(err, FlowError::StepFailed { .. }), "{}", err);
            assert!(ctx.take_log().is_empty());
        }
    }

    #[tokio::test]
    async fn test_semaphore_accepts_bare_name() {
        let mut ctx = StepContext::new("run", NodeId(4), json!("halt"));
        assert_eq!(
            SemaphoreStep.start(&mut ctx).await.unwrap(),
            StepOutcome::Waiting(Wait::Signal {
                name: "halt".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_error_step_fails() {
        let mut ctx = StepContext::new("run", NodeId(2), json!({"message": "boom"}));
        let err = ErrorStep.start(&mut ctx).await.unwrap_err();
        assert!(matches!(err, FlowError::StepFailed { .. }));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StepRegistry::with_builtins();
        assert!(registry.contains("sleep"));
        assert!(registry.is_block("node"));
        assert!(!registry.is_block("echo"));
        assert!(matches!(registry.get("missing"), Err(FlowError::UnknownStep(_))));
        assert_eq!(registry.get("echo").unwrap().name(), "echo");
    }
}
