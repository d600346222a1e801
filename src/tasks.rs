//! Ordered, named payload transformation pipeline.
//!
//! A session runs two pipelines per attempt: `data_tasks` over the
//! outgoing payload before it is sent, and `response_tasks` over the
//! decoded response after a successful transport call. Steps run in
//! insertion order and the pipeline stops at the first failing step.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ErrorCode, RequestError};

/// One named step with its configuration.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub config: Value,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Value::Null,
        }
    }

    pub fn with_config(name: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// What a step did with the payload.
pub enum StepOutcome {
    /// Replace the payload for subsequent steps.
    Replace(Value),
    /// Leave the payload as it was.
    Unchanged,
    /// Stop the pipeline; the error becomes the session's error.
    Fail(RequestError),
}

/// A single transformation step, resolved by name from the registry.
pub trait TaskStep: Send + Sync {
    fn run(&self, payload: &Value, config: &Value) -> StepOutcome;
}

impl<F> TaskStep for F
where
    F: Fn(&Value, &Value) -> StepOutcome + Send + Sync,
{
    fn run(&self, payload: &Value, config: &Value) -> StepOutcome {
        self(payload, config)
    }
}

/// Name → step resolution table shared by sessions.
#[derive(Default)]
pub struct TaskRegistry {
    steps: HashMap<String, Arc<dyn TaskStep>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, step: Arc<dyn TaskStep>) {
        self.steps.insert(name.into(), step);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, step: F)
    where
        F: Fn(&Value, &Value) -> StepOutcome + Send + Sync + 'static,
    {
        self.register(name, Arc::new(step));
    }

    /// Applies the steps in order, short-circuiting on the first failure.
    ///
    /// A step name with no registered implementation fails the pipeline
    /// rather than being skipped; a mistyped task name silently passing
    /// the payload through would be much harder to notice.
    pub fn apply(&self, payload: Value, steps: &[TaskSpec]) -> Result<Value, RequestError> {
        let mut current = payload;

        for spec in steps {
            let step = self.steps.get(&spec.name).ok_or_else(|| {
                RequestError::new(
                    ErrorCode::Named("unknown_task".to_owned()),
                    format!("no pipeline task registered under '{}'", spec.name),
                )
            })?;

            match step.run(&current, &spec.config) {
                StepOutcome::Replace(next) => current = next,
                StepOutcome::Unchanged => {}
                StepOutcome::Fail(error) => return Err(error),
            }
        }

        Ok(current)
    }
}
