//! The unit-of-work executor seam.
//!
//! The orchestrator never runs work itself: it hands (position, program,
//! task, cancellation token) to a [`TaskExecutor`] and interprets the
//! outcome. Any backend fits behind this trait, an LLM call included.
//! Cancellation is cooperative: the executor is expected to observe the
//! token and return promptly once it fires.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::position::{Position, Program};
use crate::task::Task;

/// Result envelope returned by a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Opaque result payload, fed to output routes.
    pub output: Value,
    /// Execution cost in USD, accumulated by the orchestrator.
    pub cost: f64,
}

impl ExecutionOutcome {
    /// An outcome with the given output and zero cost.
    pub fn new(output: Value) -> Self {
        Self { output, cost: 0.0 }
    }

    /// Set the cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Executes one unit of work for one position.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` for `position` under `program`. An `Err` is recorded as
    /// task failure; it never propagates out of the scheduler.
    async fn execute(
        &self,
        position: &Position,
        program: &Program,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome>;
}

type ExecuteFn =
    dyn Fn(Position, Program, Task, CancellationToken) -> BoxFuture<'static, Result<ExecutionOutcome>> + Send + Sync;

/// Adapter turning an async closure into a [`TaskExecutor`].
///
/// Mostly useful in tests and examples where spinning up a real backend
/// would be noise.
pub struct FnExecutor {
    f: Box<ExecuteFn>,
}

impl FnExecutor {
    /// Wrap an async closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Position, Program, Task, CancellationToken) -> BoxFuture<'static, Result<ExecutionOutcome>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl TaskExecutor for FnExecutor {
    async fn execute(
        &self,
        position: &Position,
        program: &Program,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        (self.f)(position.clone(), program.clone(), task.clone(), cancel).await
    }
}
