//! Task types for habitat-core.
//!
//! A task is a prioritized unit of work addressed to a position. It is
//! created pending, becomes running when a trigger dequeues it, and
//! terminates as done (with a result) or failed (with an error message).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::position::PositionId;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new task ID using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(format!("task-{}", Uuid::now_v7()))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Task priority.
///
/// The derived order puts `Critical` first: dequeue picks the minimum, so
/// a critical task always beats a high one, and so on down to low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Numeric rank, 0 dequeues first.
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(TaskPriority::Critical),
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            other => Err(crate::Error::Validation(format!("unknown priority: {other}"))),
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in a position's queue.
    Pending,
    /// Actively executing.
    Running,
    /// Completed successfully.
    Done,
    /// Failed with an error.
    Failed,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// A unit of work addressed to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Position that produced this task, if any.
    pub source: Option<PositionId>,
    /// Position this task is addressed to.
    pub target: PositionId,
    /// Free-form task type, dot-namespaced by convention.
    pub task_type: String,
    /// Opaque payload.
    pub payload: Value,
    /// Dispatch priority.
    pub priority: TaskPriority,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result payload, set when the task is done.
    pub result: Option<Value>,
    /// Error message, set when the task failed.
    pub error: Option<String>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(
        target: PositionId,
        task_type: impl Into<String>,
        payload: Value,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id: TaskId::new(),
            source: None,
            target,
            task_type: task_type.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Set the source position.
    pub fn with_source(mut self, source: PositionId) -> Self {
        self.source = Some(source);
        self
    }
}
