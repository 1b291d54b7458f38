//! Position and task storage.
//!
//! The orchestrator never owns durable records itself: everything goes
//! through [`PositionStore`]. [`MemoryStore`] is the in-process reference
//! implementation; deployments can substitute any backend that honors the
//! same contract, most importantly the dequeue ordering (priority rank,
//! then creation time).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::position::{Position, PositionId, PositionStatus, Program, ProgramId};
use crate::task::{Task, TaskId, TaskStatus};

/// Storage contract consumed by the orchestrator.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persist a new position.
    async fn create_position(&self, position: Position) -> Result<Position>;

    /// Load a position by ID.
    async fn get_position(&self, id: &PositionId) -> Result<Option<Position>>;

    /// List all positions.
    async fn list_positions(&self) -> Result<Vec<Position>>;

    /// Delete a position. Returns whether it existed.
    async fn delete_position(&self, id: &PositionId) -> Result<bool>;

    /// Set a position's status.
    async fn set_position_status(&self, id: &PositionId, status: PositionStatus) -> Result<()>;

    /// Store a program definition.
    async fn put_program(&self, program: Program) -> Result<()>;

    /// Load a program definition.
    async fn get_program(&self, id: &ProgramId) -> Result<Option<Program>>;

    /// Append a pending task to its target position's queue.
    async fn enqueue_task(&self, task: Task) -> Result<Task>;

    /// Dequeue the best pending task for a position: lowest priority rank,
    /// ties broken by earliest creation. Marks the task running and points
    /// the position's current-task at it.
    async fn dequeue_task(&self, position: &PositionId) -> Result<Option<Task>>;

    /// Load a task by ID.
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Mark a task done with a result, clearing the owning position's
    /// current-task pointer if it references this task.
    async fn complete_task(&self, id: &TaskId, result: Value) -> Result<Task>;

    /// Mark a task failed with an error message, clearing the owning
    /// position's current-task pointer if it references this task.
    async fn fail_task(&self, id: &TaskId, error: &str) -> Result<Task>;

    /// Number of pending tasks queued for a position.
    async fn pending_count(&self, position: &PositionId) -> Result<usize>;
}

#[derive(Default)]
struct Inner {
    positions: HashMap<PositionId, Position>,
    programs: HashMap<ProgramId, Program>,
    tasks: HashMap<TaskId, Task>,
}

/// In-memory store backed by tokio-locked maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn clear_current_task(&mut self, task: &Task) {
        if let Some(position) = self.positions.get_mut(&task.target) {
            if position.current_task.as_ref() == Some(&task.id) {
                position.current_task = None;
                position.updated_at = Utc::now();
            }
        }
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn create_position(&self, position: Position) -> Result<Position> {
        let mut inner = self.inner.write().await;
        inner.positions.insert(position.id.clone(), position.clone());
        Ok(position)
    }

    async fn get_position(&self, id: &PositionId) -> Result<Option<Position>> {
        let inner = self.inner.read().await;
        Ok(inner.positions.get(id).cloned())
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        let inner = self.inner.read().await;
        let mut positions: Vec<Position> = inner.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(positions)
    }

    async fn delete_position(&self, id: &PositionId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.positions.remove(id).is_some())
    }

    async fn set_position_status(&self, id: &PositionId, status: PositionStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let position = inner
            .positions
            .get_mut(id)
            .ok_or_else(|| Error::PositionNotFound { id: id.to_string() })?;
        position.status = status;
        position.updated_at = Utc::now();
        Ok(())
    }

    async fn put_program(&self, program: Program) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.programs.insert(program.id.clone(), program);
        Ok(())
    }

    async fn get_program(&self, id: &ProgramId) -> Result<Option<Program>> {
        let inner = self.inner.read().await;
        Ok(inner.programs.get(id).cloned())
    }

    async fn enqueue_task(&self, task: Task) -> Result<Task> {
        let mut inner = self.inner.write().await;
        if !inner.positions.contains_key(&task.target) {
            return Err(Error::PositionNotFound {
                id: task.target.to_string(),
            });
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn dequeue_task(&self, position: &PositionId) -> Result<Option<Task>> {
        let mut inner = self.inner.write().await;

        let best = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && &t.target == position)
            .min_by(|a, b| {
                a.priority
                    .rank()
                    .cmp(&b.priority.rank())
                    .then(a.created_at.cmp(&b.created_at))
                    // uuid-v7 ids are time-ordered, so this keeps ties deterministic
                    .then(a.id.0.cmp(&b.id.0))
            })
            .map(|t| t.id.clone());

        let Some(task_id) = best else {
            return Ok(None);
        };

        let task = inner
            .tasks
            .get_mut(&task_id)
            .expect("dequeued id was just selected");
        task.status = TaskStatus::Running;
        let task = task.clone();

        if let Some(pos) = inner.positions.get_mut(position) {
            pos.current_task = Some(task_id);
            pos.updated_at = Utc::now();
        }

        Ok(Some(task))
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(id).cloned())
    }

    async fn complete_task(&self, id: &TaskId, result: Value) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        task.status = TaskStatus::Done;
        task.completed_at = Some(Utc::now());
        task.result = Some(result);
        let task = task.clone();
        inner.clear_current_task(&task);
        Ok(task)
    }

    async fn fail_task(&self, id: &TaskId, error: &str) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error = Some(error.to_string());
        let task = task.clone();
        inner.clear_current_task(&task);
        Ok(task)
    }

    async fn pending_count(&self, position: &PositionId) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && &t.target == position)
            .count())
    }
}
