//! habitat-core: multi-position task orchestration.
//!
//! A position is a long-lived worker slot bound to a program (its role
//! definition). Tasks are dispatched to positions, executed one at a time
//! per position under a global concurrency bound, and their results flow
//! to other positions through declarative output routes. Every state
//! change is published on an event bus backed by a durable date-sharded
//! JSONL log.

pub mod config;
pub mod coordination;
pub mod error;
pub mod executor;
pub mod position;
pub mod store;
pub mod task;

pub use config::Config;
pub use coordination::{
    Event, EventBus, EventFilter, EventLog, HandlerId, Orchestrator, OrchestratorConfig,
    OrchestratorStatus, Permit, PositionSnapshot, Semaphore,
};
pub use error::{Error, Result};
pub use executor::{ExecutionOutcome, FnExecutor, TaskExecutor};
pub use position::{
    OutputRoute, Position, PositionId, PositionStatus, Program, ProgramId, RoutePredicate,
    RouteTransform,
};
pub use store::{MemoryStore, PositionStore};
pub use task::{Task, TaskId, TaskPriority, TaskStatus};
