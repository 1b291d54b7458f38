//! Coordination layer: the event bus, the global execution semaphore, and
//! the orchestrator that ties positions, tasks, and routes together.

pub mod events;
pub mod orchestrator;
pub mod semaphore;

pub use events::{Event, EventBus, EventFilter, EventLog, HandlerId};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorStatus, PositionSnapshot};
pub use semaphore::{Permit, Semaphore};
