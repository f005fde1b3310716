//! Task lifecycle: the core entity and its in-memory registry.

pub mod manager;
#[allow(clippy::module_inception)]
pub mod task;

pub use manager::{StatusChange, TaskManager};
pub use task::{
    new_task_id, AgentKind, Task, TaskError, TaskStatus, ACCUMULATED_TEXT_CAP,
    COMPLETED_TASK_MAX_AGE, INPUT_REQUIRED_IDLE_THRESHOLD, PURGE_SWEEP_INTERVAL,
};
