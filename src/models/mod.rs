pub mod instance;
pub mod subtask;
pub mod task;

// Re-export core models for easy access
pub use instance::InstanceInfo;
pub use subtask::{NewSubtask, Subtask, SubtaskFailure, SubtaskId};
pub use task::{Step, Task, TaskId, STEP_DONE, STEP_INIT, STEP_ONE, STEP_REVERT, STEP_TWO};
