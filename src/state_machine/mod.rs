// State machine module for task orchestration
//
// Task and subtask state definitions plus the authoritative transition rules
// the dispatcher and the storage layer both enforce.

pub mod states;
pub mod transitions;

pub use states::{SubtaskState, TaskState};
pub use transitions::{allowed_targets, verify_task_state_transition};
