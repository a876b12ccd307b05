use disttask_core::TaskState;
use proptest::prelude::*;

pub const ALL_TASK_STATES: [TaskState; 11] = [
    TaskState::Pending,
    TaskState::Running,
    TaskState::Pausing,
    TaskState::Paused,
    TaskState::Resuming,
    TaskState::Cancelling,
    TaskState::Canceled,
    TaskState::Reverting,
    TaskState::Reverted,
    TaskState::Succeed,
    TaskState::Failed,
];

pub fn task_state_strategy() -> impl Strategy<Value = TaskState> {
    proptest::sample::select(ALL_TASK_STATES.to_vec())
}

/// Sequences of requested target states, applied in order from `Pending`
pub fn transition_path_strategy() -> impl Strategy<Value = Vec<TaskState>> {
    proptest::collection::vec(task_state_strategy(), 1..16)
}
