//! # System Constants
//!
//! Defaults and state groupings that define the operational boundaries of the
//! dispatch orchestration core.

/// Default cap on concurrently orchestrated tasks per manager
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 4;

/// Timing defaults, in milliseconds
pub mod intervals {
    /// Dispatch loop tick: how often storage is polled for startable tasks
    pub const DISPATCH_INTERVAL_MS: u64 = 3_000;
    /// Detection loop tick: how often finished dispatchers are reaped
    pub const DETECT_INTERVAL_MS: u64 = 500;
    /// Per-task drive loop tick
    pub const CHECK_TASK_INTERVAL_MS: u64 = 500;
    /// Pause between retried storage writes
    pub const STORAGE_RETRY_BACKOFF_MS: u64 = 100;
}

/// Storage writes are attempted this many times before a tick gives up
pub const DEFAULT_STORAGE_RETRY_TIMES: u32 = 3;

/// Retryable subtask failures are re-queued at most this many times
pub const DEFAULT_MAX_SUBTASK_RETRIES: u32 = 3;

/// Error recorded on tasks reverted because of an external cancel
pub const CANCELED_ERROR: &str = "canceled";

pub mod status_groups {
    use crate::state_machine::{SubtaskState, TaskState};

    /// Task states the dispatch loop picks up; a restarted manager resumes these
    pub const DISPATCHABLE_TASK_STATES: &[TaskState] = &[
        TaskState::Pending,
        TaskState::Running,
        TaskState::Reverting,
        TaskState::Cancelling,
        TaskState::Pausing,
        TaskState::Resuming,
    ];

    /// Task states that end orchestration
    pub const TASK_FINAL_STATES: &[TaskState] = &[
        TaskState::Succeed,
        TaskState::Failed,
        TaskState::Reverted,
        TaskState::Canceled,
    ];

    /// Task states an external cancel request may interrupt
    pub const CANCELLABLE_TASK_STATES: &[TaskState] = &[
        TaskState::Pending,
        TaskState::Running,
        TaskState::Pausing,
        TaskState::Paused,
        TaskState::Resuming,
    ];

    /// Task states an external pause request may interrupt
    pub const PAUSABLE_TASK_STATES: &[TaskState] = &[TaskState::Pending, TaskState::Running];

    /// Subtask states that keep a step open
    pub const SUBTASK_STILL_WORKING_STATES: &[SubtaskState] =
        &[SubtaskState::Pending, SubtaskState::Running];

    /// Subtask states that abort the current step
    pub const SUBTASK_FAILURE_STATES: &[SubtaskState] =
        &[SubtaskState::Failed, SubtaskState::Canceled];

    pub const ALL_SUBTASK_STATES: &[SubtaskState] = &[
        SubtaskState::Pending,
        SubtaskState::Running,
        SubtaskState::Succeed,
        SubtaskState::Failed,
        SubtaskState::Canceled,
        SubtaskState::Reverted,
    ];
}
