//! # Task Model
//!
//! A global task is one submitted unit of work that the dispatcher drives through
//! an ordered sequence of steps until it reaches a terminal state.
//!
//! ## Ownership
//!
//! - Rows are created by an external submitter through
//!   [`TaskStorage::add_new_global_task`](crate::storage::TaskStorage::add_new_global_task).
//! - While a task is non-terminal only the dispatcher owning it writes the row;
//!   external requests may only move it toward `Cancelling`, `Pausing` or `Resuming`.
//! - `meta` is opaque to the core; encoding it is the task type's business.

use crate::state_machine::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;

/// Step identifier within a task
pub type Step = i64;

/// First step of every task
pub const STEP_INIT: Step = -1;
pub const STEP_ONE: Step = 1;
pub const STEP_TWO: Step = 2;
/// Sentinel returned by `get_next_step` once no step remains
pub const STEP_DONE: Step = -2;
/// Step that revert subtasks are emitted at
pub const STEP_REVERT: Step = -3;

/// Persisted global task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Unique submission key
    pub key: String,
    /// Key into the dispatcher factory registry
    pub task_type: String,
    pub state: TaskState,
    pub step: Step,
    /// Desired maximum number of subtasks running in parallel
    pub concurrency: u64,
    pub meta: Vec<u8>,
    /// Terminal failure detail, only set for failure or revert outcomes
    pub error: Option<String>,
    /// Identity of the node that last dispatched the task
    pub dispatcher_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub state_update_time: DateTime<Utc>,
}

impl Task {
    /// Build an in-memory task as a freshly submitted row would look
    pub fn new(
        id: TaskId,
        key: impl Into<String>,
        task_type: impl Into<String>,
        concurrency: u64,
        meta: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            key: key.into(),
            task_type: task_type.into(),
            state: TaskState::Pending,
            step: STEP_INIT,
            concurrency,
            meta,
            error: None,
            dispatcher_id: None,
            start_time: now,
            state_update_time: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
