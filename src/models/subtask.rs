//! # Subtask Model
//!
//! One independently executable piece of a task's step. Subtasks sharing
//! `(task_id, step)` form a batch; the step completes once every subtask of the
//! batch reaches a terminal state.

use super::task::{Step, TaskId};
use crate::state_machine::SubtaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type SubtaskId = i64;

/// Persisted subtask row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub task_id: TaskId,
    pub step: Step,
    pub task_type: String,
    pub state: SubtaskState,
    /// Instance assigned to execute the subtask; empty means any node
    pub scheduler_id: String,
    pub meta: Vec<u8>,
    pub error: Option<String>,
    /// Times the dispatcher re-queued the subtask after a retryable failure
    pub retry_count: u32,
    pub is_first_batch: bool,
    pub create_time: DateTime<Utc>,
    pub state_update_time: DateTime<Utc>,
}

/// Subtask to be inserted as part of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubtask {
    pub task_id: TaskId,
    pub step: Step,
    pub task_type: String,
    pub scheduler_id: String,
    pub meta: Vec<u8>,
    pub is_first_batch: bool,
}

impl NewSubtask {
    pub fn new(
        task_id: TaskId,
        step: Step,
        task_type: impl Into<String>,
        scheduler_id: impl Into<String>,
        meta: Vec<u8>,
    ) -> Self {
        Self {
            task_id,
            step,
            task_type: task_type.into(),
            scheduler_id: scheduler_id.into(),
            meta,
            is_first_batch: false,
        }
    }

    pub fn first_batch(mut self, is_first_batch: bool) -> Self {
        self.is_first_batch = is_first_batch;
        self
    }
}

/// A failed or canceled subtask observed by the dispatcher
///
/// Wrapped into `anyhow::Error` before being handed to
/// [`Extension`](crate::dispatcher::Extension) hooks so task types can downcast it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskFailure {
    pub subtask_id: SubtaskId,
    pub state: SubtaskState,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl fmt::Display for SubtaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "subtask {} {}: {}", self.subtask_id, self.state, error),
            None => write!(f, "subtask {} {}", self.subtask_id, self.state),
        }
    }
}

impl std::error::Error for SubtaskFailure {}
