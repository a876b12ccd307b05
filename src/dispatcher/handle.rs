//! Narrow per-task query facade handed to extensions.

use crate::error::StorageResult;
use crate::models::{Step, TaskId};
use crate::state_machine::SubtaskState;
use crate::storage::TaskStorage;
use async_trait::async_trait;
use std::sync::Arc;

/// Read-only view over one task's subtasks
#[async_trait]
pub trait TaskHandle: Send + Sync {
    fn task_id(&self) -> TaskId;

    /// Count of the task's subtasks at `step` in any of `states`
    async fn subtask_cnt_in_states(&self, step: Step, states: &[SubtaskState])
        -> StorageResult<u64>;

    /// Distinct node IDs already assigned to the task's subtasks
    async fn scheduler_ids(&self) -> StorageResult<Vec<String>>;

    /// Metas emitted at an earlier step, in insertion order
    async fn previous_subtask_metas(&self, step: Step) -> StorageResult<Vec<Vec<u8>>>;
}

/// [`TaskHandle`] backed directly by the task storage
#[derive(Clone)]
pub struct StorageTaskHandle {
    task_id: TaskId,
    storage: Arc<dyn TaskStorage>,
}

impl StorageTaskHandle {
    pub fn new(task_id: TaskId, storage: Arc<dyn TaskStorage>) -> Self {
        Self { task_id, storage }
    }
}

impl std::fmt::Debug for StorageTaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTaskHandle")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskHandle for StorageTaskHandle {
    fn task_id(&self) -> TaskId {
        self.task_id
    }

    async fn subtask_cnt_in_states(
        &self,
        step: Step,
        states: &[SubtaskState],
    ) -> StorageResult<u64> {
        self.storage
            .get_step_subtask_in_states_cnt(self.task_id, step, states)
            .await
    }

    async fn scheduler_ids(&self) -> StorageResult<Vec<String>> {
        self.storage.get_scheduler_ids_by_task_id(self.task_id).await
    }

    async fn previous_subtask_metas(&self, step: Step) -> StorageResult<Vec<Vec<u8>>> {
        self.storage.get_subtask_metas(self.task_id, step).await
    }
}
