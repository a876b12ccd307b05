//! # Task Storage Contract
//!
//! Durable, atomically updatable task and subtask tables: the sole source of truth
//! for orchestration. The core never caches task state between ticks; every
//! decision is made from a fresh read and every write is a compare-and-set on the
//! task's previous state.
//!
//! ## Implementations
//!
//! - [`MemoryTaskStorage`] - in-process tables behind a single mutex
//! - [`PgTaskStorage`] - PostgreSQL via SQLx (feature `postgres`)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::StorageResult;
use crate::models::{InstanceInfo, NewSubtask, Step, Subtask, SubtaskFailure, SubtaskId, Task, TaskId};
use crate::state_machine::{SubtaskState, TaskState};
use async_trait::async_trait;

pub use memory::MemoryTaskStorage;
#[cfg(feature = "postgres")]
pub use postgres::PgTaskStorage;

/// Persisted task and subtask operations used by the orchestration core
#[async_trait]
pub trait TaskStorage: Send + Sync {
    /// Submit a task; new tasks are `Pending` at `STEP_INIT`
    async fn add_new_global_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u64,
        meta: Vec<u8>,
    ) -> StorageResult<TaskId>;

    async fn get_global_task_by_id(&self, task_id: TaskId) -> StorageResult<Option<Task>>;

    /// Tasks in any of `states`, ordered by id
    async fn get_global_tasks_in_states(&self, states: &[TaskState]) -> StorageResult<Vec<Task>>;

    /// Request cancellation; returns false when the task is not in a cancellable state
    async fn cancel_global_task(&self, task_id: TaskId) -> StorageResult<bool>;

    /// Request a pause; returns false when the task is not pausable
    async fn pause_global_task(&self, task_id: TaskId) -> StorageResult<bool>;

    /// Resume a paused task; returns false when the task is not paused
    async fn resume_global_task(&self, task_id: TaskId) -> StorageResult<bool>;

    /// Compare-and-set the task row; false when the stored state is no longer `prev_state`
    async fn update_global_task(&self, task: &Task, prev_state: TaskState) -> StorageResult<bool>;

    /// Compare-and-set the task row and insert a whole subtask batch, all or nothing
    async fn update_task_and_add_subtasks(
        &self,
        task: &Task,
        prev_state: TaskState,
        subtasks: Vec<NewSubtask>,
    ) -> StorageResult<bool>;

    /// Remove a task and its subtasks
    async fn delete_global_task(&self, task_id: TaskId) -> StorageResult<()>;

    async fn add_new_subtask(
        &self,
        task_id: TaskId,
        step: Step,
        scheduler_id: &str,
        meta: Vec<u8>,
        task_type: &str,
        is_first_batch: bool,
    ) -> StorageResult<SubtaskId>;

    /// Called by the executing side, never by the dispatcher
    async fn update_subtask_state_and_error(
        &self,
        subtask_id: SubtaskId,
        state: SubtaskState,
        error: Option<String>,
    ) -> StorageResult<()>;

    /// Count the task's subtasks in `states` across every step
    async fn get_subtask_in_states_cnt(
        &self,
        task_id: TaskId,
        states: &[SubtaskState],
    ) -> StorageResult<u64>;

    /// Count the task's subtasks of `step` in `states`
    async fn get_step_subtask_in_states_cnt(
        &self,
        task_id: TaskId,
        step: Step,
        states: &[SubtaskState],
    ) -> StorageResult<u64>;

    /// Failed and canceled subtasks of `step`
    async fn collect_subtask_failures(
        &self,
        task_id: TaskId,
        step: Step,
    ) -> StorageResult<Vec<SubtaskFailure>>;

    /// Put a failed subtask back to pending; false when it is no longer failed
    async fn requeue_subtask(&self, subtask_id: SubtaskId) -> StorageResult<bool>;

    /// Distinct non-empty scheduler IDs assigned to the task's subtasks
    async fn get_scheduler_ids_by_task_id(&self, task_id: TaskId) -> StorageResult<Vec<String>>;

    async fn get_subtask_metas(&self, task_id: TaskId, step: Step) -> StorageResult<Vec<Vec<u8>>>;

    async fn get_subtasks(&self, task_id: TaskId, step: Step) -> StorageResult<Vec<Subtask>>;

    /// Register this process with the cluster membership view
    async fn start_manager(&self, address: &str, role: &str) -> StorageResult<()>;
}

/// Enumerates live cluster nodes
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn live_instances(&self) -> StorageResult<Vec<InstanceInfo>>;
}
