//! In-process task storage.
//!
//! All tables live behind one `parking_lot::Mutex`, so each trait method is a
//! single critical section: task compare-and-set and batch inserts are atomic
//! with respect to every other caller. The lock is never held across an await.

use super::{ClusterMembership, TaskStorage};
use crate::constants::status_groups::{CANCELLABLE_TASK_STATES, PAUSABLE_TASK_STATES};
use crate::error::{StorageError, StorageResult};
use crate::models::{
    InstanceInfo, NewSubtask, Step, Subtask, SubtaskFailure, SubtaskId, Task, TaskId,
};
use crate::state_machine::{verify_task_state_transition, SubtaskState, TaskState};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    tasks: BTreeMap<TaskId, Task>,
    subtasks: BTreeMap<SubtaskId, Subtask>,
    /// address -> role
    nodes: BTreeMap<String, String>,
    next_task_id: TaskId,
    next_subtask_id: SubtaskId,
}

impl Tables {
    fn insert_subtask(&mut self, new: NewSubtask) -> SubtaskId {
        self.next_subtask_id += 1;
        let id = self.next_subtask_id;
        let now = Utc::now();
        self.subtasks.insert(
            id,
            Subtask {
                id,
                task_id: new.task_id,
                step: new.step,
                task_type: new.task_type,
                state: SubtaskState::Pending,
                scheduler_id: new.scheduler_id,
                meta: new.meta,
                error: None,
                retry_count: 0,
                is_first_batch: new.is_first_batch,
                create_time: now,
                state_update_time: now,
            },
        );
        id
    }

    fn step_subtasks(&self, task_id: TaskId, step: Step) -> impl Iterator<Item = &Subtask> {
        self.subtasks
            .values()
            .filter(move |s| s.task_id == task_id && s.step == step)
    }

    /// Shared compare-and-set used by every task write
    fn cas_task(&mut self, task: &Task, prev_state: TaskState) -> StorageResult<bool> {
        let stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or(StorageError::TaskNotFound(task.id))?;
        if stored.state != prev_state {
            return Ok(false);
        }
        if !verify_task_state_transition(prev_state, task.state) {
            return Err(StorageError::InvalidTransition {
                from: prev_state,
                to: task.state,
            });
        }

        let mut updated = task.clone();
        updated.state_update_time = Utc::now();
        *stored = updated;
        Ok(true)
    }

    fn request_state(
        &mut self,
        task_id: TaskId,
        from: &[TaskState],
        to: TaskState,
    ) -> StorageResult<bool> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StorageError::TaskNotFound(task_id))?;
        if !from.contains(&task.state) {
            return Ok(false);
        }
        task.state = to;
        task.state_update_time = Utc::now();
        Ok(true)
    }
}

/// Task storage kept entirely in memory; suitable for tests and single-process use
#[derive(Debug, Default)]
pub struct MemoryTaskStorage {
    tables: Mutex<Tables>,
}

impl MemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subtasks across all tasks
    pub fn subtask_count(&self) -> usize {
        self.tables.lock().subtasks.len()
    }
}

#[async_trait]
impl TaskStorage for MemoryTaskStorage {
    async fn add_new_global_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u64,
        meta: Vec<u8>,
    ) -> StorageResult<TaskId> {
        let mut tables = self.tables.lock();
        if tables.tasks.values().any(|t| t.key == key) {
            return Err(StorageError::DuplicateKey(key.to_string()));
        }
        tables.next_task_id += 1;
        let id = tables.next_task_id;
        tables
            .tasks
            .insert(id, Task::new(id, key, task_type, concurrency, meta));

        debug!(task_id = id, key = key, task_type = task_type, "Added global task");
        Ok(id)
    }

    async fn get_global_task_by_id(&self, task_id: TaskId) -> StorageResult<Option<Task>> {
        Ok(self.tables.lock().tasks.get(&task_id).cloned())
    }

    async fn get_global_tasks_in_states(&self, states: &[TaskState]) -> StorageResult<Vec<Task>> {
        let tables = self.tables.lock();
        Ok(tables
            .tasks
            .values()
            .filter(|t| states.contains(&t.state))
            .cloned()
            .collect())
    }

    async fn cancel_global_task(&self, task_id: TaskId) -> StorageResult<bool> {
        self.tables
            .lock()
            .request_state(task_id, CANCELLABLE_TASK_STATES, TaskState::Cancelling)
    }

    async fn pause_global_task(&self, task_id: TaskId) -> StorageResult<bool> {
        self.tables
            .lock()
            .request_state(task_id, PAUSABLE_TASK_STATES, TaskState::Pausing)
    }

    async fn resume_global_task(&self, task_id: TaskId) -> StorageResult<bool> {
        self.tables
            .lock()
            .request_state(task_id, &[TaskState::Paused], TaskState::Resuming)
    }

    async fn update_global_task(&self, task: &Task, prev_state: TaskState) -> StorageResult<bool> {
        self.tables.lock().cas_task(task, prev_state)
    }

    async fn update_task_and_add_subtasks(
        &self,
        task: &Task,
        prev_state: TaskState,
        subtasks: Vec<NewSubtask>,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.lock();
        if !tables.cas_task(task, prev_state)? {
            return Ok(false);
        }
        for subtask in subtasks {
            tables.insert_subtask(subtask);
        }
        Ok(true)
    }

    async fn delete_global_task(&self, task_id: TaskId) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        tables.tasks.remove(&task_id);
        tables.subtasks.retain(|_, s| s.task_id != task_id);
        Ok(())
    }

    async fn add_new_subtask(
        &self,
        task_id: TaskId,
        step: Step,
        scheduler_id: &str,
        meta: Vec<u8>,
        task_type: &str,
        is_first_batch: bool,
    ) -> StorageResult<SubtaskId> {
        let new = NewSubtask::new(task_id, step, task_type, scheduler_id, meta)
            .first_batch(is_first_batch);
        Ok(self.tables.lock().insert_subtask(new))
    }

    async fn update_subtask_state_and_error(
        &self,
        subtask_id: SubtaskId,
        state: SubtaskState,
        error: Option<String>,
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        let subtask = tables
            .subtasks
            .get_mut(&subtask_id)
            .ok_or(StorageError::SubtaskNotFound(subtask_id))?;
        subtask.state = state;
        subtask.error = error;
        subtask.state_update_time = Utc::now();
        Ok(())
    }

    async fn get_subtask_in_states_cnt(
        &self,
        task_id: TaskId,
        states: &[SubtaskState],
    ) -> StorageResult<u64> {
        let tables = self.tables.lock();
        Ok(tables
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && states.contains(&s.state))
            .count() as u64)
    }

    async fn get_step_subtask_in_states_cnt(
        &self,
        task_id: TaskId,
        step: Step,
        states: &[SubtaskState],
    ) -> StorageResult<u64> {
        let tables = self.tables.lock();
        Ok(tables
            .step_subtasks(task_id, step)
            .filter(|s| states.contains(&s.state))
            .count() as u64)
    }

    async fn collect_subtask_failures(
        &self,
        task_id: TaskId,
        step: Step,
    ) -> StorageResult<Vec<SubtaskFailure>> {
        let tables = self.tables.lock();
        Ok(tables
            .step_subtasks(task_id, step)
            .filter(|s| s.state.is_failure())
            .map(|s| SubtaskFailure {
                subtask_id: s.id,
                state: s.state,
                error: s.error.clone(),
                retry_count: s.retry_count,
            })
            .collect())
    }

    async fn requeue_subtask(&self, subtask_id: SubtaskId) -> StorageResult<bool> {
        let mut tables = self.tables.lock();
        let subtask = tables
            .subtasks
            .get_mut(&subtask_id)
            .ok_or(StorageError::SubtaskNotFound(subtask_id))?;
        if subtask.state != SubtaskState::Failed {
            return Ok(false);
        }
        subtask.state = SubtaskState::Pending;
        subtask.error = None;
        subtask.retry_count += 1;
        subtask.state_update_time = Utc::now();
        Ok(true)
    }

    async fn get_scheduler_ids_by_task_id(&self, task_id: TaskId) -> StorageResult<Vec<String>> {
        let tables = self.tables.lock();
        let ids: BTreeSet<&str> = tables
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && !s.scheduler_id.is_empty())
            .map(|s| s.scheduler_id.as_str())
            .collect();
        Ok(ids.into_iter().map(str::to_string).collect())
    }

    async fn get_subtask_metas(&self, task_id: TaskId, step: Step) -> StorageResult<Vec<Vec<u8>>> {
        let tables = self.tables.lock();
        Ok(tables
            .step_subtasks(task_id, step)
            .map(|s| s.meta.clone())
            .collect())
    }

    async fn get_subtasks(&self, task_id: TaskId, step: Step) -> StorageResult<Vec<Subtask>> {
        let tables = self.tables.lock();
        Ok(tables.step_subtasks(task_id, step).cloned().collect())
    }

    async fn start_manager(&self, address: &str, role: &str) -> StorageResult<()> {
        self.tables
            .lock()
            .nodes
            .insert(address.to_string(), role.to_string());
        Ok(())
    }
}

#[async_trait]
impl ClusterMembership for MemoryTaskStorage {
    async fn live_instances(&self) -> StorageResult<Vec<InstanceInfo>> {
        let tables = self.tables.lock();
        tables
            .nodes
            .keys()
            .map(|address| {
                InstanceInfo::from_exec_id(address).ok_or_else(|| {
                    StorageError::Corrupted(format!("invalid node address: {address}"))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{STEP_INIT, STEP_ONE};

    #[tokio::test]
    async fn test_task_keys_are_unique() {
        let storage = MemoryTaskStorage::new();
        let id = storage
            .add_new_global_task("key", "example", 1, vec![])
            .await
            .unwrap();
        assert_eq!(id, 1);

        let err = storage
            .add_new_global_task("key", "example", 1, vec![])
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::DuplicateKey("key".to_string()));
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_prev_state() {
        let storage = MemoryTaskStorage::new();
        let id = storage
            .add_new_global_task("key", "example", 1, vec![])
            .await
            .unwrap();
        let mut task = storage.get_global_task_by_id(id).await.unwrap().unwrap();

        assert!(storage.cancel_global_task(id).await.unwrap());

        task.state = TaskState::Running;
        let applied = storage
            .update_global_task(&task, TaskState::Pending)
            .await
            .unwrap();
        assert!(!applied);

        let stored = storage.get_global_task_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Cancelling);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_not_written() {
        let storage = MemoryTaskStorage::new();
        let id = storage
            .add_new_global_task("key", "example", 1, vec![])
            .await
            .unwrap();
        let mut task = storage.get_global_task_by_id(id).await.unwrap().unwrap();
        task.state = TaskState::Reverting;

        let err = storage
            .update_task_and_add_subtasks(
                &task,
                TaskState::Pending,
                vec![NewSubtask::new(id, STEP_INIT, "example", "", vec![])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
        assert_eq!(storage.subtask_count(), 0);
    }

    #[tokio::test]
    async fn test_subtask_counts_and_requeue() {
        let storage = MemoryTaskStorage::new();
        let id = storage
            .add_new_global_task("key", "example", 1, vec![])
            .await
            .unwrap();
        let a = storage
            .add_new_subtask(id, STEP_ONE, "n1:1", vec![1], "example", true)
            .await
            .unwrap();
        storage
            .add_new_subtask(id, STEP_ONE, "n2:1", vec![2], "example", true)
            .await
            .unwrap();

        storage
            .update_subtask_state_and_error(a, SubtaskState::Failed, Some("boom".into()))
            .await
            .unwrap();
        let failures = storage.collect_subtask_failures(id, STEP_ONE).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("boom"));

        assert!(storage.requeue_subtask(a).await.unwrap());
        assert!(!storage.requeue_subtask(a).await.unwrap());
        let pending = storage
            .get_step_subtask_in_states_cnt(id, STEP_ONE, &[SubtaskState::Pending])
            .await
            .unwrap();
        assert_eq!(pending, 2);

        let subtasks = storage.get_subtasks(id, STEP_ONE).await.unwrap();
        assert_eq!(subtasks[0].retry_count, 1);
        assert!(subtasks[0].error.is_none());
    }

    #[tokio::test]
    async fn test_registered_nodes_are_live_instances() {
        let storage = MemoryTaskStorage::new();
        storage.start_manager(":4000", "background").await.unwrap();
        storage.start_manager("10.0.0.2:4000", "").await.unwrap();

        let instances = storage.live_instances().await.unwrap();
        let ids: Vec<String> = instances.iter().map(InstanceInfo::exec_id).collect();
        assert_eq!(ids, vec![":4000".to_string(), "10.0.0.2:4000".to_string()]);
    }
}
