//! Tracked set of tasks with a live drive loop.

use crate::models::TaskId;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::task::JoinHandle;

/// Task ID -> drive loop handle, guarded by one mutex.
///
/// The lock is only held for map operations, never across an await.
#[derive(Debug, Default)]
pub struct RunningTaskSet {
    tasks: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl RunningTaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.lock().contains_key(&task_id)
    }

    /// Track a drive loop; an already tracked task hands the new handle back
    pub fn insert(&self, task_id: TaskId, handle: JoinHandle<()>) -> Result<(), JoinHandle<()>> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&task_id) {
            return Err(handle);
        }
        tasks.insert(task_id, handle);
        Ok(())
    }

    pub fn remove(&self, task_id: TaskId) -> Option<JoinHandle<()>> {
        self.tasks.lock().remove(&task_id)
    }

    /// Drop every entry whose drive loop has ended and return their IDs
    pub fn reap_finished(&self) -> Vec<TaskId> {
        let mut tasks = self.tasks.lock();
        let finished: Vec<TaskId> = tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            tasks.remove(id);
        }
        finished
    }

    pub fn drain(&self) -> Vec<(TaskId, JoinHandle<()>)> {
        self.tasks.lock().drain().collect()
    }
}
