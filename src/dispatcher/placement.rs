//! # Subtask Placement
//!
//! Default node selection used when a batch is emitted: every eligible instance
//! receives subtasks round-robin by its exec ID; with no eligible instance the
//! subtasks stay unassigned and any live node may claim them.

use crate::error::StorageResult;
use crate::models::{InstanceInfo, NewSubtask, Step, Task};
use crate::storage::ClusterMembership;

/// Every live instance in the cluster
pub async fn generate_scheduler_nodes(
    membership: &dyn ClusterMembership,
) -> StorageResult<Vec<InstanceInfo>> {
    membership.live_instances().await
}

/// Scheduler IDs for `n` subtasks spread round-robin over `instances`
pub fn assign_scheduler_ids(n: usize, instances: &[InstanceInfo]) -> Vec<String> {
    if instances.is_empty() {
        return vec![String::new(); n];
    }
    instances
        .iter()
        .map(InstanceInfo::exec_id)
        .cycle()
        .take(n)
        .collect()
}

/// Pair each meta with its assigned node
pub fn build_batch(
    task: &Task,
    step: Step,
    metas: Vec<Vec<u8>>,
    instances: &[InstanceInfo],
    is_first_batch: bool,
) -> Vec<NewSubtask> {
    let scheduler_ids = assign_scheduler_ids(metas.len(), instances);
    metas
        .into_iter()
        .zip(scheduler_ids)
        .map(|(meta, scheduler_id)| {
            NewSubtask::new(task.id, step, &task.task_type, scheduler_id, meta)
                .first_batch(is_first_batch)
        })
        .collect()
}
