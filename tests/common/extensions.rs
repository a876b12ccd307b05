//! Test extensions and dispatchers shared by the integration suites.

use async_trait::async_trait;
use disttask_core::dispatcher::{generate_scheduler_nodes, Extension, TaskHandle};
use disttask_core::error::{DispatchError, DispatchResult};
use disttask_core::models::{InstanceInfo, Step, Task, STEP_DONE, STEP_INIT, STEP_ONE};
use disttask_core::storage::ClusterMembership;
use disttask_core::Dispatcher;
use parking_lot::Mutex;
use std::sync::Arc;

/// Subtasks the number example emits at its first step
pub const SUBTASK_CNT: usize = 3;

/// Extension that never emits work and finishes immediately
#[derive(Debug, Default)]
pub struct NoopExtension {
    instances: Mutex<Vec<InstanceInfo>>,
}

impl NoopExtension {
    pub fn set_instances(&self, instances: Vec<InstanceInfo>) {
        *self.instances.lock() = instances;
    }
}

#[async_trait]
impl Extension for NoopExtension {
    async fn on_tick(&self, _task: &Task) {}

    async fn on_next_subtasks_batch(
        &self,
        _handle: &dyn TaskHandle,
        _task: &Task,
        _step: Step,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    async fn on_err_stage(
        &self,
        _handle: &dyn TaskHandle,
        _task: &Task,
        _errors: &[anyhow::Error],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn get_eligible_instances(&self, _task: &Task) -> anyhow::Result<Vec<InstanceInfo>> {
        Ok(self.instances.lock().clone())
    }

    fn is_retryable_err(&self, _err: &anyhow::Error) -> bool {
        true
    }

    async fn get_next_step(&self, _handle: &dyn TaskHandle, _task: &Task) -> Step {
        STEP_DONE
    }
}

/// Three subtasks at STEP_INIT, an empty STEP_ONE, then done.
/// Subtasks go to every live node.
pub struct NumberExampleExtension {
    membership: Arc<dyn ClusterMembership>,
}

impl NumberExampleExtension {
    pub fn new(membership: Arc<dyn ClusterMembership>) -> Self {
        Self { membership }
    }
}

#[async_trait]
impl Extension for NumberExampleExtension {
    async fn on_tick(&self, _task: &Task) {}

    async fn on_next_subtasks_batch(
        &self,
        _handle: &dyn TaskHandle,
        task: &Task,
        _step: Step,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        match task.step {
            STEP_INIT => Ok(vec![b"1".to_vec(); SUBTASK_CNT]),
            STEP_ONE => Ok(Vec::new()),
            other => anyhow::bail!("unknown step {other}"),
        }
    }

    async fn on_err_stage(
        &self,
        _handle: &dyn TaskHandle,
        _task: &Task,
        _errors: &[anyhow::Error],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn get_eligible_instances(&self, _task: &Task) -> anyhow::Result<Vec<InstanceInfo>> {
        Ok(generate_scheduler_nodes(self.membership.as_ref()).await?)
    }

    fn is_retryable_err(&self, _err: &anyhow::Error) -> bool {
        true
    }

    async fn get_next_step(&self, _handle: &dyn TaskHandle, task: &Task) -> Step {
        match task.step {
            STEP_INIT => STEP_ONE,
            _ => STEP_DONE,
        }
    }
}

/// Dispatcher whose init always fails
#[derive(Debug, Default)]
pub struct FailingInitDispatcher;

#[async_trait]
impl Dispatcher for FailingInitDispatcher {
    async fn init(&mut self) -> DispatchResult<()> {
        Err(DispatchError::Extension("mock dispatcher init error".to_string()))
    }

    async fn execute_task(&mut self) {
        panic!("execute_task must not run after a failed init");
    }

    async fn get_all_scheduler_ids(&self, _task: &Task) -> DispatchResult<Vec<String>> {
        Ok(Vec::new())
    }
}
