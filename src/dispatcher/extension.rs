//! # Task-Type Extension
//!
//! The policy surface a task type plugs into the generic drive loop. The
//! dispatcher never interprets metas itself; every decision about what runs at a
//! step, where it may run and how to recover comes from here.

use super::handle::TaskHandle;
use crate::models::{InstanceInfo, Step, Task};
use async_trait::async_trait;

/// Extension hooks return `anyhow` errors so task types keep their own error types
pub type ExtensionResult<T> = anyhow::Result<T>;

/// Per-task-type capability set consulted by [`BaseDispatcher`](super::BaseDispatcher)
///
/// Implementations are shared between the factory and the drive loop, so any
/// bookkeeping they keep needs interior mutability.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Called once per drive-loop tick before any decision is made.
    /// Must not mutate the task.
    async fn on_tick(&self, task: &Task);

    /// One meta per subtask to run at `step`; an empty batch marks a step with no work
    async fn on_next_subtasks_batch(
        &self,
        handle: &dyn TaskHandle,
        task: &Task,
        step: Step,
    ) -> ExtensionResult<Vec<Vec<u8>>>;

    /// Meta for the revert subtasks given the failures seen at the failing step.
    ///
    /// `Ok(None)` reverts with an empty meta. An error declines reverting for now;
    /// the task stays `Reverting` and the hook is invoked again on a later tick.
    async fn on_err_stage(
        &self,
        handle: &dyn TaskHandle,
        task: &Task,
        errors: &[anyhow::Error],
    ) -> ExtensionResult<Option<Vec<u8>>>;

    /// Nodes allowed to run the task's subtasks; empty leaves subtasks unassigned
    async fn get_eligible_instances(&self, task: &Task) -> ExtensionResult<Vec<InstanceInfo>>;

    /// Whether a subtask failure is retried in place instead of reverting the task
    fn is_retryable_err(&self, err: &anyhow::Error) -> bool;

    /// Step following `task.step`, or [`STEP_DONE`](crate::models::STEP_DONE)
    async fn get_next_step(&self, handle: &dyn TaskHandle, task: &Task) -> Step;
}
