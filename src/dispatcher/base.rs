//! # Base Dispatcher
//!
//! The generic per-task drive loop. Every tick reloads the task row, lets the
//! extension observe it, then takes at most one state-machine step:
//!
//! ```text
//! Pending    -> emit first batch, Running
//! Running    -> retry / revert on failures, advance once the step drains,
//!               emit the current step if it never was
//! Cancelling -> revert (or Canceled when nothing was emitted)
//! Reverting  -> Reverted once every revert subtask is Reverted
//! Pausing    -> Paused once nothing is running
//! Resuming   -> Running
//! ```
//!
//! Nothing is cached between ticks. Every write is validated against the
//! transition table and applied as a compare-and-set on the state read at the
//! start of the tick, so an external cancel racing a dispatcher write always
//! wins and is picked up on the next tick.

use super::extension::Extension;
use super::handle::StorageTaskHandle;
use super::placement::build_batch;
use super::{Dispatcher, DispatcherContext, DispatcherFactory};
use crate::constants::status_groups::{ALL_SUBTASK_STATES, SUBTASK_STILL_WORKING_STATES};
use crate::constants::CANCELED_ERROR;
use crate::error::{DispatchError, DispatchResult, StorageError};
use crate::logging::{log_dispatch_error, log_task_operation};
use crate::metrics;
use crate::models::{NewSubtask, SubtaskFailure, Task, TaskId, STEP_DONE, STEP_REVERT};
use crate::state_machine::{verify_task_state_transition, SubtaskState, TaskState};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// What the drive loop does after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    /// Terminal, parked or deleted: the drive loop ends
    Finished,
}

/// Drives one task through its steps using an [`Extension`] for every decision
pub struct BaseDispatcher {
    ctx: DispatcherContext,
    task_id: TaskId,
    task_type: String,
    extension: Arc<dyn Extension>,
}

impl std::fmt::Debug for BaseDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseDispatcher")
            .field("task_id", &self.task_id)
            .field("task_type", &self.task_type)
            .finish_non_exhaustive()
    }
}

impl BaseDispatcher {
    pub fn new(ctx: DispatcherContext, task: &Task, extension: Arc<dyn Extension>) -> Self {
        Self {
            ctx,
            task_id: task.id,
            task_type: task.task_type.clone(),
            extension,
        }
    }

    /// Factory building a `BaseDispatcher` around the extension `make_extension` returns
    pub fn factory<F>(make_extension: F) -> DispatcherFactory
    where
        F: Fn(&Task) -> Arc<dyn Extension> + Send + Sync + 'static,
    {
        Arc::new(move |ctx, task| {
            let extension = make_extension(&task);
            Box::new(BaseDispatcher::new(ctx, &task, extension)) as Box<dyn Dispatcher>
        })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn handle(&self) -> StorageTaskHandle {
        StorageTaskHandle::new(self.task_id, self.ctx.storage.clone())
    }

    async fn tick(&self) -> DispatchResult<TickOutcome> {
        let Some(task) = self.ctx.storage.get_global_task_by_id(self.task_id).await? else {
            info!(task_id = self.task_id, "🔁 DISPATCHER: Task row is gone, stopping");
            return Ok(TickOutcome::Finished);
        };

        self.extension.on_tick(&task).await;

        match task.state {
            TaskState::Pending => self.on_pending(task).await,
            TaskState::Running => self.on_running(task).await,
            TaskState::Resuming => self.on_resuming(task).await,
            TaskState::Pausing => self.on_pausing(task).await,
            TaskState::Cancelling => self.on_cancelling(task).await,
            TaskState::Reverting => self.on_reverting(task).await,
            TaskState::Paused => {
                info!(task_id = task.id, "⏸️ DISPATCHER: Task paused, releasing slot");
                Ok(TickOutcome::Finished)
            }
            TaskState::Succeed | TaskState::Failed | TaskState::Reverted | TaskState::Canceled => {
                Ok(TickOutcome::Finished)
            }
        }
    }

    #[instrument(skip(self, task), fields(task_id = task.id, step = task.step))]
    async fn on_pending(&self, task: Task) -> DispatchResult<TickOutcome> {
        self.emit_current_step(task).await
    }

    /// Emit the batch for `task.step` and move to `Running`.
    ///
    /// Covers both a fresh task and one that reached `Running` without its
    /// step ever being emitted, as after pausing while `Pending`.
    async fn emit_current_step(&self, task: Task) -> DispatchResult<TickOutcome> {
        let prev_state = task.state;
        let emitted = self
            .ctx
            .storage
            .get_subtask_in_states_cnt(task.id, ALL_SUBTASK_STATES)
            .await?;
        let mut next = task;
        next.dispatcher_id = Some(self.ctx.server_id.clone());

        match self.next_batch(&mut next, emitted == 0).await {
            Ok(Some(batch)) => {
                next.state = TaskState::Running;
                self.write_batch(&next, prev_state, batch).await?;
                Ok(TickOutcome::Continue)
            }
            Ok(None) => {
                next.state = TaskState::Succeed;
                self.finish(next, prev_state).await
            }
            Err(err) if emitted == 0 || prev_state == TaskState::Pending => {
                // Nothing was emitted yet, so there is nothing to revert
                next.state = TaskState::Failed;
                next.error = Some(format!("{err:#}"));
                metrics::record_task_failed("batch_failed");
                self.finish(next, prev_state).await
            }
            Err(err) => {
                let cause = format!("{err:#}");
                self.revert(next, &[err], cause).await
            }
        }
    }

    #[instrument(skip(self, task), fields(task_id = task.id, step = task.step))]
    async fn on_running(&self, task: Task) -> DispatchResult<TickOutcome> {
        let failures = self
            .ctx
            .storage
            .collect_subtask_failures(task.id, task.step)
            .await?;

        let mut fatal = Vec::new();
        for failure in failures {
            if self.should_retry(&failure) {
                if self.ctx.storage.requeue_subtask(failure.subtask_id).await? {
                    info!(
                        task_id = task.id,
                        subtask_id = failure.subtask_id,
                        retry_count = failure.retry_count + 1,
                        "🔄 DISPATCHER: Re-queued retryable subtask"
                    );
                }
                continue;
            }
            fatal.push(failure);
        }

        if !fatal.is_empty() {
            let cause = fatal[0].to_string();
            warn!(
                task_id = task.id,
                failures = fatal.len(),
                cause = %cause,
                "⚠️ DISPATCHER: Step failed, reverting task"
            );
            let errors = fatal.into_iter().map(anyhow::Error::new).collect::<Vec<_>>();
            return self.revert(task, &errors, cause).await;
        }

        let working = self
            .ctx
            .storage
            .get_step_subtask_in_states_cnt(task.id, task.step, SUBTASK_STILL_WORKING_STATES)
            .await?;
        if working > 0 {
            debug!(task_id = task.id, working = working, "Step still has active subtasks");
            return Ok(TickOutcome::Continue);
        }

        let step_subtasks = self
            .ctx
            .storage
            .get_step_subtask_in_states_cnt(task.id, task.step, ALL_SUBTASK_STATES)
            .await?;
        if step_subtasks == 0 {
            info!(task_id = task.id, step = task.step, "📦 DISPATCHER: Step never emitted, emitting now");
            return self.emit_current_step(task).await;
        }

        self.advance(task).await
    }

    /// Step barrier reached: move to the next step with work, or finish
    async fn advance(&self, task: Task) -> DispatchResult<TickOutcome> {
        let prev_state = task.state;
        let mut next = task;
        let step = self.extension.get_next_step(&self.handle(), &next).await;
        if step == STEP_DONE {
            next.state = TaskState::Succeed;
            return self.finish(next, prev_state).await;
        }
        next.step = step;

        match self.next_batch(&mut next, false).await {
            Ok(Some(batch)) => {
                self.write_batch(&next, prev_state, batch).await?;
                Ok(TickOutcome::Continue)
            }
            Ok(None) => {
                next.state = TaskState::Succeed;
                self.finish(next, prev_state).await
            }
            Err(err) => {
                let cause = format!("{err:#}");
                warn!(
                    task_id = next.id,
                    step = next.step,
                    error = %cause,
                    "⚠️ DISPATCHER: Batch generation failed, reverting task"
                );
                self.revert(next, &[err], cause).await
            }
        }
    }

    /// Generate the batch for `task.step`, skipping steps without work.
    ///
    /// `Ok(None)` means the extension reached `STEP_DONE` without emitting anything.
    async fn next_batch(
        &self,
        task: &mut Task,
        mut is_first_batch: bool,
    ) -> anyhow::Result<Option<Vec<NewSubtask>>> {
        let handle = self.handle();
        loop {
            let metas = self
                .extension
                .on_next_subtasks_batch(&handle, task, task.step)
                .await?;
            if !metas.is_empty() {
                let instances = self.extension.get_eligible_instances(task).await?;
                return Ok(Some(build_batch(
                    task,
                    task.step,
                    metas,
                    &instances,
                    is_first_batch,
                )));
            }

            debug!(task_id = task.id, step = task.step, "Step has no subtasks, moving on");
            let step = self.extension.get_next_step(&handle, task).await;
            if step == STEP_DONE {
                return Ok(None);
            }
            task.step = step;
            is_first_batch = false;
        }
    }

    fn should_retry(&self, failure: &SubtaskFailure) -> bool {
        if failure.state != SubtaskState::Failed || failure.error.is_none() {
            return false;
        }
        if failure.retry_count >= self.ctx.config.max_subtask_retries {
            return false;
        }
        self.extension
            .is_retryable_err(&anyhow::Error::new(failure.clone()))
    }

    /// Move the task to `Reverting` and emit the revert batch.
    ///
    /// When the extension declines, the task still moves to `Reverting` with
    /// its error recorded; later ticks ask again.
    async fn revert(
        &self,
        task: Task,
        errors: &[anyhow::Error],
        cause: String,
    ) -> DispatchResult<TickOutcome> {
        let prev_state = task.state;
        let mut next = task;
        next.state = TaskState::Reverting;
        next.error = Some(cause);

        let batch = match self.revert_batch(&next, errors).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    task_id = next.id,
                    error = %format!("{err:#}"),
                    "⚠️ DISPATCHER: Extension declined to revert, will retry"
                );
                Vec::new()
            }
        };

        if self.write_task(&next, prev_state, batch).await? {
            log_task_operation("revert", next.id, &next.task_type, next.state, next.error.as_deref());
        }
        Ok(TickOutcome::Continue)
    }

    /// One revert subtask per node that already ran part of the task
    async fn revert_batch(
        &self,
        task: &Task,
        errors: &[anyhow::Error],
    ) -> anyhow::Result<Vec<NewSubtask>> {
        let handle = self.handle();
        let meta = self
            .extension
            .on_err_stage(&handle, task, errors)
            .await?
            .unwrap_or_default();

        let mut scheduler_ids = self.get_all_scheduler_ids_of(task.id).await?;
        if scheduler_ids.is_empty() {
            scheduler_ids.push(String::new());
        }

        Ok(scheduler_ids
            .into_iter()
            .map(|scheduler_id| {
                NewSubtask::new(task.id, STEP_REVERT, &task.task_type, scheduler_id, meta.clone())
            })
            .collect())
    }

    #[instrument(skip(self, task), fields(task_id = task.id))]
    async fn on_reverting(&self, task: Task) -> DispatchResult<TickOutcome> {
        let subtasks = self.ctx.storage.get_subtasks(task.id, STEP_REVERT).await?;

        if subtasks.is_empty() {
            let failures = self
                .ctx
                .storage
                .collect_subtask_failures(task.id, task.step)
                .await?;
            let mut errors = failures.into_iter().map(anyhow::Error::new).collect::<Vec<_>>();
            if errors.is_empty() {
                let cause = task.error.clone().unwrap_or_else(|| CANCELED_ERROR.to_string());
                errors.push(anyhow::anyhow!(cause));
            }
            match self.revert_batch(&task, &errors).await {
                Ok(batch) => {
                    self.write_batch(&task, task.state, batch).await?;
                }
                Err(err) => {
                    debug!(task_id = task.id, error = %format!("{err:#}"), "Revert still declined");
                }
            }
            return Ok(TickOutcome::Continue);
        }

        if subtasks.iter().all(|s| s.state == SubtaskState::Reverted) {
            let prev_state = task.state;
            let mut next = task;
            next.state = TaskState::Reverted;
            return self.finish(next, prev_state).await;
        }

        if let Some(stuck) = subtasks.iter().find(|s| s.state.is_failure()) {
            // Parked until an operator intervenes
            warn!(
                task_id = task.id,
                subtask_id = stuck.id,
                state = %stuck.state,
                "⚠️ DISPATCHER: Revert subtask did not revert, task stays reverting"
            );
        }
        Ok(TickOutcome::Continue)
    }

    #[instrument(skip(self, task), fields(task_id = task.id))]
    async fn on_cancelling(&self, task: Task) -> DispatchResult<TickOutcome> {
        let emitted = self
            .ctx
            .storage
            .get_subtask_in_states_cnt(task.id, ALL_SUBTASK_STATES)
            .await?;

        if emitted == 0 {
            let prev_state = task.state;
            let mut next = task;
            next.state = TaskState::Canceled;
            next.error = Some(CANCELED_ERROR.to_string());
            return self.finish(next, prev_state).await;
        }

        info!(task_id = task.id, "🛑 DISPATCHER: Cancel requested, reverting task");
        let cancel = anyhow::anyhow!(CANCELED_ERROR);
        self.revert(task, &[cancel], CANCELED_ERROR.to_string()).await
    }

    #[instrument(skip(self, task), fields(task_id = task.id))]
    async fn on_pausing(&self, task: Task) -> DispatchResult<TickOutcome> {
        let running = self
            .ctx
            .storage
            .get_step_subtask_in_states_cnt(task.id, task.step, &[SubtaskState::Running])
            .await?;
        if running > 0 {
            debug!(task_id = task.id, running = running, "Waiting for running subtasks before pausing");
            return Ok(TickOutcome::Continue);
        }

        let prev_state = task.state;
        let mut next = task;
        next.state = TaskState::Paused;
        if self.write_task(&next, prev_state, Vec::new()).await? {
            log_task_operation("pause", next.id, &next.task_type, next.state, None);
            return Ok(TickOutcome::Finished);
        }
        Ok(TickOutcome::Continue)
    }

    async fn on_resuming(&self, task: Task) -> DispatchResult<TickOutcome> {
        let prev_state = task.state;
        let mut next = task;
        next.state = TaskState::Running;
        next.dispatcher_id = Some(self.ctx.server_id.clone());
        if self.write_task(&next, prev_state, Vec::new()).await? {
            log_task_operation("resume", next.id, &next.task_type, next.state, None);
        }
        Ok(TickOutcome::Continue)
    }

    async fn write_batch(
        &self,
        task: &Task,
        prev_state: TaskState,
        batch: Vec<NewSubtask>,
    ) -> DispatchResult<()> {
        let count = batch.len() as u64;
        if self.write_task(task, prev_state, batch).await? {
            metrics::subtasks_dispatched_total().add(count, &metrics::task_type_label(&task.task_type));
            info!(
                task_id = task.id,
                step = task.step,
                subtasks = count,
                state = %task.state,
                "📦 DISPATCHER: Dispatched subtask batch"
            );
        }
        Ok(())
    }

    /// Write a terminal state; the drive loop ends once it lands
    async fn finish(&self, task: Task, prev_state: TaskState) -> DispatchResult<TickOutcome> {
        if !self.write_task(&task, prev_state, Vec::new()).await? {
            return Ok(TickOutcome::Continue);
        }
        metrics::record_task_finished(task.state);
        log_task_operation("finish", task.id, &task.task_type, task.state, task.error.as_deref());
        Ok(TickOutcome::Finished)
    }

    /// Validated compare-and-set with bounded retries on storage errors.
    ///
    /// Returns false when another writer changed the state first.
    async fn write_task(
        &self,
        task: &Task,
        prev_state: TaskState,
        batch: Vec<NewSubtask>,
    ) -> DispatchResult<bool> {
        if !verify_task_state_transition(prev_state, task.state) {
            return Err(DispatchError::InvalidTransition {
                task_id: task.id,
                from: prev_state,
                to: task.state,
            });
        }

        let attempts = self.ctx.config.storage_retry_times.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .ctx
                .storage
                .update_task_and_add_subtasks(task, prev_state, batch.clone())
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    debug!(
                        task_id = task.id,
                        expected = %prev_state,
                        "Task state changed underneath the dispatcher, retrying next tick"
                    );
                    return Ok(false);
                }
                Err(StorageError::Database(msg)) if attempt < attempts => {
                    warn!(
                        task_id = task.id,
                        attempt = attempt,
                        error = %msg,
                        "Storage write failed, backing off"
                    );
                    sleep(self.ctx.config.storage_retry_backoff()).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn get_all_scheduler_ids_of(&self, task_id: TaskId) -> DispatchResult<Vec<String>> {
        Ok(self.ctx.storage.get_scheduler_ids_by_task_id(task_id).await?)
    }
}

#[async_trait]
impl Dispatcher for BaseDispatcher {
    async fn init(&mut self) -> DispatchResult<()> {
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = self.task_id, task_type = %self.task_type))]
    async fn execute_task(&mut self) {
        info!("🚀 DISPATCHER: Starting drive loop");
        let mut ticker = interval(self.ctx.config.check_task_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.ctx.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            match self.tick().await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Finished) => {
                    info!("✅ DISPATCHER: Drive loop finished");
                    return;
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "Transient storage error, retrying next tick");
                }
                Err(err) => {
                    log_dispatch_error("dispatcher", "tick", Some(self.task_id), &err.to_string());
                }
            }
        }
        info!("🛑 DISPATCHER: Shutdown signalled, leaving drive loop");
    }

    async fn get_all_scheduler_ids(&self, task: &Task) -> DispatchResult<Vec<String>> {
        self.get_all_scheduler_ids_of(task.id).await
    }
}
