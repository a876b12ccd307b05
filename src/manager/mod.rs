//! # Dispatcher Manager
//!
//! Process-wide scheduler of dispatchers. Two periodic loops run once
//! [`DispatcherManager::start`] is called:
//!
//! - **dispatch loop**: while below the concurrency cap, picks up
//!   dispatchable tasks not yet tracked, builds their dispatcher and spawns its
//!   drive loop
//! - **detection loop**: reaps tracked tasks whose drive loop has ended,
//!   freeing their slot
//!
//! Running tasks are never preempted; the cap only gates new starts. Tracking
//! a task ID before its drive loop can be started twice keeps a single
//! dispatcher per task in this process.

pub mod running_tasks;

pub use running_tasks::RunningTaskSet;

use crate::config::DispatcherConfig;
use crate::constants::status_groups::DISPATCHABLE_TASK_STATES;
use crate::dispatcher::{DispatcherContext, DispatcherFactory};
use crate::error::{DispatchError, DispatchResult};
use crate::logging::log_dispatch_error;
use crate::metrics;
use crate::models::{Task, TaskId};
use crate::registry::DispatcherFactoryRegistry;
use crate::state_machine::{verify_task_state_transition, TaskState};
use crate::storage::{ClusterMembership, TaskStorage};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// State shared between the manager handle and its loops
struct ManagerShared {
    storage: Arc<dyn TaskStorage>,
    membership: Arc<dyn ClusterMembership>,
    registry: Arc<DispatcherFactoryRegistry>,
    config: DispatcherConfig,
    server_id: String,
    running: RunningTaskSet,
    /// Tasks that can be neither driven nor failed from their current state
    stranded: Mutex<HashSet<TaskId>>,
    shutdown: watch::Receiver<bool>,
}

/// Top-level orchestrator owning every dispatcher started in this process
pub struct DispatcherManager {
    id: Uuid,
    shared: Arc<ManagerShared>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DispatcherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherManager")
            .field("id", &self.id)
            .field("server_id", &self.shared.server_id)
            .field("running", &self.shared.running.len())
            .finish_non_exhaustive()
    }
}

impl DispatcherManager {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        membership: Arc<dyn ClusterMembership>,
        registry: Arc<DispatcherFactoryRegistry>,
        config: DispatcherConfig,
        server_id: impl Into<String>,
    ) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let id = Uuid::new_v4();
        let server_id = server_id.into();

        info!(
            manager_id = %id,
            server_id = %server_id,
            dispatch_concurrency = config.dispatch_concurrency,
            "🏗️ MANAGER: Created dispatcher manager"
        );

        Self {
            id,
            shared: Arc::new(ManagerShared {
                storage,
                membership,
                registry,
                config,
                server_id,
                running: RunningTaskSet::new(),
                stranded: Mutex::new(HashSet::new()),
                shutdown,
            }),
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Launch the dispatch and detection loops and return immediately
    #[instrument(skip(self), fields(manager_id = %self.id))]
    pub fn start(&self) {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            warn!("MANAGER: Already started");
            return;
        }

        info!("🚀 MANAGER: Starting dispatch and detection loops");
        loops.push(tokio::spawn(dispatch_loop(self.shared.clone())));
        loops.push(tokio::spawn(detection_loop(self.shared.clone())));
    }

    /// Signal shutdown, wait for both loops, then for every drive loop still tracked
    #[instrument(skip(self), fields(manager_id = %self.id))]
    pub async fn stop(&self) {
        info!("🛑 MANAGER: Stopping");
        // send only fails when no receiver exists, and the manager holds one
        let _ = self.shutdown_tx.send(true);

        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        join_all(loops).await;

        let drivers: Vec<_> = self
            .shared
            .running
            .drain()
            .into_iter()
            .map(|(_, handle)| handle)
            .collect();
        let count = drivers.len();
        join_all(drivers).await;

        info!(drivers = count, "✅ MANAGER: Stopped");
    }

    /// Register or replace the factory for `task_type`
    pub fn register_dispatcher_factory(&self, task_type: impl Into<String>, factory: DispatcherFactory) {
        self.shared.registry.register(task_type, factory);
    }

    pub fn get_running_task_cnt(&self) -> usize {
        self.shared.running.len()
    }

    /// Forget a tracked task without touching its persisted state; its drive loop is aborted
    pub fn del_running_task(&self, task_id: TaskId) {
        if let Some(handle) = self.shared.running.remove(task_id) {
            handle.abort();
            info!(task_id = task_id, "MANAGER: Removed running task");
        }
    }

    /// Register this process with the cluster membership view
    pub async fn register_node(&self, address: &str, role: &str) -> DispatchResult<()> {
        self.shared.storage.start_manager(address, role).await?;
        Ok(())
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn registry(&self) -> &Arc<DispatcherFactoryRegistry> {
        &self.shared.registry
    }
}

async fn dispatch_loop(shared: Arc<ManagerShared>) {
    let mut ticker = interval(shared.config.dispatch_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = shared.shutdown.clone();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = shared.dispatch_once().await {
                    log_dispatch_error("manager", "dispatch_loop", None, &err.to_string());
                }
            }
            _ = shutdown.changed() => {
                info!("Dispatch loop shutting down");
                break;
            }
        }
    }
}

async fn detection_loop(shared: Arc<ManagerShared>) {
    let mut ticker = interval(shared.config.detect_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = shared.shutdown.clone();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for task_id in shared.running.reap_finished() {
                    info!(task_id = task_id, "🧹 MANAGER: Dispatcher finished, slot freed");
                }
            }
            _ = shutdown.changed() => {
                info!("Detection loop shutting down");
                break;
            }
        }
    }
}

impl ManagerShared {
    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn has_capacity(&self) -> bool {
        self.running.len() < self.config.dispatch_concurrency
    }

    async fn dispatch_once(&self) -> DispatchResult<()> {
        if !self.has_capacity() {
            debug!(running = self.running.len(), "Dispatch concurrency reached");
            return Ok(());
        }

        let tasks = self
            .storage
            .get_global_tasks_in_states(DISPATCHABLE_TASK_STATES)
            .await?;

        for task in tasks {
            if self.shutting_down() || !self.has_capacity() {
                break;
            }
            if self.running.contains(task.id) {
                continue;
            }
            self.start_dispatcher(task).await;
        }
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = task.id, task_type = %task.task_type))]
    async fn start_dispatcher(&self, task: Task) {
        let Some(factory) = self.registry.get(&task.task_type) else {
            let err = DispatchError::UnknownTaskType(task.task_type.clone());
            self.fail_task(task, err, "unknown_task_type").await;
            return;
        };

        let ctx = DispatcherContext {
            storage: self.storage.clone(),
            membership: self.membership.clone(),
            server_id: self.server_id.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        };
        let mut dispatcher = factory(ctx, task.clone());
        if let Err(err) = dispatcher.init().await {
            let err = DispatchError::InitFailed(err.to_string());
            self.fail_task(task, err, "init_failed").await;
            return;
        }

        let handle = tokio::spawn(async move {
            metrics::dispatchers_running().add(1, &[]);
            dispatcher.execute_task().await;
            metrics::dispatchers_running().add(-1, &[]);
        });
        if let Err(duplicate) = self.running.insert(task.id, handle) {
            duplicate.abort();
            warn!("MANAGER: Task already tracked, dropped second dispatcher");
            return;
        }

        self.stranded.lock().remove(&task.id);
        metrics::tasks_dispatched_total().add(1, &metrics::task_type_label(&task.task_type));
        info!(state = %task.state, step = task.step, "🚀 MANAGER: Dispatcher started");
    }

    /// Fail a task the manager cannot orchestrate, when its state still allows it
    ///
    /// A task whose state forbids `Failed` stays where it is and is reported
    /// once; later dispatch passes retry it quietly in case a factory shows up.
    async fn fail_task(&self, task: Task, err: DispatchError, reason: &'static str) {
        if !verify_task_state_transition(task.state, TaskState::Failed) {
            if self.stranded.lock().insert(task.id) {
                warn!(
                    task_id = task.id,
                    state = %task.state,
                    error = %err,
                    "⚠️ MANAGER: Task cannot be orchestrated or failed from its current state"
                );
            } else {
                debug!(task_id = task.id, error = %err, "Task still stranded");
            }
            return;
        }

        warn!(task_id = task.id, error = %err, "⚠️ MANAGER: Failing task");

        let prev_state = task.state;
        let mut next = task;
        next.state = TaskState::Failed;
        next.error = Some(err.to_string());

        match self.storage.update_global_task(&next, prev_state).await {
            Ok(true) => {
                metrics::record_task_failed(reason);
                metrics::record_task_finished(TaskState::Failed);
            }
            Ok(false) => debug!(task_id = next.id, "Task changed state before it could be failed"),
            Err(storage_err) => {
                log_dispatch_error("manager", "fail_task", Some(next.id), &storage_err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::storage::MemoryTaskStorage;
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Dispatcher for Idle {
        async fn init(&mut self) -> DispatchResult<()> {
            Ok(())
        }

        async fn execute_task(&mut self) {}

        async fn get_all_scheduler_ids(&self, _task: &Task) -> DispatchResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn manager(storage: Arc<MemoryTaskStorage>) -> DispatcherManager {
        DispatcherManager::new(
            storage.clone(),
            storage,
            Arc::new(DispatcherFactoryRegistry::new()),
            DispatcherConfig::default(),
            "127.0.0.1:4000",
        )
    }

    #[tokio::test]
    async fn test_unknown_task_that_cannot_fail_is_stranded_once() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let task_id = storage
            .add_new_global_task("stranded", "mystery", 1, Vec::new())
            .await
            .unwrap();
        assert!(storage.cancel_global_task(task_id).await.unwrap());
        let manager = manager(storage.clone());

        for _ in 0..3 {
            manager.shared.dispatch_once().await.unwrap();
        }

        let task = storage.get_global_task_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Cancelling);
        assert_eq!(manager.shared.stranded.lock().len(), 1);
        assert_eq!(manager.get_running_task_cnt(), 0);

        // a late registration picks the task up and clears the mark
        manager.register_dispatcher_factory(
            "mystery",
            Arc::new(|_ctx: DispatcherContext, _task: Task| Box::new(Idle) as Box<dyn Dispatcher>),
        );
        manager.shared.dispatch_once().await.unwrap();
        assert!(manager.shared.stranded.lock().is_empty());
        assert_eq!(manager.get_running_task_cnt(), 1);
    }

    #[tokio::test]
    async fn test_unknown_pending_task_fails() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let task_id = storage
            .add_new_global_task("doomed", "mystery", 1, Vec::new())
            .await
            .unwrap();
        let manager = manager(storage.clone());

        manager.shared.dispatch_once().await.unwrap();

        let task = storage.get_global_task_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_deref(), Some("unknown task type: mystery"));
        assert!(manager.shared.stranded.lock().is_empty());
    }
}
