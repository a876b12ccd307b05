//! # Dispatcher
//!
//! One dispatcher drives exactly one task from its persisted state to a terminal
//! state. The generic drive loop lives in [`BaseDispatcher`]; task types plug
//! their decisions in through [`Extension`].
//!
//! ## Key Components
//!
//! - [`Dispatcher`] - lifecycle contract the manager relies on
//! - [`BaseDispatcher`] - the tick-driven state machine driver
//! - [`Extension`] - per-task-type policy hooks
//! - [`TaskHandle`] - query facade handed to extensions
//! - [`placement`] - default node selection for emitted batches

pub mod base;
pub mod extension;
pub mod handle;
pub mod placement;

pub use base::BaseDispatcher;
pub use extension::{Extension, ExtensionResult};
pub use handle::{StorageTaskHandle, TaskHandle};
pub use placement::{assign_scheduler_ids, generate_scheduler_nodes};

use crate::config::DispatcherConfig;
use crate::error::DispatchResult;
use crate::models::Task;
use crate::storage::{ClusterMembership, TaskStorage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// Per-task orchestration driver
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Prepare the dispatcher; a failure fails the task before any subtask exists
    async fn init(&mut self) -> DispatchResult<()>;

    /// Drive the task until it is terminal, parked, deleted or shutdown is signalled
    async fn execute_task(&mut self);

    /// Distinct node IDs assigned to `task`'s subtasks
    async fn get_all_scheduler_ids(&self, task: &Task) -> DispatchResult<Vec<String>>;
}

/// Everything a dispatcher needs from the manager that created it
#[derive(Clone)]
pub struct DispatcherContext {
    pub storage: Arc<dyn TaskStorage>,
    pub membership: Arc<dyn ClusterMembership>,
    /// Address of the manager process owning the dispatcher
    pub server_id: String,
    pub config: DispatcherConfig,
    pub shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for DispatcherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherContext")
            .field("server_id", &self.server_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builds the dispatcher for one task of a registered type
pub type DispatcherFactory =
    Arc<dyn Fn(DispatcherContext, Task) -> Box<dyn Dispatcher> + Send + Sync>;
