#![allow(dead_code)]

pub mod extensions;
pub mod strategies;

pub use extensions::*;

use disttask_core::config::DispatcherConfig;
use disttask_core::dispatcher::{BaseDispatcher, Extension};
use disttask_core::manager::DispatcherManager;
use disttask_core::registry::DispatcherFactoryRegistry;
use disttask_core::storage::{MemoryTaskStorage, TaskStorage};
use disttask_core::{Task, TaskId, TaskState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const EXAMPLE_TASK_TYPE: &str = "example";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const WAIT_TICK: Duration = Duration::from_millis(20);

/// Fast loop intervals so scenarios settle within a few hundred milliseconds
pub fn fast_config(dispatch_concurrency: usize) -> DispatcherConfig {
    DispatcherConfig {
        dispatch_concurrency,
        dispatch_interval_ms: 30,
        detect_interval_ms: 20,
        check_task_interval_ms: 20,
        storage_retry_backoff_ms: 5,
        ..DispatcherConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, tick: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(tick).await;
    }
}

/// In-memory storage plus a manager wired to it
pub struct TestCluster {
    pub storage: Arc<MemoryTaskStorage>,
    pub registry: Arc<DispatcherFactoryRegistry>,
    pub manager: DispatcherManager,
}

impl TestCluster {
    pub fn new(dispatch_concurrency: usize) -> Self {
        Self::with_storage(Arc::new(MemoryTaskStorage::new()), dispatch_concurrency)
    }

    pub fn with_storage(storage: Arc<MemoryTaskStorage>, dispatch_concurrency: usize) -> Self {
        let registry = Arc::new(DispatcherFactoryRegistry::new());
        let manager = DispatcherManager::new(
            storage.clone(),
            storage.clone(),
            registry.clone(),
            fast_config(dispatch_concurrency),
            "127.0.0.1:4000",
        );
        Self {
            storage,
            registry,
            manager,
        }
    }

    /// Register the number example for [`EXAMPLE_TASK_TYPE`]
    pub fn register_number_example(&self) {
        let membership = self.storage.clone();
        self.manager.register_dispatcher_factory(
            EXAMPLE_TASK_TYPE,
            BaseDispatcher::factory(move |_task| {
                Arc::new(NumberExampleExtension::new(membership.clone())) as Arc<dyn Extension>
            }),
        );
    }

    pub async fn submit(&self, key: &str) -> TaskId {
        self.storage
            .add_new_global_task(key, EXAMPLE_TASK_TYPE, 0, Vec::new())
            .await
            .unwrap()
    }

    pub async fn task(&self, task_id: TaskId) -> Task {
        self.storage
            .get_global_task_by_id(task_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn wait_for_state(&self, task_id: TaskId, state: TaskState) -> bool {
        eventually(WAIT_TIMEOUT, WAIT_TICK, || async move {
            self.task(task_id).await.state == state
        })
        .await
    }

    pub async fn wait_for_running_cnt(&self, expected: usize) -> bool {
        eventually(WAIT_TIMEOUT, WAIT_TICK, || async move {
            self.manager.get_running_task_cnt() == expected
        })
        .await
    }
}
