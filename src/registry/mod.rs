//! # Dispatcher Factory Registry
//!
//! Maps a task type to the factory that builds its dispatcher. The registry is
//! an ordinary value injected into each manager, so several managers with
//! different registrations can live in one process.

use crate::dispatcher::DispatcherFactory;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Task type -> dispatcher factory
#[derive(Default)]
pub struct DispatcherFactoryRegistry {
    factories: DashMap<String, DispatcherFactory>,
}

impl std::fmt::Debug for DispatcherFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherFactoryRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl DispatcherFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `task_type`; a later registration replaces an earlier one
    pub fn register(&self, task_type: impl Into<String>, factory: DispatcherFactory) {
        let task_type = task_type.into();
        if self.factories.insert(task_type.clone(), factory).is_some() {
            warn!(task_type = %task_type, "📚 REGISTRY: Replacing dispatcher factory");
        } else {
            debug!(task_type = %task_type, "📚 REGISTRY: Registered dispatcher factory");
        }
    }

    pub fn get(&self, task_type: &str) -> Option<DispatcherFactory> {
        self.factories.get(task_type).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, task_type: &str) -> bool {
        self.factories.remove(task_type).is_some()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}
