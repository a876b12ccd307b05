#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Disttask Core
//!
//! Dispatch orchestration for long-running tasks split into ordered steps,
//! each step fanning out into subtasks executed by cluster nodes.
//!
//! ## Overview
//!
//! A [`manager::DispatcherManager`] polls task storage and starts one
//! dispatcher per task, up to a configured concurrency cap. Each dispatcher
//! drives its task through a persisted state machine: it asks the task type's
//! [`dispatcher::Extension`] for subtask batches, writes them with their node
//! assignments, waits for the step barrier and either advances, reverts on
//! failure, or finishes. All state lives in storage, so a restarted process
//! picks up where the previous one stopped.
//!
//! ## Module Organization
//!
//! - [`models`] - Task, subtask and instance records
//! - [`state_machine`] - Task and subtask states and the transition rules
//! - [`storage`] - Storage and cluster membership contracts, memory and PostgreSQL backends
//! - [`dispatcher`] - Per-task drive loop and the extension contract
//! - [`registry`] - Task type to dispatcher factory mapping
//! - [`manager`] - Dispatch and detection loops under a concurrency cap
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use disttask_core::config::DispatcherConfig;
//! use disttask_core::manager::DispatcherManager;
//! use disttask_core::registry::DispatcherFactoryRegistry;
//! use disttask_core::storage::MemoryTaskStorage;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryTaskStorage::new());
//! let registry = Arc::new(DispatcherFactoryRegistry::new());
//! let manager = DispatcherManager::new(
//!     storage.clone(),
//!     storage,
//!     registry,
//!     DispatcherConfig::default(),
//!     "10.0.0.1:4000",
//! );
//!
//! manager.start();
//! // register factories, submit tasks...
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod state_machine;
pub mod storage;

pub use config::{ConfigManager, DispatcherConfig, DisttaskConfig, LoggingConfig};
pub use dispatcher::{
    BaseDispatcher, Dispatcher, DispatcherContext, DispatcherFactory, Extension, ExtensionResult,
    TaskHandle,
};
pub use error::{DispatchError, DispatchResult, StorageError, StorageResult};
pub use manager::DispatcherManager;
pub use models::{
    InstanceInfo, NewSubtask, Step, Subtask, SubtaskFailure, SubtaskId, Task, TaskId, STEP_DONE,
    STEP_INIT, STEP_ONE, STEP_REVERT, STEP_TWO,
};
pub use registry::DispatcherFactoryRegistry;
pub use state_machine::{verify_task_state_transition, SubtaskState, TaskState};
pub use storage::{ClusterMembership, MemoryTaskStorage, TaskStorage};

#[cfg(feature = "postgres")]
pub use storage::PgTaskStorage;
