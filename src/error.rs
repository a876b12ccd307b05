//! Error types for the dispatch orchestration core.
//!

use crate::models::{SubtaskId, TaskId};
use crate::state_machine::TaskState;
use thiserror::Error;

/// Failures reported by a [`TaskStorage`](crate::storage::TaskStorage) implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),
    #[error("Subtask {0} not found")]
    SubtaskNotFound(SubtaskId),
    #[error("Task key already exists: {0}")]
    DuplicateKey(String),
    #[error("Invalid task state transition from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },
    #[error("Database error: {0}")]
    Database(String),
    #[error("Corrupted row: {0}")]
    Corrupted(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Database(format!("migration failed: {err}"))
    }
}

/// Errors raised while orchestrating tasks.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
    #[error("dispatcher init failed: {0}")]
    InitFailed(String),
    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
    #[error("Extension error: {0}")]
    Extension(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DispatchError {
    /// Storage hiccups are retried on the next tick instead of failing the task
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Storage(StorageError::Database(_))
        )
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Extension(format!("{err:#}"))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
