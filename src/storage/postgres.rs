//! # PostgreSQL Task Storage
//!
//! SQLx-backed implementation of [`TaskStorage`] over three tables:
//!
//! ```text
//! disttask_global_task     one row per submitted task
//! disttask_subtask         one row per subtask, batched by (task_id, step)
//! disttask_framework_meta  one row per registered node
//! ```
//!
//! Task writes are `UPDATE ... WHERE id = $1 AND state = $prev` so a concurrent
//! external request (cancel, pause) always wins over a stale dispatcher write.
//! Batch inserts run in the same transaction as the task update.

use super::{ClusterMembership, TaskStorage};
use crate::constants::status_groups::{CANCELLABLE_TASK_STATES, PAUSABLE_TASK_STATES};
use crate::error::{StorageError, StorageResult};
use crate::models::{
    InstanceInfo, NewSubtask, Step, Subtask, SubtaskFailure, SubtaskId, Task, TaskId,
};
use crate::state_machine::{verify_task_state_transition, SubtaskState, TaskState};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

const TASK_COLUMNS: &str = "id, task_key, task_type, state, step, concurrency, meta, error, \
                            dispatcher_id, start_time, state_update_time";
const SUBTASK_COLUMNS: &str = "id, task_id, step, task_type, state, scheduler_id, meta, error, \
                               retry_count, is_first_batch, create_time, state_update_time";

fn state_names<S: ToString>(states: &[S]) -> Vec<String> {
    states.iter().map(ToString::to_string).collect()
}

fn task_from_row(row: &PgRow) -> StorageResult<Task> {
    let state: String = row.try_get("state")?;
    let concurrency: i64 = row.try_get("concurrency")?;
    Ok(Task {
        id: row.try_get("id")?,
        key: row.try_get("task_key")?,
        task_type: row.try_get("task_type")?,
        state: state.parse().map_err(StorageError::Corrupted)?,
        step: row.try_get("step")?,
        concurrency: concurrency.max(0) as u64,
        meta: row.try_get("meta")?,
        error: row.try_get("error")?,
        dispatcher_id: row.try_get("dispatcher_id")?,
        start_time: row.try_get("start_time")?,
        state_update_time: row.try_get("state_update_time")?,
    })
}

fn subtask_from_row(row: &PgRow) -> StorageResult<Subtask> {
    let state: String = row.try_get("state")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    Ok(Subtask {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        step: row.try_get("step")?,
        task_type: row.try_get("task_type")?,
        state: state.parse().map_err(StorageError::Corrupted)?,
        scheduler_id: row.try_get("scheduler_id")?,
        meta: row.try_get("meta")?,
        error: row.try_get("error")?,
        retry_count: retry_count.max(0) as u32,
        is_first_batch: row.try_get("is_first_batch")?,
        create_time: row.try_get("create_time")?,
        state_update_time: row.try_get("state_update_time")?,
    })
}

/// PostgreSQL-backed task storage
#[derive(Debug, Clone)]
pub struct PgTaskStorage {
    pool: PgPool,
}

impl PgTaskStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply the bundled migrations
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("💾 STORAGE: disttask schema migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn task_exists(&self, task_id: TaskId) -> StorageResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM disttask_global_task WHERE id = $1)",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Compare-and-set inside the caller's transaction
    async fn cas_task(
        tx: &mut Transaction<'_, Postgres>,
        task: &Task,
        prev_state: TaskState,
    ) -> StorageResult<bool> {
        if !verify_task_state_transition(prev_state, task.state) {
            return Err(StorageError::InvalidTransition {
                from: prev_state,
                to: task.state,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE disttask_global_task
            SET state = $1, step = $2, error = $3, meta = $4, dispatcher_id = $5,
                state_update_time = now()
            WHERE id = $6 AND state = $7
            "#,
        )
        .bind(task.state.as_str())
        .bind(task.step)
        .bind(task.error.as_deref())
        .bind(&task.meta)
        .bind(task.dispatcher_id.as_deref())
        .bind(task.id)
        .bind(prev_state.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_subtask(
        tx: &mut Transaction<'_, Postgres>,
        subtask: &NewSubtask,
    ) -> StorageResult<SubtaskId> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO disttask_subtask
                (task_id, step, task_type, state, scheduler_id, meta, is_first_batch)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(subtask.task_id)
        .bind(subtask.step)
        .bind(&subtask.task_type)
        .bind(SubtaskState::Pending.as_str())
        .bind(&subtask.scheduler_id)
        .bind(&subtask.meta)
        .bind(subtask.is_first_batch)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn request_state(
        &self,
        task_id: TaskId,
        from: &[TaskState],
        to: TaskState,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE disttask_global_task
            SET state = $1, state_update_time = now()
            WHERE id = $2 AND state = ANY($3)
            "#,
        )
        .bind(to.as_str())
        .bind(task_id)
        .bind(state_names(from))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.task_exists(task_id).await? {
            return Err(StorageError::TaskNotFound(task_id));
        }
        Ok(false)
    }
}

#[async_trait]
impl TaskStorage for PgTaskStorage {
    async fn add_new_global_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u64,
        meta: Vec<u8>,
    ) -> StorageResult<TaskId> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO disttask_global_task (task_key, task_type, state, step, concurrency, meta)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (task_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(key)
        .bind(task_type)
        .bind(TaskState::Pending.as_str())
        .bind(crate::models::STEP_INIT)
        .bind(i64::try_from(concurrency).unwrap_or(i64::MAX))
        .bind(meta)
        .fetch_optional(&self.pool)
        .await?;

        let id = id.ok_or_else(|| StorageError::DuplicateKey(key.to_string()))?;
        debug!(task_id = id, key = key, task_type = task_type, "Added global task");
        Ok(id)
    }

    async fn get_global_task_by_id(&self, task_id: TaskId) -> StorageResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM disttask_global_task WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn get_global_tasks_in_states(&self, states: &[TaskState]) -> StorageResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM disttask_global_task WHERE state = ANY($1) ORDER BY id"
        ))
        .bind(state_names(states))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn cancel_global_task(&self, task_id: TaskId) -> StorageResult<bool> {
        self.request_state(task_id, CANCELLABLE_TASK_STATES, TaskState::Cancelling)
            .await
    }

    async fn pause_global_task(&self, task_id: TaskId) -> StorageResult<bool> {
        self.request_state(task_id, PAUSABLE_TASK_STATES, TaskState::Pausing)
            .await
    }

    async fn resume_global_task(&self, task_id: TaskId) -> StorageResult<bool> {
        self.request_state(task_id, &[TaskState::Paused], TaskState::Resuming)
            .await
    }

    async fn update_global_task(&self, task: &Task, prev_state: TaskState) -> StorageResult<bool> {
        self.update_task_and_add_subtasks(task, prev_state, Vec::new())
            .await
    }

    async fn update_task_and_add_subtasks(
        &self,
        task: &Task,
        prev_state: TaskState,
        subtasks: Vec<NewSubtask>,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        if !Self::cas_task(&mut tx, task, prev_state).await? {
            tx.rollback().await?;
            if !self.task_exists(task.id).await? {
                return Err(StorageError::TaskNotFound(task.id));
            }
            return Ok(false);
        }
        for subtask in &subtasks {
            Self::insert_subtask(&mut tx, subtask).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_global_task(&self, task_id: TaskId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM disttask_subtask WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM disttask_global_task WHERE id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_new_subtask(
        &self,
        task_id: TaskId,
        step: Step,
        scheduler_id: &str,
        meta: Vec<u8>,
        task_type: &str,
        is_first_batch: bool,
    ) -> StorageResult<SubtaskId> {
        let subtask = NewSubtask::new(task_id, step, task_type, scheduler_id, meta)
            .first_batch(is_first_batch);
        let mut tx = self.pool.begin().await?;
        let id = Self::insert_subtask(&mut tx, &subtask).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update_subtask_state_and_error(
        &self,
        subtask_id: SubtaskId,
        state: SubtaskState,
        error: Option<String>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE disttask_subtask
            SET state = $1, error = $2, state_update_time = now()
            WHERE id = $3
            "#,
        )
        .bind(state.as_str())
        .bind(error)
        .bind(subtask_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SubtaskNotFound(subtask_id));
        }
        Ok(())
    }

    async fn get_subtask_in_states_cnt(
        &self,
        task_id: TaskId,
        states: &[SubtaskState],
    ) -> StorageResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM disttask_subtask WHERE task_id = $1 AND state = ANY($2)",
        )
        .bind(task_id)
        .bind(state_names(states))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn get_step_subtask_in_states_cnt(
        &self,
        task_id: TaskId,
        step: Step,
        states: &[SubtaskState],
    ) -> StorageResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM disttask_subtask
            WHERE task_id = $1 AND step = $2 AND state = ANY($3)
            "#,
        )
        .bind(task_id)
        .bind(step)
        .bind(state_names(states))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn collect_subtask_failures(
        &self,
        task_id: TaskId,
        step: Step,
    ) -> StorageResult<Vec<SubtaskFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT id, state, error, retry_count FROM disttask_subtask
            WHERE task_id = $1 AND step = $2 AND state = ANY($3)
            ORDER BY id
            "#,
        )
        .bind(task_id)
        .bind(step)
        .bind(state_names(&[SubtaskState::Failed, SubtaskState::Canceled]))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                let retry_count: i32 = row.try_get("retry_count")?;
                Ok(SubtaskFailure {
                    subtask_id: row.try_get("id")?,
                    state: state.parse().map_err(StorageError::Corrupted)?,
                    error: row.try_get("error")?,
                    retry_count: retry_count.max(0) as u32,
                })
            })
            .collect()
    }

    async fn requeue_subtask(&self, subtask_id: SubtaskId) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE disttask_subtask
            SET state = $1, error = NULL, retry_count = retry_count + 1,
                state_update_time = now()
            WHERE id = $2 AND state = $3
            "#,
        )
        .bind(SubtaskState::Pending.as_str())
        .bind(subtask_id)
        .bind(SubtaskState::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_scheduler_ids_by_task_id(&self, task_id: TaskId) -> StorageResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT scheduler_id FROM disttask_subtask
            WHERE task_id = $1 AND scheduler_id <> ''
            ORDER BY scheduler_id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_subtask_metas(&self, task_id: TaskId, step: Step) -> StorageResult<Vec<Vec<u8>>> {
        let metas = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT meta FROM disttask_subtask WHERE task_id = $1 AND step = $2 ORDER BY id",
        )
        .bind(task_id)
        .bind(step)
        .fetch_all(&self.pool)
        .await?;
        Ok(metas)
    }

    async fn get_subtasks(&self, task_id: TaskId, step: Step) -> StorageResult<Vec<Subtask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM disttask_subtask \
             WHERE task_id = $1 AND step = $2 ORDER BY id"
        ))
        .bind(task_id)
        .bind(step)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subtask_from_row).collect()
    }

    async fn start_manager(&self, address: &str, role: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO disttask_framework_meta (address, role)
            VALUES ($1, $2)
            ON CONFLICT (address) DO UPDATE SET role = EXCLUDED.role, updated_at = now()
            "#,
        )
        .bind(address)
        .bind(role)
        .execute(&self.pool)
        .await?;
        info!(address = address, role = role, "💾 STORAGE: Registered node");
        Ok(())
    }
}

#[async_trait]
impl ClusterMembership for PgTaskStorage {
    async fn live_instances(&self) -> StorageResult<Vec<InstanceInfo>> {
        let addresses = sqlx::query_scalar::<_, String>(
            "SELECT address FROM disttask_framework_meta ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await?;

        addresses
            .iter()
            .map(|address| {
                InstanceInfo::from_exec_id(address).ok_or_else(|| {
                    StorageError::Corrupted(format!("invalid node address: {address}"))
                })
            })
            .collect()
    }
}
