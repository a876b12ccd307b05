//! End-to-end dispatch scenarios against the in-memory storage.

mod common;

use common::*;
use disttask_core::constants::CANCELED_ERROR;
use disttask_core::dispatcher::{BaseDispatcher, Dispatcher, DispatcherContext, Extension};
use disttask_core::models::{InstanceInfo, STEP_INIT, STEP_REVERT};
use disttask_core::storage::{MemoryTaskStorage, TaskStorage};
use disttask_core::{SubtaskState, TaskState};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Succeed,
    SubtaskFailed,
    TaskCanceled,
    SubtaskCanceled,
}

async fn check_dispatch(task_cnt: usize, scenario: Scenario) {
    let concurrency = if task_cnt == 1 { 1 } else { 4 };
    let cluster = TestCluster::new(concurrency);
    cluster.register_number_example();
    cluster
        .manager
        .register_node(":4000", "background")
        .await
        .unwrap();
    cluster.manager.start();

    let mut task_ids = Vec::with_capacity(task_cnt);
    for i in 0..task_cnt {
        task_ids.push(cluster.submit(&i.to_string()).await);
    }

    // first batch
    assert!(cluster.wait_for_running_cnt(task_cnt).await);
    for &task_id in &task_ids {
        assert!(cluster.wait_for_state(task_id, TaskState::Running).await);
        let pending = cluster
            .storage
            .get_subtask_in_states_cnt(task_id, &[SubtaskState::Pending])
            .await
            .unwrap();
        assert_eq!(pending, SUBTASK_CNT as u64);
        assert_eq!(
            cluster.storage.get_scheduler_ids_by_task_id(task_id).await.unwrap(),
            vec![":4000"]
        );
    }

    // concurrency cap
    if task_cnt == 1 {
        let extra = cluster.submit("extra").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cluster.manager.get_running_task_cnt(), 1);
        assert_eq!(cluster.task(extra).await.state, TaskState::Pending);

        cluster.storage.delete_global_task(extra).await.unwrap();
        cluster.manager.del_running_task(extra);
        assert_eq!(cluster.manager.get_running_task_cnt(), 1);
    }

    if scenario == Scenario::Succeed {
        for &task_id in &task_ids {
            for subtask in cluster.storage.get_subtasks(task_id, STEP_INIT).await.unwrap() {
                cluster
                    .storage
                    .update_subtask_state_and_error(subtask.id, SubtaskState::Succeed, None)
                    .await
                    .unwrap();
            }
        }
        for &task_id in &task_ids {
            assert!(cluster.wait_for_state(task_id, TaskState::Succeed).await);
            assert!(cluster.task(task_id).await.error.is_none());
        }
        assert!(cluster.wait_for_running_cnt(0).await);
        cluster.manager.stop().await;
        return;
    }

    for &task_id in &task_ids {
        match scenario {
            Scenario::TaskCanceled => {
                assert!(cluster.storage.cancel_global_task(task_id).await.unwrap());
            }
            Scenario::SubtaskFailed | Scenario::SubtaskCanceled => {
                let state = if scenario == Scenario::SubtaskFailed {
                    SubtaskState::Failed
                } else {
                    SubtaskState::Canceled
                };
                let first = &cluster.storage.get_subtasks(task_id, STEP_INIT).await.unwrap()[0];
                cluster
                    .storage
                    .update_subtask_state_and_error(first.id, state, None)
                    .await
                    .unwrap();
            }
            Scenario::Succeed => unreachable!(),
        }
    }

    for &task_id in &task_ids {
        assert!(cluster.wait_for_state(task_id, TaskState::Reverting).await);
        let storage = cluster.storage.clone();
        assert!(
            eventually(WAIT_TIMEOUT, WAIT_TICK, || {
                let storage = storage.clone();
                async move { !storage.get_subtasks(task_id, STEP_REVERT).await.unwrap().is_empty() }
            })
            .await
        );
    }

    for &task_id in &task_ids {
        let revert = cluster.storage.get_subtasks(task_id, STEP_REVERT).await.unwrap();
        assert_eq!(revert.len(), 1);
        assert_eq!(revert[0].scheduler_id, ":4000");
        for subtask in revert {
            cluster
                .storage
                .update_subtask_state_and_error(subtask.id, SubtaskState::Reverted, None)
                .await
                .unwrap();
        }
    }

    for &task_id in &task_ids {
        assert!(cluster.wait_for_state(task_id, TaskState::Reverted).await);
        let task = cluster.task(task_id).await;
        assert_eq!(task.step, STEP_INIT);
        if scenario == Scenario::TaskCanceled {
            assert_eq!(task.error.as_deref(), Some(CANCELED_ERROR));
        } else {
            assert!(task.error.is_some());
        }
    }
    assert!(cluster.wait_for_running_cnt(0).await);
    cluster.manager.stop().await;
}

#[tokio::test]
async fn test_simple() {
    check_dispatch(1, Scenario::Succeed).await;
}

#[tokio::test]
async fn test_simple_err_stage() {
    check_dispatch(1, Scenario::SubtaskFailed).await;
}

#[tokio::test]
async fn test_simple_cancel() {
    check_dispatch(1, Scenario::TaskCanceled).await;
}

#[tokio::test]
async fn test_simple_subtask_cancel() {
    check_dispatch(1, Scenario::SubtaskCanceled).await;
}

#[tokio::test]
async fn test_parallel() {
    check_dispatch(3, Scenario::Succeed).await;
}

#[tokio::test]
async fn test_parallel_err_stage() {
    check_dispatch(3, Scenario::SubtaskFailed).await;
}

#[tokio::test]
async fn test_parallel_cancel() {
    check_dispatch(3, Scenario::TaskCanceled).await;
}

#[tokio::test]
async fn test_parallel_subtask_cancel() {
    check_dispatch(3, Scenario::SubtaskCanceled).await;
}

#[tokio::test]
async fn test_get_all_scheduler_ids() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let task_id = storage
        .add_new_global_task("instances", EXAMPLE_TASK_TYPE, 1, Vec::new())
        .await
        .unwrap();
    let task = storage.get_global_task_by_id(task_id).await.unwrap().unwrap();

    let extension = Arc::new(NoopExtension::default());
    let (_shutdown_tx, shutdown) = tokio::sync::watch::channel(false);
    let ctx = DispatcherContext {
        storage: storage.clone(),
        membership: storage.clone(),
        server_id: "127.0.0.1:4000".to_string(),
        config: fast_config(1),
        shutdown,
    };
    let dispatcher = BaseDispatcher::new(ctx, &task, extension.clone() as Arc<dyn Extension>);

    // no subtasks
    assert!(dispatcher.get_all_scheduler_ids(&task).await.unwrap().is_empty());

    // live nodes alone establish no affinity
    let server_ids = [
        "10.123.124.10:32457",
        "[ABCD:EF01:2345:6789:ABCD:EF01:2345:6789]:65535",
    ];
    extension.set_instances(vec![
        InstanceInfo::new("ddl_id_1", "10.123.124.10", 32457),
        InstanceInfo::new("ddl_id_2", "ABCD:EF01:2345:6789:ABCD:EF01:2345:6789", 65535),
    ]);
    assert!(dispatcher.get_all_scheduler_ids(&task).await.unwrap().is_empty());

    storage
        .add_new_subtask(task_id, STEP_INIT, server_ids[1], Vec::new(), EXAMPLE_TASK_TYPE, true)
        .await
        .unwrap();
    assert_eq!(
        dispatcher.get_all_scheduler_ids(&task).await.unwrap(),
        vec![server_ids[1]]
    );

    storage
        .add_new_subtask(task_id, STEP_INIT, server_ids[0], Vec::new(), EXAMPLE_TASK_TYPE, true)
        .await
        .unwrap();
    let mut ids = dispatcher.get_all_scheduler_ids(&task).await.unwrap();
    ids.sort();
    let mut expected = server_ids.map(String::from).to_vec();
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_noop_task_succeeds_without_subtasks() {
    let cluster = TestCluster::new(2);
    cluster.manager.register_dispatcher_factory(
        EXAMPLE_TASK_TYPE,
        BaseDispatcher::factory(|_task| Arc::new(NoopExtension::default()) as Arc<dyn Extension>),
    );
    cluster.manager.start();

    let task_id = cluster.submit("noop").await;
    assert!(cluster.wait_for_state(task_id, TaskState::Succeed).await);
    assert_eq!(cluster.storage.subtask_count(), 0);
    assert!(cluster.wait_for_running_cnt(0).await);
    cluster.manager.stop().await;
}

#[tokio::test]
async fn test_pause_releases_slot_and_resume_finishes() {
    let cluster = TestCluster::new(1);
    cluster.register_number_example();
    cluster.manager.start();

    let task_id = cluster.submit("pausable").await;
    assert!(cluster.wait_for_state(task_id, TaskState::Running).await);

    assert!(cluster.storage.pause_global_task(task_id).await.unwrap());
    assert!(cluster.wait_for_state(task_id, TaskState::Paused).await);
    assert!(cluster.wait_for_running_cnt(0).await);

    for subtask in cluster.storage.get_subtasks(task_id, STEP_INIT).await.unwrap() {
        cluster
            .storage
            .update_subtask_state_and_error(subtask.id, SubtaskState::Succeed, None)
            .await
            .unwrap();
    }
    assert!(cluster.storage.resume_global_task(task_id).await.unwrap());
    assert!(cluster.wait_for_state(task_id, TaskState::Succeed).await);
    cluster.manager.stop().await;
}
