use scheduler_domain::{ExecuteState, Operation, RetryType, RouteStrategy, RunState, RunType, Worker};
use scheduler_testing_utils::{JobBuilder, TestHarness, WorkerBuilder};

fn workers(count: usize) -> Vec<Worker> {
    (1..=count)
        .map(|i| WorkerBuilder::new(&format!("w{i}")).with_port(9000 + i as u16).build())
        .collect()
}

/// 第一个任务失败，其余任务完成
async fn fail_first_task(harness: &TestHarness, instance_id: i64) {
    let worker = harness.discovery.workers()[0].clone();
    for (i, task) in harness.tasks(instance_id).await.iter().enumerate() {
        let worker = task.worker.clone().unwrap_or_else(|| worker.clone());
        assert!(harness.start_task(task.task_id, &worker).await.success);
        let state = if i == 0 {
            ExecuteState::ExecuteFailed
        } else {
            ExecuteState::Completed
        };
        harness.finish_task(task.task_id, &worker, state).await;
    }
}

fn retry_of(instances: &[scheduler_domain::Instance], parent_retried_count: i32) -> &scheduler_domain::Instance {
    instances
        .iter()
        .find(|i| i.run_type == RunType::Retry && i.retried_count == parent_retried_count + 1)
        .unwrap()
}

#[tokio::test]
async fn test_retry_failed_tasks_until_limit() {
    let harness = TestHarness::new(workers(1));
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_retry(RetryType::Failed, 2, 0)
                .build(),
        )
        .await;
    harness
        .worker_rpc
        .set_split_result("TestExecutor", vec!["F1".to_string(), "F2".to_string()]);

    let first_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    fail_first_task(&harness, first_id).await;

    let first = harness.instance(first_id).await;
    assert_eq!(first.run_state, RunState::Canceled);
    assert!(first.retrying);

    let instances = harness.instances_of(job.job_id).await;
    assert_eq!(instances.len(), 2);
    let retry1 = retry_of(&instances, 0).clone();
    assert_eq!(retry1.parent_instance_id, Some(first_id));
    let retry1_tasks = harness.tasks(retry1.instance_id).await;
    assert_eq!(retry1_tasks.len(), 1);
    assert_eq!(retry1_tasks[0].task_param.as_deref(), Some("F1"));
    assert!(retry1_tasks[0].worker.is_none());
    assert!(harness
        .worker_rpc
        .dispatched_params()
        .iter()
        .any(|p| p.task_id == retry1_tasks[0].task_id));

    harness.run_instance(retry1.instance_id, ExecuteState::ExecuteFailed).await;

    let instances = harness.instances_of(job.job_id).await;
    assert_eq!(instances.len(), 3);
    let retry2 = retry_of(&instances, 1).clone();
    assert_eq!(retry2.retried_count, 2);
    assert_eq!(retry2.parent_instance_id, Some(first_id));
    assert_eq!(retry2.root_instance_id, Some(first_id));
    assert!(harness.instance(first_id).await.retrying);

    harness.run_instance(retry2.instance_id, ExecuteState::ExecuteFailed).await;

    // 达到最大重试次数
    assert_eq!(harness.instances_of(job.job_id).await.len(), 3);
    assert_eq!(harness.instance(retry2.instance_id).await.run_state, RunState::Canceled);
    assert!(!harness.instance(first_id).await.retrying);
}

#[tokio::test]
async fn test_retry_succeeds_and_clears_retrying() {
    let harness = TestHarness::new(workers(1));
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_retry(RetryType::Failed, 3, 0)
                .build(),
        )
        .await;

    let first_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    harness.run_instance(first_id, ExecuteState::ExecuteTimeout).await;
    let instances = harness.instances_of(job.job_id).await;
    let retry = retry_of(&instances, 0).clone();

    harness.run_instance(retry.instance_id, ExecuteState::Completed).await;

    assert_eq!(harness.instance(retry.instance_id).await.run_state, RunState::Completed);
    assert!(!harness.instance(first_id).await.retrying);
    assert_eq!(harness.instances_of(job.job_id).await.len(), 2);
}

#[tokio::test]
async fn test_retry_all_resplits_tasks() {
    let harness = TestHarness::new(workers(1));
    harness.worker_rpc.set_split_size(2);
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_retry(RetryType::All, 1, 0)
                .build(),
        )
        .await;

    let first_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    fail_first_task(&harness, first_id).await;

    let instances = harness.instances_of(job.job_id).await;
    let retry = retry_of(&instances, 0);
    let tasks = harness.tasks(retry.instance_id).await;
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.execute_state == ExecuteState::Waiting));
    assert_eq!(harness.worker_rpc.split_calls().len(), 2);
}

#[tokio::test]
async fn test_manual_cancel_is_not_retried() {
    let harness = TestHarness::new(workers(1));
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_retry(RetryType::All, 3, 0)
                .build(),
        )
        .await;
    let instance_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();

    harness
        .orchestrator
        .cancel_instance(instance_id, Operation::Cancel)
        .await
        .unwrap();

    assert_eq!(harness.instances_of(job.job_id).await.len(), 1);
}

#[tokio::test]
async fn test_delete_retry_chain() {
    let harness = TestHarness::new(workers(1));
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_retry(RetryType::Failed, 1, 0)
                .build(),
        )
        .await;
    let first_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    harness.run_instance(first_id, ExecuteState::ExecuteFailed).await;
    let instances = harness.instances_of(job.job_id).await;
    let retry = retry_of(&instances, 0).clone();

    // 重试进行中
    assert!(harness.orchestrator.delete_instance(first_id).await.is_err());

    harness.run_instance(retry.instance_id, ExecuteState::Completed).await;
    assert!(harness.orchestrator.delete_instance(retry.instance_id).await.is_err());

    harness.orchestrator.delete_instance(first_id).await.unwrap();
    assert!(harness.instances_of(job.job_id).await.is_empty());
    assert!(harness.snapshot().await.tasks.is_empty());
}

#[tokio::test]
async fn test_broadcast_aborts_tasks_of_dead_worker() {
    let harness = TestHarness::new(workers(3));
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_route_strategy(RouteStrategy::Broadcast)
                .build(),
        )
        .await;
    let instance_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    let tasks = harness.tasks(instance_id).await;
    assert_eq!(tasks.len(), 3);
    assert!(harness.worker_rpc.split_calls().is_empty());

    harness.orchestrator.pause_instance(instance_id).await.unwrap();
    let [w1, w2, w3] = <[Worker; 3]>::try_from(harness.discovery.workers()).unwrap();
    harness.discovery.remove(&w2);
    harness.worker_rpc.clear_dispatches();

    harness.orchestrator.resume_instance(instance_id).await.unwrap();

    let tasks = harness.tasks(instance_id).await;
    let pinned_to = |worker: &Worker| tasks.iter().find(|t| t.worker.as_ref() == Some(worker)).unwrap();
    assert_eq!(pinned_to(&w2).execute_state, ExecuteState::BroadcastAborted);
    assert_eq!(pinned_to(&w1).execute_state, ExecuteState::Waiting);

    let sent = harness.worker_rpc.dispatched_params();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|p| p.operation == Operation::Trigger));
    let targets: Vec<Worker> = sent.iter().filter_map(|p| p.worker.clone()).collect();
    assert!(targets.contains(&w1));
    assert!(targets.contains(&w3));
    assert_eq!(harness.instance(instance_id).await.run_state, RunState::Waiting);
}

#[tokio::test]
async fn test_broadcast_retry_keeps_worker() {
    let harness = TestHarness::new(workers(2));
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_route_strategy(RouteStrategy::Broadcast)
                .with_retry(RetryType::Failed, 1, 0)
                .build(),
        )
        .await;
    let first_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    let failed_worker = harness.tasks(first_id).await[0].worker.clone().unwrap();

    fail_first_task(&harness, first_id).await;

    let instances = harness.instances_of(job.job_id).await;
    let retry = retry_of(&instances, 0);
    let tasks = harness.tasks(retry.instance_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].worker.as_ref(), Some(&failed_worker));
    assert_eq!(tasks[0].task_no, 1);
}

#[tokio::test]
async fn test_broadcast_retry_without_alive_worker() {
    let harness = TestHarness::new(workers(2));
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_route_strategy(RouteStrategy::Broadcast)
                .with_retry(RetryType::Failed, 1, 0)
                .build(),
        )
        .await;
    let first_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    let tasks = harness.tasks(first_id).await;
    let w1 = tasks[0].worker.clone().unwrap();
    let w2 = tasks[1].worker.clone().unwrap();

    harness.start_task(tasks[0].task_id, &w1).await;
    harness.start_task(tasks[1].task_id, &w2).await;
    harness.finish_task(tasks[1].task_id, &w2, ExecuteState::Completed).await;
    harness.discovery.remove(&w1);
    harness.finish_task(tasks[0].task_id, &w1, ExecuteState::ExecuteFailed).await;

    let first = harness.instance(first_id).await;
    assert_eq!(first.run_state, RunState::Canceled);
    assert!(!first.retrying);
    assert_eq!(harness.instances_of(job.job_id).await.len(), 1);
}
