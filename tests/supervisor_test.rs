use std::io::Write;
use std::sync::Arc;

use scheduler::domain::{
    ExecuteState, InstanceRepository, Operation, RunState, StartTaskParam, StopTaskParam, TaskRepository,
    TransactionManager,
};
use scheduler::Supervisor;
use scheduler_core::AppConfig;
use scheduler_testing_utils::{JobBuilder, MockWorkerRpc, WorkerBuilder};
use tempfile::NamedTempFile;

async fn supervisor(worker_rpc: &MockWorkerRpc) -> Supervisor {
    Supervisor::from_config(AppConfig::default(), Arc::new(worker_rpc.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_run_job_on_sqlite() {
    let worker_rpc = MockWorkerRpc::new();
    let supervisor = supervisor(&worker_rpc).await;
    let worker = WorkerBuilder::new("w1").build();
    supervisor.discovery().register(worker.clone());

    let job_id = supervisor.job_admin().add_job(JobBuilder::new().build()).await.unwrap();
    let instance_id = supervisor.orchestrator().trigger_job(job_id).await.unwrap();
    assert_eq!(worker_rpc.dispatches().len(), 1);

    let tasks = {
        let mut tx = supervisor.tx_manager().begin().await.unwrap();
        let tasks = tx.find_tasks(instance_id).await.unwrap();
        tx.rollback().await.unwrap();
        tasks
    };
    assert_eq!(tasks.len(), 1);
    let task_id = tasks[0].task_id;

    let started = supervisor
        .orchestrator()
        .start_task(StartTaskParam {
            task_id,
            instance_id,
            workflow_instance_id: None,
            worker: worker.clone(),
            start_request_id: "req-1".to_string(),
        })
        .await
        .unwrap();
    assert!(started.success);

    let stopped = supervisor
        .orchestrator()
        .stop_task(StopTaskParam {
            task_id,
            instance_id,
            workflow_instance_id: None,
            worker,
            operation: Operation::Trigger,
            to_state: ExecuteState::Completed,
            error_msg: None,
        })
        .await
        .unwrap();
    assert!(stopped);

    let mut tx = supervisor.tx_manager().begin().await.unwrap();
    let instance = tx.get_instance(instance_id).await.unwrap().unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(instance.run_state, RunState::Completed);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_from_config_rejects_invalid_config() {
    let mut config = AppConfig::default();
    config.supervisor.instance_lock_shards = 0;

    let result = Supervisor::from_config(config, Arc::new(MockWorkerRpc::new())).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [supervisor]
        task_dispatch_failed_count_threshold = 5

        [dispatch]
        default_token = "secret"
        "#
    )
    .unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let supervisor = Supervisor::load(Some(&path), Arc::new(MockWorkerRpc::new()))
        .await
        .unwrap();

    assert_eq!(supervisor.config().supervisor.task_dispatch_failed_count_threshold, 5);
    assert_eq!(supervisor.config().dispatch.default_token.as_deref(), Some("secret"));
}
