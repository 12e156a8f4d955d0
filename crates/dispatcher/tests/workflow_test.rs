use scheduler_core::SchedulerError;
use scheduler_domain::{DagNode, ExecuteState, Operation, RetryType, RunState, Worker};
use scheduler_testing_utils::{JobBuilder, TestHarness, WorkerBuilder};

const DIAMOND: &str = "A -> B; A -> C; B -> D; C -> D";

fn workers() -> Vec<Worker> {
    vec![WorkerBuilder::new("w1").build(), WorkerBuilder::new("w2").with_port(8081).build()]
}

async fn workflow_harness(expression: &str) -> (TestHarness, i64) {
    let harness = TestHarness::new(workers());
    let job = harness
        .insert_job(JobBuilder::new().with_id(1).with_workflow(expression).build())
        .await;
    (harness, job.job_id)
}

fn edge_state(edges: &[scheduler_domain::WorkflowEdge], node: &str) -> RunState {
    edges
        .iter()
        .find(|e| e.cur_node == DagNode::node(node))
        .map(|e| e.run_state)
        .unwrap()
}

#[tokio::test]
async fn test_workflow_runs_to_completion() {
    let (harness, job_id) = workflow_harness("A -> B").await;

    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();

    let lead = harness.instance(lead_id).await;
    assert!(lead.is_workflow_lead());
    assert_eq!(lead.run_state, RunState::Running);
    assert!(harness.tasks(lead_id).await.is_empty());
    assert_eq!(harness.edges(lead_id).await.len(), 3);

    let a = harness.node_instance(lead_id, "A").await;
    assert_eq!(a.workflow_instance_id, Some(lead_id));
    assert_eq!(a.parent_instance_id, Some(lead_id));
    let split = harness.worker_rpc.split_calls();
    assert_eq!(split.len(), 1);
    assert_eq!(split[0].job_executor, "A");

    harness.run_instance(a.instance_id, ExecuteState::Completed).await;
    let edges = harness.edges(lead_id).await;
    assert_eq!(edge_state(&edges, "A"), RunState::Completed);
    assert_eq!(edge_state(&edges, "B"), RunState::Running);

    let b = harness.node_instance(lead_id, "B").await;
    assert_eq!(b.parent_instance_id, Some(a.instance_id));
    harness.run_instance(b.instance_id, ExecuteState::Completed).await;

    let lead = harness.instance(lead_id).await;
    assert_eq!(lead.run_state, RunState::Completed);
    assert!(harness
        .edges(lead_id)
        .await
        .iter()
        .all(|e| e.run_state == RunState::Completed));
    // 主实例和两个节点实例
    assert_eq!(harness.instances_of(job_id).await.len(), 3);
}

#[tokio::test]
async fn test_diamond_failure_cancels_downstream() {
    let (harness, job_id) = workflow_harness(DIAMOND).await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();

    let a = harness.node_instance(lead_id, "A").await;
    harness.run_instance(a.instance_id, ExecuteState::ExecuteFailed).await;

    let edges = harness.edges(lead_id).await;
    assert_eq!(edge_state(&edges, "A"), RunState::Canceled);
    for node in ["B", "C", "D"] {
        assert_eq!(edge_state(&edges, node), RunState::Canceled);
        assert!(edges
            .iter()
            .filter(|e| e.cur_node == DagNode::node(node))
            .all(|e| e.instance_id.is_none()));
    }
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Canceled);
    // 没有为B、C、D创建实例
    assert_eq!(harness.instances_of(job_id).await.len(), 2);
}

#[tokio::test]
async fn test_branch_failure_waits_for_running_branch() {
    let (harness, job_id) = workflow_harness(DIAMOND).await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;
    harness.run_instance(a.instance_id, ExecuteState::Completed).await;

    let b = harness.node_instance(lead_id, "B").await;
    let c = harness.node_instance(lead_id, "C").await;
    harness.run_instance(b.instance_id, ExecuteState::ExecuteFailed).await;

    let edges = harness.edges(lead_id).await;
    assert_eq!(edge_state(&edges, "B"), RunState::Canceled);
    assert_eq!(edge_state(&edges, "C"), RunState::Running);
    assert_eq!(edge_state(&edges, "D"), RunState::Canceled);
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Running);

    harness.run_instance(c.instance_id, ExecuteState::Completed).await;

    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Canceled);
    assert_eq!(harness.instances_of(job_id).await.len(), 4);
}

#[tokio::test]
async fn test_diamond_joins_on_latest_predecessor() {
    let (harness, job_id) = workflow_harness(DIAMOND).await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;
    harness.run_instance(a.instance_id, ExecuteState::Completed).await;

    let b = harness.node_instance(lead_id, "B").await;
    let c = harness.node_instance(lead_id, "C").await;
    harness.run_instance(b.instance_id, ExecuteState::Completed).await;
    // 只有一个前置节点完成
    assert_eq!(edge_state(&harness.edges(lead_id).await, "D"), RunState::Waiting);

    harness.run_instance(c.instance_id, ExecuteState::Completed).await;
    let d = harness.node_instance(lead_id, "D").await;
    assert_eq!(d.parent_instance_id, Some(c.instance_id));
    assert_eq!(d.root_instance_id, Some(lead_id));

    harness.run_instance(d.instance_id, ExecuteState::Completed).await;
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Completed);
}

#[tokio::test]
async fn test_workflow_split_failure_rolls_back() {
    let (harness, job_id) = workflow_harness("A -> B").await;
    harness.worker_rpc.fail_split("A");

    let result = harness.orchestrator.trigger_job(job_id).await;

    assert!(matches!(result, Err(SchedulerError::SplitJob(_))));
    assert!(harness.instances_of(job_id).await.is_empty());
    assert!(harness.snapshot().await.edges.is_empty());
    assert!(harness.worker_rpc.dispatches().is_empty());
}

#[tokio::test]
async fn test_node_split_failure_cancels_workflow() {
    let (harness, job_id) = workflow_harness("A -> B").await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;
    harness.worker_rpc.fail_split("B");
    harness.worker_rpc.clear_dispatches();

    harness.run_instance(a.instance_id, ExecuteState::Completed).await;

    let edges = harness.edges(lead_id).await;
    assert_eq!(edge_state(&edges, "A"), RunState::Completed);
    assert_eq!(edge_state(&edges, "B"), RunState::Canceled);
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Canceled);
    assert!(harness.worker_rpc.dispatches().is_empty());
}

#[tokio::test]
async fn test_pause_and_resume_workflow() {
    let (harness, job_id) = workflow_harness("A -> B").await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;
    let task = harness.tasks(a.instance_id).await.remove(0);
    let worker = harness.discovery.workers()[0].clone();
    harness.start_task(task.task_id, &worker).await;

    // 节点实例不能单独暂停
    let node_pause = harness.orchestrator.pause_instance(a.instance_id).await;
    assert!(matches!(node_pause, Err(SchedulerError::IllegalState(_))));

    assert!(harness.orchestrator.pause_instance(lead_id).await.unwrap());
    assert_eq!(edge_state(&harness.edges(lead_id).await, "B"), RunState::Paused);
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Running);

    harness
        .stop_task(task.task_id, &worker, Operation::Pause, ExecuteState::Paused)
        .await;
    assert_eq!(harness.instance(a.instance_id).await.run_state, RunState::Paused);
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Paused);

    assert!(harness.orchestrator.resume_instance(lead_id).await.unwrap());
    let edges = harness.edges(lead_id).await;
    assert_eq!(edge_state(&edges, "A"), RunState::Running);
    assert_eq!(edge_state(&edges, "B"), RunState::Waiting);
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Running);
    assert_eq!(harness.instance(a.instance_id).await.run_state, RunState::Waiting);

    harness.run_instance(a.instance_id, ExecuteState::Completed).await;
    let b = harness.node_instance(lead_id, "B").await;
    harness.run_instance(b.instance_id, ExecuteState::Completed).await;
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Completed);
}

#[tokio::test]
async fn test_node_pause_waits_for_parallel_branch() {
    let (harness, job_id) = workflow_harness("A; E").await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;
    let e = harness.node_instance(lead_id, "E").await;
    let a_task = harness.tasks(a.instance_id).await.remove(0);
    let e_task = harness.tasks(e.instance_id).await.remove(0);
    let worker = harness.discovery.workers()[0].clone();
    harness.start_task(a_task.task_id, &worker).await;
    harness.start_task(e_task.task_id, &worker).await;
    harness.worker_rpc.clear_dispatches();

    // Worker暂停了A，仍在执行的E需要一起暂停
    harness
        .stop_task(a_task.task_id, &worker, Operation::Pause, ExecuteState::Paused)
        .await;
    assert_eq!(harness.instance(a.instance_id).await.run_state, RunState::Paused);
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Running);
    let sent: Vec<(i64, Operation)> = harness
        .worker_rpc
        .dispatched_params()
        .iter()
        .map(|p| (p.task_id, p.operation))
        .collect();
    assert_eq!(sent, vec![(e_task.task_id, Operation::Pause)]);

    harness
        .stop_task(e_task.task_id, &worker, Operation::Pause, ExecuteState::Paused)
        .await;
    assert_eq!(harness.instance(e.instance_id).await.run_state, RunState::Paused);
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Paused);

    assert!(harness.orchestrator.resume_instance(lead_id).await.unwrap());
    harness.run_instance(a.instance_id, ExecuteState::Completed).await;
    harness.run_instance(e.instance_id, ExecuteState::Completed).await;
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Completed);
}

#[tokio::test]
async fn test_cancel_workflow_cancels_nodes() {
    let (harness, job_id) = workflow_harness("A -> B").await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;

    assert!(harness
        .orchestrator
        .cancel_instance(lead_id, Operation::Cancel)
        .await
        .unwrap());

    assert_eq!(harness.instance(a.instance_id).await.run_state, RunState::Canceled);
    assert_eq!(
        harness.tasks(a.instance_id).await[0].execute_state,
        ExecuteState::ManualCanceled
    );
    assert!(harness
        .edges(lead_id)
        .await
        .iter()
        .all(|e| e.run_state == RunState::Canceled));
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Canceled);
}

#[tokio::test]
async fn test_failed_node_is_retried_in_place() {
    let harness = TestHarness::new(workers());
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_workflow("A -> B")
                .with_retry(RetryType::Failed, 1, 0)
                .build(),
        )
        .await;
    let lead_id = harness.orchestrator.trigger_job(job.job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;

    harness.run_instance(a.instance_id, ExecuteState::ExecuteFailed).await;

    let retry = harness.node_instance(lead_id, "A").await;
    assert_ne!(retry.instance_id, a.instance_id);
    assert_eq!(retry.retried_count, 1);
    assert_eq!(retry.parent_instance_id, Some(a.instance_id));
    assert_eq!(retry.workflow_node, Some(DagNode::node("A")));
    assert!(harness.instance(a.instance_id).await.retrying);
    assert_eq!(edge_state(&harness.edges(lead_id).await, "A"), RunState::Running);

    harness.run_instance(retry.instance_id, ExecuteState::Completed).await;
    assert!(!harness.instance(a.instance_id).await.retrying);
    let b = harness.node_instance(lead_id, "B").await;
    harness.run_instance(b.instance_id, ExecuteState::Completed).await;

    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Completed);
}

#[tokio::test]
async fn test_delete_workflow_instance() {
    let (harness, job_id) = workflow_harness("A -> B").await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    let a = harness.node_instance(lead_id, "A").await;
    harness.run_instance(a.instance_id, ExecuteState::ExecuteFailed).await;
    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Canceled);

    let node_delete = harness.orchestrator.delete_instance(a.instance_id).await;
    assert!(matches!(node_delete, Err(SchedulerError::IllegalState(_))));

    harness.orchestrator.delete_instance(lead_id).await.unwrap();

    let store = harness.snapshot().await;
    assert!(store.instances.is_empty());
    assert!(store.tasks.is_empty());
    assert!(store.edges.is_empty());
}

#[tokio::test]
async fn test_change_state_rejects_workflow() {
    let (harness, job_id) = workflow_harness("A").await;
    let lead_id = harness.orchestrator.trigger_job(job_id).await.unwrap();

    let result = harness
        .orchestrator
        .change_instance_state(lead_id, ExecuteState::ManualCanceled)
        .await;

    assert!(matches!(result, Err(SchedulerError::IllegalState(_))));
}
