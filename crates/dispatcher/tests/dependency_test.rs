use scheduler_domain::{ExecuteState, JobState, RunState, RunType, TriggerType};
use scheduler_testing_utils::{JobBuilder, TestHarness};

async fn parent_and_child() -> (TestHarness, i64, i64) {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let parent = harness
        .insert_job(JobBuilder::new().with_id(1).with_name("parent").build())
        .await;
    let child_id = harness
        .job_admin
        .add_job(
            JobBuilder::new()
                .with_name("child")
                .with_executor("ChildExecutor")
                .with_trigger(TriggerType::Depend, "1")
                .build(),
        )
        .await
        .unwrap();
    (harness, parent.job_id, child_id)
}

#[tokio::test]
async fn test_completed_parent_triggers_child() {
    let (harness, parent_id, child_id) = parent_and_child().await;
    let parent_instance = harness.orchestrator.trigger_job(parent_id).await.unwrap();
    harness.worker_rpc.clear_dispatches();

    harness.run_instance(parent_instance, ExecuteState::Completed).await;

    let children = harness.instances_of(child_id).await;
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.run_type, RunType::Depend);
    assert_eq!(child.run_state, RunState::Waiting);
    assert_eq!(child.parent_instance_id, Some(parent_instance));
    assert_eq!(child.root_instance_id, Some(parent_instance));

    let sent = harness.worker_rpc.dispatched_params();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].instance_id, child.instance_id);
    assert_eq!(sent[0].job_id, child_id);
}

#[tokio::test]
async fn test_failed_parent_does_not_trigger_child() {
    let (harness, parent_id, child_id) = parent_and_child().await;
    let parent_instance = harness.orchestrator.trigger_job(parent_id).await.unwrap();

    harness.run_instance(parent_instance, ExecuteState::ExecuteFailed).await;

    assert!(harness.instances_of(child_id).await.is_empty());
}

#[tokio::test]
async fn test_disabled_child_is_skipped() {
    let (harness, parent_id, child_id) = parent_and_child().await;
    assert!(harness
        .job_admin
        .change_job_state(child_id, JobState::Disabled)
        .await
        .unwrap());
    let parent_instance = harness.orchestrator.trigger_job(parent_id).await.unwrap();

    harness.run_instance(parent_instance, ExecuteState::Completed).await;

    assert_eq!(harness.instance(parent_instance).await.run_state, RunState::Completed);
    assert!(harness.instances_of(child_id).await.is_empty());
}

#[tokio::test]
async fn test_child_split_failure_keeps_parent_completed() {
    let (harness, parent_id, child_id) = parent_and_child().await;
    harness.worker_rpc.fail_split("ChildExecutor");
    let parent_instance = harness.orchestrator.trigger_job(parent_id).await.unwrap();

    harness.run_instance(parent_instance, ExecuteState::Completed).await;

    assert_eq!(harness.instance(parent_instance).await.run_state, RunState::Completed);
    assert!(harness.instances_of(child_id).await.is_empty());
}

#[tokio::test]
async fn test_dependency_chain_keeps_root() {
    let (harness, parent_id, child_id) = parent_and_child().await;
    let grandchild_id = harness
        .job_admin
        .add_job(
            JobBuilder::new()
                .with_name("grandchild")
                .with_trigger(TriggerType::Depend, &child_id.to_string())
                .build(),
        )
        .await
        .unwrap();
    let parent_instance = harness.orchestrator.trigger_job(parent_id).await.unwrap();
    harness.run_instance(parent_instance, ExecuteState::Completed).await;
    let child = harness.instances_of(child_id).await.remove(0);

    harness.run_instance(child.instance_id, ExecuteState::Completed).await;

    let grandchild = harness.instances_of(grandchild_id).await.remove(0);
    assert_eq!(grandchild.parent_instance_id, Some(child.instance_id));
    assert_eq!(grandchild.root_instance_id, Some(parent_instance));
}

#[tokio::test]
async fn test_completed_workflow_triggers_child() {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let workflow = harness
        .insert_job(JobBuilder::new().with_id(1).with_name("flow").with_workflow("A").build())
        .await;
    let child_id = harness
        .job_admin
        .add_job(
            JobBuilder::new()
                .with_name("after-flow")
                .with_trigger(TriggerType::Depend, "1")
                .build(),
        )
        .await
        .unwrap();
    let lead_id = harness.orchestrator.trigger_job(workflow.job_id).await.unwrap();
    let node = harness.node_instance(lead_id, "A").await;

    harness.run_instance(node.instance_id, ExecuteState::Completed).await;

    assert_eq!(harness.instance(lead_id).await.run_state, RunState::Completed);
    let children = harness.instances_of(child_id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].parent_instance_id, Some(lead_id));
}
