use chrono::{Duration, Utc};

use scheduler_domain::{ExecuteState, JobState, RetryType, RunState, RunType, TriggerType};
use scheduler_testing_utils::{JobBuilder, TestHarness};

async fn add_job(harness: &TestHarness, builder: JobBuilder) -> i64 {
    harness.job_admin.add_job(builder.build()).await.unwrap()
}

#[tokio::test]
async fn test_schedule_trigger_cron_job() {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let job_id = add_job(&harness, JobBuilder::new().with_trigger(TriggerType::Cron, "0 0 * * * *")).await;
    let trigger_time = harness.job(job_id).await.next_trigger_time.unwrap();

    assert!(harness.orchestrator.schedule_trigger(job_id, trigger_time).await.unwrap());

    let job = harness.job(job_id).await;
    assert_eq!(job.last_trigger_time, Some(trigger_time));
    assert_eq!(job.next_trigger_time, Some(trigger_time + Duration::hours(1)));
    let instances = harness.instances_of(job_id).await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].run_type, RunType::Schedule);
    assert_eq!(instances[0].trigger_time, trigger_time);
    assert_eq!(harness.worker_rpc.dispatches().len(), 1);

    // 同一触发时间只能触发一次
    assert!(!harness.orchestrator.schedule_trigger(job_id, trigger_time).await.unwrap());
    assert_eq!(harness.instances_of(job_id).await.len(), 1);
}

#[tokio::test]
async fn test_schedule_trigger_skips_disabled_job() {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let next = Utc::now();
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_state(JobState::Disabled)
                .with_trigger_times(None, Some(next))
                .build(),
        )
        .await;

    assert!(!harness.orchestrator.schedule_trigger(job.job_id, next).await.unwrap());
    assert!(harness.instances_of(job.job_id).await.is_empty());
}

#[tokio::test]
async fn test_fixed_rate_renews_from_trigger_time() {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let job_id = add_job(&harness, JobBuilder::new().with_trigger(TriggerType::FixedRate, "60")).await;
    let trigger_time = harness.job(job_id).await.next_trigger_time.unwrap();

    assert!(harness.orchestrator.schedule_trigger(job_id, trigger_time).await.unwrap());
    // 实例结束前没有下次触发时间
    assert_eq!(harness.job(job_id).await.next_trigger_time, None);

    let instance_id = harness.instances_of(job_id).await[0].instance_id;
    harness.run_instance(instance_id, ExecuteState::Completed).await;

    assert_eq!(
        harness.job(job_id).await.next_trigger_time,
        Some(trigger_time + Duration::seconds(60))
    );
}

#[tokio::test]
async fn test_fixed_delay_renews_from_end_time() {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let job_id = add_job(&harness, JobBuilder::new().with_trigger(TriggerType::FixedDelay, "30")).await;
    let trigger_time = harness.job(job_id).await.next_trigger_time.unwrap();
    harness.orchestrator.schedule_trigger(job_id, trigger_time).await.unwrap();
    let instance_id = harness.instances_of(job_id).await[0].instance_id;

    harness.run_instance(instance_id, ExecuteState::ExecuteFailed).await;

    let end_time = harness.instance(instance_id).await.run_end_time.unwrap();
    assert_eq!(
        harness.job(job_id).await.next_trigger_time,
        Some(end_time + Duration::seconds(30))
    );
}

#[tokio::test]
async fn test_fixed_rate_renews_after_retry_chain() {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let job_id = add_job(
        &harness,
        JobBuilder::new()
            .with_trigger(TriggerType::FixedRate, "60")
            .with_retry(RetryType::Failed, 1, 0),
    )
    .await;
    let trigger_time = harness.job(job_id).await.next_trigger_time.unwrap();
    harness.orchestrator.schedule_trigger(job_id, trigger_time).await.unwrap();
    let first_id = harness.instances_of(job_id).await[0].instance_id;

    harness.run_instance(first_id, ExecuteState::ExecuteFailed).await;
    assert_eq!(harness.job(job_id).await.next_trigger_time, None);

    let retry = harness
        .instances_of(job_id)
        .await
        .into_iter()
        .find(|i| i.run_type == RunType::Retry)
        .unwrap();
    harness.run_instance(retry.instance_id, ExecuteState::Completed).await;

    assert_eq!(harness.instance(retry.instance_id).await.run_state, RunState::Completed);
    assert_eq!(
        harness.job(job_id).await.next_trigger_time,
        Some(trigger_time + Duration::seconds(60))
    );
}

#[tokio::test]
async fn test_manual_trigger_does_not_renew_fixed_job() {
    let harness = TestHarness::new(vec![TestHarness::worker("w1")]);
    let job_id = add_job(&harness, JobBuilder::new().with_trigger(TriggerType::FixedRate, "60")).await;
    let next = harness.job(job_id).await.next_trigger_time;

    let instance_id = harness.orchestrator.trigger_job(job_id).await.unwrap();
    harness.run_instance(instance_id, ExecuteState::Completed).await;

    assert_eq!(harness.job(job_id).await.next_trigger_time, next);
}
