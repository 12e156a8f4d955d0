use chrono::{Duration, Utc};

use scheduler_core::{SchedulerError, SupervisorConfig};
use scheduler_domain::{JobState, RetryType, TriggerType};
use scheduler_testing_utils::{JobBuilder, TestHarness, FIRST_ID};

fn harness() -> TestHarness {
    TestHarness::new(vec![TestHarness::worker("w1")])
}

#[tokio::test]
async fn test_add_cron_job() {
    let harness = harness();

    let job_id = harness
        .job_admin
        .add_job(JobBuilder::new().with_id(77).build())
        .await
        .unwrap();

    assert_eq!(job_id, FIRST_ID);
    let job = harness.job(job_id).await;
    assert_eq!(job.version, 1);
    assert!(job.last_trigger_time.is_none());
    assert!(job.next_trigger_time.unwrap() > Utc::now());
    assert_eq!(harness.worker_rpc.verify_calls().len(), 1);
    assert_eq!(harness.job_admin.get_job(job_id).await.unwrap(), Some(job));
}

#[tokio::test]
async fn test_add_job_rejects_duplicate_name() {
    let harness = harness();
    harness.job_admin.add_job(JobBuilder::new().build()).await.unwrap();

    let result = harness.job_admin.add_job(JobBuilder::new().build()).await;

    assert!(matches!(result, Err(SchedulerError::Conflict(_))));
    assert_eq!(harness.snapshot().await.jobs.len(), 1);
}

#[tokio::test]
async fn test_add_job_validation() {
    let harness = harness();
    let cases = vec![
        JobBuilder::new().with_group(" ").build(),
        JobBuilder::new().with_name("").build(),
        JobBuilder::new().with_executor("").build(),
        JobBuilder::new().with_retry(RetryType::All, 6, 0).build(),
        JobBuilder::new().with_retry(RetryType::All, 1, -1).build(),
        JobBuilder::new().with_workflow("A -> B -> A").build(),
        JobBuilder::new().with_trigger(TriggerType::Cron, "not a cron").build(),
        JobBuilder::new().with_trigger(TriggerType::FixedRate, "0").build(),
        JobBuilder::new().with_trigger(TriggerType::Depend, "x").build(),
    ];

    for job in cases {
        let err = harness.job_admin.add_job(job).await.unwrap_err();
        assert!(err.is_configuration_error(), "unexpected error: {err}");
    }
    assert!(harness.snapshot().await.jobs.is_empty());
    assert!(harness.worker_rpc.verify_calls().is_empty());
}

#[tokio::test]
async fn test_add_once_job_in_past() {
    let harness = harness();
    let past = (Utc::now() - Duration::days(1)).to_rfc3339();

    let result = harness
        .job_admin
        .add_job(JobBuilder::new().with_trigger(TriggerType::Once, &past).build())
        .await;

    assert!(matches!(result, Err(SchedulerError::InvalidTrigger { .. })));
}

#[tokio::test]
async fn test_add_job_rejected_by_worker() {
    let harness = harness();
    harness.worker_rpc.fail_verify("执行器不存在");

    let result = harness.job_admin.add_job(JobBuilder::new().build()).await;

    assert!(matches!(result, Err(SchedulerError::InvalidJobConfig(_))));
    assert!(harness.snapshot().await.jobs.is_empty());
}

#[tokio::test]
async fn test_add_depend_job() {
    let harness = harness();
    let a = harness.insert_job(JobBuilder::new().with_id(1).with_name("a").build()).await;
    let b = harness.insert_job(JobBuilder::new().with_id(2).with_name("b").build()).await;

    let child_id = harness
        .job_admin
        .add_job(
            JobBuilder::new()
                .with_name("child")
                .with_trigger(TriggerType::Depend, " 2, 1, 2 ")
                .build(),
        )
        .await
        .unwrap();

    let child = harness.job(child_id).await;
    assert_eq!(child.trigger_value, "2,1");
    assert!(child.next_trigger_time.is_none());
    let depends = harness.snapshot().await.depends;
    assert_eq!(depends.len(), 2);
    let sequence_of = |parent: i64| {
        depends
            .iter()
            .find(|d| d.parent_job_id == parent && d.child_job_id == child_id)
            .map(|d| d.sequence)
    };
    assert_eq!(sequence_of(b.job_id), Some(1));
    assert_eq!(sequence_of(a.job_id), Some(2));
}

#[tokio::test]
async fn test_add_depend_job_checks_parents() {
    let harness = harness();
    harness
        .insert_job(JobBuilder::new().with_id(1).with_name("other").with_group("other").build())
        .await;

    let missing = harness
        .job_admin
        .add_job(JobBuilder::new().with_trigger(TriggerType::Depend, "404").build())
        .await;
    assert!(matches!(missing, Err(SchedulerError::JobNotFound { id: 404 })));

    let other_group = harness
        .job_admin
        .add_job(JobBuilder::new().with_trigger(TriggerType::Depend, "1").build())
        .await;
    assert!(matches!(other_group, Err(SchedulerError::InvalidJobConfig(_))));
    assert!(harness.snapshot().await.depends.is_empty());
}

#[tokio::test]
async fn test_add_depend_job_too_deep() {
    let config = SupervisorConfig {
        maximum_job_depends_depth: 2,
        ..SupervisorConfig::default()
    };
    let harness = TestHarness::with_config(vec![TestHarness::worker("w1")], config);
    harness.insert_job(JobBuilder::new().with_id(1).with_name("a").build()).await;
    let depend_on = |name: &str, parent: i64| {
        JobBuilder::new()
            .with_name(name)
            .with_trigger(TriggerType::Depend, &parent.to_string())
            .build()
    };

    let b = harness.job_admin.add_job(depend_on("b", 1)).await.unwrap();
    let c = harness.job_admin.add_job(depend_on("c", b)).await.unwrap();
    let result = harness.job_admin.add_job(depend_on("d", c)).await;

    assert!(matches!(
        result,
        Err(SchedulerError::DependencyTooDeep { depth: 3, max: 2 })
    ));
    assert_eq!(harness.snapshot().await.depends.len(), 2);
}

#[tokio::test]
async fn test_change_job_state() {
    let harness = harness();
    let job_id = harness
        .job_admin
        .add_job(JobBuilder::new().with_trigger(TriggerType::FixedRate, "60").build())
        .await
        .unwrap();

    assert!(harness.job_admin.change_job_state(job_id, JobState::Disabled).await.unwrap());
    assert!(!harness.job_admin.change_job_state(job_id, JobState::Disabled).await.unwrap());
    assert_eq!(harness.job(job_id).await.job_state, JobState::Disabled);

    let before = Utc::now();
    assert!(harness.job_admin.change_job_state(job_id, JobState::Enabled).await.unwrap());
    let job = harness.job(job_id).await;
    assert!(job.is_enabled());
    assert!(job.next_trigger_time.unwrap() >= before);

    let missing = harness.job_admin.change_job_state(404, JobState::Enabled).await;
    assert!(matches!(missing, Err(SchedulerError::JobNotFound { id: 404 })));
}

#[tokio::test]
async fn test_enable_fixed_job_continues_from_last_trigger() {
    let harness = harness();
    let last = Utc::now() + Duration::minutes(5);
    let job = harness
        .insert_job(
            JobBuilder::new()
                .with_id(1)
                .with_state(JobState::Disabled)
                .with_trigger(TriggerType::FixedDelay, "60")
                .with_trigger_times(Some(last), None)
                .build(),
        )
        .await;

    harness.job_admin.change_job_state(job.job_id, JobState::Enabled).await.unwrap();

    assert_eq!(
        harness.job(job.job_id).await.next_trigger_time,
        Some(last + Duration::seconds(60))
    );
}

#[tokio::test]
async fn test_delete_job() {
    let harness = harness();
    harness.insert_job(JobBuilder::new().with_id(1).with_name("parent").build()).await;
    let child_id = harness
        .job_admin
        .add_job(
            JobBuilder::new()
                .with_name("child")
                .with_trigger(TriggerType::Depend, "1")
                .build(),
        )
        .await
        .unwrap();

    let enabled = harness.job_admin.delete_job(child_id).await;
    assert!(matches!(enabled, Err(SchedulerError::IllegalState(_))));

    harness.job_admin.change_job_state(child_id, JobState::Disabled).await.unwrap();
    assert!(harness.job_admin.delete_job(child_id).await.unwrap());

    let store = harness.snapshot().await;
    assert!(!store.jobs.contains_key(&child_id));
    assert!(store.depends.is_empty());

    let missing = harness.job_admin.delete_job(child_id).await;
    assert!(matches!(missing, Err(SchedulerError::JobNotFound { .. })));
}
