use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    Instance, InstanceRepository, Job, JobRepository, RetryType, RunType, Task, TaskRepository,
    WorkflowRepository,
};

use crate::dispatcher::Dispatcher;
use crate::instance_creator::InstanceCreator;
use crate::tx_scope::{AfterCommit, DispatchRequest, TxScope};

/// 失败实例的重试
pub struct RetryPlanner {
    creator: Arc<InstanceCreator>,
    dispatcher: Arc<Dispatcher>,
}

impl RetryPlanner {
    pub fn new(creator: Arc<InstanceCreator>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { creator, dispatcher }
    }

    /// 为失败的实例创建重试实例，返回重试实例ID
    ///
    /// 不可重试或没有需要重试的任务时返回None。重试实例的写入在保存点内完成，
    /// 失败时回滚到保存点，不影响调用方已完成的状态变更。
    pub async fn retry(&self, scope: &mut TxScope, failed: &Instance) -> SchedulerResult<Option<i64>> {
        let job = scope
            .get_job(failed.job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(failed.job_id))?;
        if !job.retryable(failed.run_state, failed.retried_count) {
            return Ok(None);
        }

        let retried_count = failed.retried_count + 1;
        let trigger_time = job.compute_retry_trigger_time(retried_count, Utc::now());
        let retry_id = self.creator.generate_id();
        let mut retry = Instance::derive(
            failed,
            retry_id,
            failed.workflow_instance_id,
            job.job_id,
            RunType::Retry,
            trigger_time,
            retried_count,
        );
        retry.workflow_node = failed.workflow_node.clone();

        let tasks = self.retry_tasks(scope, &job, failed, retry_id).await?;
        if tasks.is_empty() {
            // 广播任务的Worker全部下线
            warn!("重试实例没有可执行的任务: {}, {}", job.job_id, failed.instance_id);
            return Ok(None);
        }

        let savepoint = scope.savepoint().await?;
        match self.persist(scope, failed, &retry, &tasks).await {
            Ok(()) => {
                scope.release(savepoint).await?;
            }
            Err(e) => {
                scope.rollback_to(savepoint).await?;
                return Err(SchedulerError::illegal_state(format!(
                    "创建重试实例失败: {}, {}",
                    failed.instance_id, e
                )));
            }
        }

        metrics::counter!("scheduler_retry_instances_created_total").increment(1);
        info!(
            "创建重试实例: {} -> {}, 第{}次, {}",
            failed.instance_id, retry_id, retried_count, trigger_time
        );
        scope.after_commit(AfterCommit::Dispatch(DispatchRequest::new(job, retry, tasks)));
        Ok(Some(retry_id))
    }

    async fn persist(
        &self,
        scope: &mut TxScope,
        failed: &Instance,
        retry: &Instance,
        tasks: &[Task],
    ) -> SchedulerResult<()> {
        if let (Some(workflow_instance_id), Some(node)) =
            (failed.workflow_instance_id, failed.workflow_node.as_ref())
        {
            // 工作流的边指向新的重试实例
            let row = scope
                .replace_node_instance(workflow_instance_id, node, failed.instance_id, retry.instance_id)
                .await?;
            if row == 0 {
                return Err(SchedulerError::illegal_state(format!(
                    "重试实例更新工作流节点失败: {}, {}",
                    workflow_instance_id, node
                )));
            }
        }
        scope.insert_instance(retry).await?;
        scope.insert_tasks(tasks).await
    }

    async fn retry_tasks(
        &self,
        scope: &mut TxScope,
        job: &Job,
        failed: &Instance,
        retry_id: i64,
    ) -> SchedulerResult<Vec<Task>> {
        match job.retry_type {
            RetryType::All => {
                let executor = match failed.workflow_node.as_ref() {
                    Some(node) => node.name(),
                    None => job.job_executor.as_str(),
                };
                self.creator.split_tasks(job, executor, retry_id).await
            }
            RetryType::Failed => {
                let broadcast = job.route_strategy.is_broadcast();
                Ok(scope
                    .find_tasks(failed.instance_id)
                    .await?
                    .into_iter()
                    .filter(|t| t.execute_state.is_failure())
                    // 广播任务只能在原Worker上重试
                    .filter(|t| !broadcast || self.dispatcher.is_alive(t.worker.as_ref()))
                    .map(|t| {
                        let worker = if broadcast { t.worker } else { None };
                        Task::new(
                            self.creator.generate_id(),
                            retry_id,
                            t.task_no,
                            t.task_count,
                            t.task_param,
                            worker,
                        )
                    })
                    .collect())
            }
            RetryType::None => Ok(Vec::new()),
        }
    }
}
