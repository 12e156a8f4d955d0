use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, SupervisorConfig};
use scheduler_domain::{
    parse_depend_parents, DagExpression, DependRepository, IdGenerator, Job, JobDepend, JobRepository,
    JobState, TransactionManager, TriggerType, WorkerRpc,
};

use crate::tx_scope::TxScope;

/// 作业管理
pub struct JobAdmin {
    tx_manager: Arc<dyn TransactionManager>,
    id_generator: Arc<dyn IdGenerator>,
    worker_rpc: Arc<dyn WorkerRpc>,
    config: SupervisorConfig,
}

impl JobAdmin {
    pub fn new(
        tx_manager: Arc<dyn TransactionManager>,
        id_generator: Arc<dyn IdGenerator>,
        worker_rpc: Arc<dyn WorkerRpc>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            tx_manager,
            id_generator,
            worker_rpc,
            config,
        }
    }

    pub async fn get_job(&self, job_id: i64) -> SchedulerResult<Option<Job>> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = scope.get_job(job_id).await;
        scope.rollback().await?;
        result
    }

    /// 新增作业，返回作业ID
    ///
    /// `job_id`、触发时间与版本号由这里生成，调用方传入的值被忽略。
    pub async fn add_job(&self, job: Job) -> SchedulerResult<i64> {
        self.validate(&job)?;
        if job.is_workflow() {
            DagExpression::parse(&job.job_executor)?;
        }
        job.trigger_type.validate(&job.trigger_value)?;
        self.worker_rpc.verify_job(&job).await?;

        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.add_job_in(&mut scope, job).await;
        complete(scope, result).await
    }

    async fn add_job_in(&self, scope: &mut TxScope, mut job: Job) -> SchedulerResult<i64> {
        if scope.exists_job_name(&job.group, &job.job_name).await? {
            return Err(SchedulerError::conflict(format!(
                "作业名称已存在: {}, {}",
                job.group, job.job_name
            )));
        }

        let now = Utc::now();
        job.job_id = self.id_generator.generate_id();
        job.version = 1;
        job.created_at = now;
        job.updated_at = now;
        job.last_trigger_time = None;
        job.next_trigger_time = match job.trigger_type {
            TriggerType::Depend => {
                let parents = self.save_depends(scope, &job).await?;
                job.trigger_value = parents
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                None
            }
            trigger_type if trigger_type.is_fixed() => Some(now),
            trigger_type => {
                let next = trigger_type.compute_next_trigger_time(&job.trigger_value, now)?;
                if next.is_none() {
                    return Err(SchedulerError::InvalidTrigger {
                        trigger_type: trigger_type.to_string(),
                        value: job.trigger_value.clone(),
                        message: "没有下次触发时间".to_string(),
                    });
                }
                next
            }
        };

        scope.insert_job(&job).await?;
        info!(
            "新增作业: {}, {}, {}, {:?}",
            job.job_id, job.group, job.job_name, job.next_trigger_time
        );
        Ok(job.job_id)
    }

    fn validate(&self, job: &Job) -> SchedulerResult<()> {
        if job.group.trim().is_empty() {
            return Err(SchedulerError::invalid_job_config("作业分组不能为空"));
        }
        if job.job_name.trim().is_empty() {
            return Err(SchedulerError::invalid_job_config("作业名称不能为空"));
        }
        if job.job_executor.trim().is_empty() {
            return Err(SchedulerError::invalid_job_config("作业执行器不能为空"));
        }
        let max = self.config.maximum_job_retry_count;
        if job.retry_count < 0 || job.retry_count > max {
            return Err(SchedulerError::invalid_job_config(format!(
                "重试次数必须在0到{}之间: {}",
                max, job.retry_count
            )));
        }
        if job.retry_interval_ms < 0 {
            return Err(SchedulerError::invalid_job_config("重试间隔不能小于0"));
        }
        Ok(())
    }

    /// 校验并保存依赖，返回父作业ID
    async fn save_depends(&self, scope: &mut TxScope, job: &Job) -> SchedulerResult<Vec<i64>> {
        let parents = parse_depend_parents(&job.trigger_value)?;
        let parent_jobs = scope.find_jobs(&parents).await?;
        for parent_id in &parents {
            let parent = parent_jobs
                .iter()
                .find(|p| p.job_id == *parent_id)
                .ok_or_else(|| SchedulerError::job_not_found(*parent_id))?;
            if parent.group != job.group {
                return Err(SchedulerError::invalid_job_config(format!(
                    "依赖的作业不在同一分组: {}, {}",
                    parent.job_id, parent.group
                )));
            }
        }
        self.check_circular_depends(scope, job.job_id, &parents).await?;

        let depends: Vec<JobDepend> = parents
            .iter()
            .enumerate()
            .map(|(i, parent_job_id)| JobDepend {
                parent_job_id: *parent_job_id,
                child_job_id: job.job_id,
                sequence: i as i32 + 1,
            })
            .collect();
        scope.insert_depends(&depends).await?;
        Ok(parents)
    }

    /// 沿父作业向上检查，不能依赖自身且层级不超过上限
    async fn check_circular_depends(&self, scope: &mut TxScope, job_id: i64, parents: &[i64]) -> SchedulerResult<()> {
        let max = self.config.maximum_job_depends_depth;
        let mut current = parents.to_vec();
        let mut depth = 1;
        loop {
            if current.contains(&job_id) {
                return Err(SchedulerError::CircularDependency { job_id });
            }
            if depth > max {
                return Err(SchedulerError::DependencyTooDeep { depth, max });
            }
            let mut ancestors: Vec<i64> = scope
                .find_by_child_job_ids(&current)
                .await?
                .into_iter()
                .map(|d| d.parent_job_id)
                .collect();
            if ancestors.is_empty() {
                return Ok(());
            }
            ancestors.sort_unstable();
            ancestors.dedup();
            current = ancestors;
            depth += 1;
        }
    }

    /// 启用或停用作业，状态未变化时返回false
    pub async fn change_job_state(&self, job_id: i64, to_state: JobState) -> SchedulerResult<bool> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.change_job_state_in(&mut scope, job_id, to_state).await;
        complete(scope, result).await
    }

    async fn change_job_state_in(&self, scope: &mut TxScope, job_id: i64, to_state: JobState) -> SchedulerResult<bool> {
        let job = scope
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_id))?;
        if job.job_state == to_state {
            return Ok(false);
        }
        if !scope.update_job_state(job_id, to_state, job.job_state).await? {
            warn!("作业状态已变更: {}, {}", job_id, to_state);
            return Ok(false);
        }

        if to_state == JobState::Enabled && job.trigger_type != TriggerType::Depend {
            let now = Utc::now();
            let next = if job.trigger_type.is_fixed() {
                let period = job.trigger_type.fixed_period(&job.trigger_value)?;
                Some(
                    job.last_trigger_time
                        .and_then(|last| last.checked_add_signed(period))
                        .map_or(now, |next| next.max(now)),
                )
            } else {
                job.trigger_type
                    .compute_next_trigger_time(&job.trigger_value, now)?
            };
            if !scope
                .update_next_trigger_time(job_id, job.next_trigger_time, job.last_trigger_time, next)
                .await?
            {
                warn!("启用作业时更新触发时间冲突: {}", job_id);
            }
        }
        info!("修改作业状态: {}, {} -> {}", job_id, job.job_state, to_state);
        Ok(true)
    }

    /// 删除已停用的作业及其依赖
    pub async fn delete_job(&self, job_id: i64) -> SchedulerResult<bool> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.delete_job_in(&mut scope, job_id).await;
        complete(scope, result).await
    }

    async fn delete_job_in(&self, scope: &mut TxScope, job_id: i64) -> SchedulerResult<bool> {
        let job = scope
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_id))?;
        if job.is_enabled() {
            return Err(SchedulerError::illegal_state(format!("请先停用作业: {job_id}")));
        }
        if !scope.delete_job(job_id).await? {
            warn!("删除作业冲突: {}", job_id);
            return Ok(false);
        }
        let depends = scope.delete_depends_by_job_id(job_id).await?;
        info!("删除作业: {}, {}, {}", job_id, job.job_name, depends);
        Ok(true)
    }
}

/// 结果成功时提交事务，否则回滚
async fn complete<T>(scope: TxScope, result: SchedulerResult<T>) -> SchedulerResult<T> {
    match result {
        Ok(value) => {
            scope.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = scope.rollback().await {
                error!("事务回滚失败: {}, {}", e, rollback_error);
            }
            Err(e)
        }
    }
}
