//! 实例状态机
//!
//! 所有修改实例/任务状态的操作都在一个存储事务内完成：先获取进程内实例锁，
//! 再在事务中锁定实例行。向Worker投递指令的动作在事务提交、释放锁之后执行。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, SupervisorConfig};
use scheduler_domain::{
    DagNode, ExecuteState, ExecuteTaskParam, IdGenerator, Instance, InstanceRepository, Job,
    JobRepository, Operation, ResolvedRunState, RunState, RunStateResolver, RunType,
    StartTaskParam, StartTaskResult, StopTaskParam, SupervisorTokenProvider, Task,
    TaskRepository, TransactionManager, TriggerType, Worker, WorkerDiscovery, WorkerRpc,
    WorkflowRepository,
};

use crate::dependency_resolver::DependencyResolver;
use crate::dispatcher::Dispatcher;
use crate::instance_creator::InstanceCreator;
use crate::lock_pool::LockPool;
use crate::retry_planner::RetryPlanner;
use crate::tx_scope::{AfterCommit, DispatchRequest, TxScope};
use crate::workflow_graph::WorkflowGraph;

/// 一次操作内按需加载的作业
struct LazyJob {
    job_id: i64,
    job: Option<Job>,
}

impl LazyJob {
    fn new(job_id: i64) -> Self {
        Self { job_id, job: None }
    }

    async fn get(&mut self, scope: &mut TxScope) -> SchedulerResult<&Job> {
        if self.job.is_none() {
            let job = scope
                .get_job(self.job_id)
                .await?
                .ok_or_else(|| SchedulerError::job_not_found(self.job_id))?;
            self.job = Some(job);
        }
        self.job
            .as_ref()
            .ok_or_else(|| SchedulerError::job_not_found(self.job_id))
    }
}

pub struct InstanceOrchestrator {
    tx_manager: Arc<dyn TransactionManager>,
    lock_pool: LockPool,
    dispatcher: Arc<Dispatcher>,
    creator: Arc<InstanceCreator>,
    retry_planner: RetryPlanner,
    dependency_resolver: DependencyResolver,
    config: SupervisorConfig,
}

impl InstanceOrchestrator {
    pub fn new(
        tx_manager: Arc<dyn TransactionManager>,
        id_generator: Arc<dyn IdGenerator>,
        discovery: Arc<dyn WorkerDiscovery>,
        worker_rpc: Arc<dyn WorkerRpc>,
        token_provider: Arc<dyn SupervisorTokenProvider>,
        config: SupervisorConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            discovery.clone(),
            worker_rpc.clone(),
            token_provider.clone(),
        ));
        let creator = Arc::new(InstanceCreator::new(
            id_generator,
            discovery,
            worker_rpc,
            token_provider,
            config.clone(),
        ));
        Self {
            tx_manager,
            lock_pool: LockPool::new(config.instance_lock_shards),
            retry_planner: RetryPlanner::new(creator.clone(), dispatcher.clone()),
            dependency_resolver: DependencyResolver::new(creator.clone()),
            dispatcher,
            creator,
            config,
        }
    }

    // ------------------------------------------------------------------
    // 触发

    /// 手动触发作业，返回实例ID
    pub async fn trigger_job(&self, job_id: i64) -> SchedulerResult<i64> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.trigger_job_in(&mut scope, job_id).await;
        self.complete(None, scope, result).await
    }

    async fn trigger_job_in(&self, scope: &mut TxScope, job_id: i64) -> SchedulerResult<i64> {
        let job = required_job(scope, job_id).await?;
        let instance = self
            .creator
            .create_instance(scope, &job, RunType::Manual, Utc::now(), None)
            .await?;
        info!("手动触发作业: {}, {}", job_id, instance.instance_id);
        Ok(instance.instance_id)
    }

    /// 扫描到期的作业后触发
    ///
    /// 以 `trigger_time` 为条件推进作业的下次触发时间，推进失败说明已被其它节点触发。
    pub async fn schedule_trigger(&self, job_id: i64, trigger_time: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.schedule_trigger_in(&mut scope, job_id, trigger_time).await;
        self.complete(None, scope, result).await
    }

    async fn schedule_trigger_in(
        &self,
        scope: &mut TxScope,
        job_id: i64,
        trigger_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let job = required_job(scope, job_id).await?;
        if !job.is_enabled() {
            debug!("作业已停用，跳过触发: {}", job_id);
            return Ok(false);
        }

        // 固定频率/延迟作业在实例结束后再计算下次触发时间
        let next_trigger_time = if job.trigger_type.is_fixed() {
            None
        } else {
            job.trigger_type
                .compute_next_trigger_time(&job.trigger_value, trigger_time)?
        };
        let updated = scope
            .update_next_trigger_time(job_id, Some(trigger_time), Some(trigger_time), next_trigger_time)
            .await?;
        if !updated {
            warn!("作业触发时间已变更，放弃本次触发: {}, {}", job_id, trigger_time);
            return Ok(false);
        }

        let instance = self
            .creator
            .create_instance(scope, &job, RunType::Schedule, trigger_time, None)
            .await?;
        info!(
            "调度触发作业: {}, {}, 下次触发 {:?}",
            job_id, instance.instance_id, next_trigger_time
        );
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Worker上报

    pub async fn start_task(&self, param: StartTaskParam) -> SchedulerResult<StartTaskResult> {
        let guard = self
            .lock_pool
            .lock(param.workflow_instance_id.unwrap_or(param.instance_id))
            .await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.start_task_locked(&mut scope, &param).await;
        self.complete(Some(guard), scope, result).await
    }

    async fn start_task_locked(&self, scope: &mut TxScope, param: &StartTaskParam) -> SchedulerResult<StartTaskResult> {
        let instance = lock_instance(scope, param.instance_id, param.workflow_instance_id).await?;
        if instance.is_workflow_lead() {
            return Ok(StartTaskResult::failure(param.task_id, "工作流主实例不能启动任务"));
        }

        let task = scope
            .get_task(param.task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(param.task_id))?;
        if task.instance_id != instance.instance_id {
            return Ok(StartTaskResult::failure(param.task_id, "任务不属于该实例"));
        }

        let now = Utc::now();
        let instance_started = scope.start_instance(instance.instance_id, now).await?;
        if !instance_started && instance.run_state != RunState::Running {
            return Ok(StartTaskResult::failure(
                param.task_id,
                format!("实例状态不可启动任务: {}", instance.run_state),
            ));
        }

        if scope
            .start_task(param.task_id, &param.worker, &param.start_request_id, now)
            .await?
        {
            info!("task trace [{}] starting: {}", param.task_id, param.worker);
            return Ok(StartTaskResult::success(&task));
        }
        if scope
            .check_start_idempotent(param.task_id, &param.worker, &param.start_request_id)
            .await?
        {
            info!("task trace [{}] start idempotent: {}", param.task_id, param.start_request_id);
            return Ok(StartTaskResult::success(&task));
        }
        if instance_started {
            // 回滚实例的启动
            return Err(SchedulerError::illegal_state(format!(
                "启动任务冲突: {}, {}",
                param.task_id, task.execute_state
            )));
        }
        warn!("task trace [{}] start conflict: {}", param.task_id, task.execute_state);
        Ok(StartTaskResult::failure(
            param.task_id,
            format!("任务状态不可启动: {}", task.execute_state),
        ))
    }

    /// Worker停止任务：完成、失败、暂停或关闭时回退
    pub async fn stop_task(&self, param: StopTaskParam) -> SchedulerResult<bool> {
        let guard = self
            .lock_pool
            .lock(param.workflow_instance_id.unwrap_or(param.instance_id))
            .await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.stop_task_locked(&mut scope, &param).await;
        self.complete(Some(guard), scope, result).await
    }

    async fn stop_task_locked(&self, scope: &mut TxScope, param: &StopTaskParam) -> SchedulerResult<bool> {
        match param.to_state {
            ExecuteState::Executing => {
                return Err(SchedulerError::illegal_state(format!(
                    "任务不能停止为执行中: {}",
                    param.task_id
                )));
            }
            ExecuteState::Waiting if param.operation != Operation::ShutdownResume => {
                return Err(SchedulerError::illegal_state(format!(
                    "只有关闭恢复可以回退任务: {}, {}",
                    param.task_id, param.operation
                )));
            }
            _ => {}
        }

        let instance = lock_instance(scope, param.instance_id, param.workflow_instance_id).await?;
        if instance.is_workflow_lead() {
            return Err(SchedulerError::illegal_state(format!(
                "工作流主实例没有任务: {}",
                instance.instance_id
            )));
        }
        if instance.is_terminal() {
            warn!(
                "task trace [{}] stop on terminated instance: {}, {}",
                param.task_id, instance.instance_id, instance.run_state
            );
            return Ok(false);
        }

        let now = Utc::now();
        let end_time = param.to_state.is_terminal().then_some(now);
        let stopped = scope
            .terminate_task(
                param.task_id,
                Some(&param.worker),
                param.to_state,
                ExecuteState::Executing,
                end_time,
                param.error_msg.as_deref(),
            )
            .await?;
        if !stopped {
            warn!("task trace [{}] stop conflict: {}", param.task_id, param.to_state);
            return Ok(false);
        }
        info!("task trace [{}] stopped: {}, {}", param.task_id, param.operation, param.to_state);

        if param.to_state == ExecuteState::Waiting {
            let tasks = scope.find_tasks(instance.instance_id).await?;
            if tasks.iter().all(Task::is_waiting)
                && !scope
                    .update_instance_state(instance.instance_id, RunState::Waiting, &[RunState::Running])
                    .await?
            {
                return Err(SchedulerError::illegal_state(format!(
                    "回退实例状态失败: {}",
                    instance.instance_id
                )));
            }
            let next_scan_time = now + Duration::milliseconds(self.config.shutdown_task_delay_resume_ms);
            scope
                .update_next_scan_time(instance.instance_id, next_scan_time)
                .await?;
            return Ok(true);
        }

        self.settle_instance(scope, instance, param.operation).await?;
        Ok(true)
    }

    /// 保存任务快照
    pub async fn savepoint_task(&self, task_id: i64, worker: &Worker, execute_snapshot: &str) -> SchedulerResult<bool> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = scope.savepoint_task(task_id, worker, execute_snapshot).await;
        self.complete(None, scope, result).await
    }

    // ------------------------------------------------------------------
    // 管理操作

    /// 暂停实例，工作流需传入主实例ID
    pub async fn pause_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        let guard = self.lock_pool.lock(instance_id).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = match lock_lead(&mut scope, instance_id).await {
            Ok(instance) => self.pause(&mut scope, instance).await,
            Err(e) => Err(e),
        };
        self.complete(Some(guard), scope, result).await
    }

    /// 取消实例，`operation` 必须是取消类操作
    pub async fn cancel_instance(&self, instance_id: i64, operation: Operation) -> SchedulerResult<bool> {
        if !operation.is_cancel() {
            return Err(SchedulerError::illegal_state(format!("不是取消操作: {operation}")));
        }
        let guard = self.lock_pool.lock(instance_id).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = match lock_lead(&mut scope, instance_id).await {
            Ok(instance) => self.cancel(&mut scope, instance, operation).await,
            Err(e) => Err(e),
        };
        self.complete(Some(guard), scope, result).await
    }

    pub async fn resume_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        let guard = self.lock_pool.lock(instance_id).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = match lock_lead(&mut scope, instance_id).await {
            Ok(instance) => self.resume(&mut scope, instance).await,
            Err(e) => Err(e),
        };
        self.complete(Some(guard), scope, result).await
    }

    /// 强制修改非工作流实例及其全部任务的状态
    pub async fn change_instance_state(&self, instance_id: i64, to_state: ExecuteState) -> SchedulerResult<()> {
        let guard = self.lock_pool.lock(instance_id).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self
            .change_instance_state_locked(&mut scope, instance_id, to_state)
            .await;
        self.complete(Some(guard), scope, result).await
    }

    async fn change_instance_state_locked(
        &self,
        scope: &mut TxScope,
        instance_id: i64,
        to_state: ExecuteState,
    ) -> SchedulerResult<()> {
        if to_state == ExecuteState::Executing {
            return Err(SchedulerError::illegal_state("不能强制修改为执行中"));
        }
        let instance = scope
            .lock_instance(instance_id)
            .await?
            .ok_or_else(|| SchedulerError::instance_not_found(instance_id))?;
        if instance.is_workflow() {
            return Err(SchedulerError::illegal_state(format!(
                "不支持修改工作流实例状态: {instance_id}"
            )));
        }

        let from = instance.run_state;
        let to = to_state.run_state();
        if from == RunState::Running || from == to {
            return Err(SchedulerError::illegal_state(format!(
                "实例状态不可修改: {instance_id}, {from} -> {to}"
            )));
        }
        if !scope.update_instance_state(instance_id, to, &[from]).await? {
            return Err(SchedulerError::illegal_state(format!(
                "修改实例状态冲突: {instance_id}, {from} -> {to}"
            )));
        }
        let rows = scope.force_change_tasks_state(instance_id, to_state).await?;

        if to_state == ExecuteState::Waiting {
            let job = required_job(scope, instance.job_id).await?;
            let tasks = scope.find_tasks(instance_id).await?;
            let mut instance = instance;
            instance.run_state = to;
            scope.after_commit(AfterCommit::Dispatch(DispatchRequest::new(job, instance, tasks)));
        }
        info!("强制修改实例状态: {}, {} -> {}, {}", instance_id, from, to, rows);
        Ok(())
    }

    /// 删除已终止的实例，工作流需传入主实例ID
    pub async fn delete_instance(&self, instance_id: i64) -> SchedulerResult<()> {
        let guard = self.lock_pool.lock(instance_id).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.delete_instance_locked(&mut scope, instance_id).await;
        self.complete(Some(guard), scope, result).await
    }

    async fn delete_instance_locked(&self, scope: &mut TxScope, instance_id: i64) -> SchedulerResult<()> {
        let instance = lock_lead(scope, instance_id).await?;
        if !instance.is_terminal() {
            return Err(SchedulerError::illegal_state(format!(
                "只能删除已终止的实例: {}, {}",
                instance_id, instance.run_state
            )));
        }

        if instance.is_workflow_lead() {
            for node in scope.find_workflow_nodes(instance_id).await? {
                scope.delete_tasks(node.instance_id).await?;
                scope.delete_instance(node.instance_id).await?;
            }
            scope.delete_instance(instance_id).await?;
            scope.delete_edges(instance_id).await?;
        } else {
            if instance.retrying || instance.is_retry() {
                return Err(SchedulerError::illegal_state(format!(
                    "重试链上的实例不能单独删除: {instance_id}"
                )));
            }
            scope.delete_tasks(instance_id).await?;
            if !scope.delete_instance(instance_id).await? {
                return Err(SchedulerError::illegal_state(format!("删除实例失败: {instance_id}")));
            }
            for child in scope.find_retry_children(instance_id).await? {
                scope.delete_tasks(child.instance_id).await?;
                scope.delete_instance(child.instance_id).await?;
            }
        }
        info!("删除实例: {}", instance_id);
        Ok(())
    }

    /// 清理没有存活任务的僵尸实例
    pub async fn purge_instance(&self, instance_id: i64, workflow_instance_id: Option<i64>) -> SchedulerResult<bool> {
        let guard = self
            .lock_pool
            .lock(workflow_instance_id.unwrap_or(instance_id))
            .await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self
            .purge_instance_locked(&mut scope, instance_id, workflow_instance_id)
            .await;
        self.complete(Some(guard), scope, result).await
    }

    async fn purge_instance_locked(
        &self,
        scope: &mut TxScope,
        instance_id: i64,
        workflow_instance_id: Option<i64>,
    ) -> SchedulerResult<bool> {
        let mut instance = lock_instance(scope, instance_id, workflow_instance_id).await?;
        if instance.is_workflow_lead() {
            return Err(SchedulerError::illegal_state(format!(
                "不能清理工作流主实例: {instance_id}"
            )));
        }
        if !instance.run_state.is_pausable() {
            return Ok(false);
        }

        let tasks = scope.find_tasks(instance_id).await?;
        let alive = tasks.iter().any(|t| {
            t.is_waiting() || (t.is_executing() && self.dispatcher.is_alive(t.worker.as_ref()))
        });
        if alive {
            warn!("实例存在存活的任务，不能清理: {}", instance_id);
            return Ok(false);
        }

        let now = Utc::now();
        let (run_state, end_time) = match RunStateResolver::resolve(&tasks, now) {
            Some(ResolvedRunState::Terminal { state, end_time }) => (state, end_time),
            _ => (RunState::Canceled, now),
        };
        if !scope
            .terminate_instance(instance_id, run_state, RunState::PAUSABLE, end_time)
            .await?
        {
            return Err(SchedulerError::illegal_state(format!("清理实例失败: {instance_id}")));
        }

        for task in tasks.iter().filter(|t| !t.execute_state.is_terminal()) {
            let worker = if task.is_executing() { task.worker.as_ref() } else { None };
            if scope
                .terminate_task(
                    task.task_id,
                    worker,
                    ExecuteState::ExecuteAborted,
                    task.execute_state,
                    Some(now),
                    None,
                )
                .await?
            {
                metrics::counter!("scheduler_tasks_aborted_total", "reason" => "purge").increment(1);
            }
        }

        instance.mark_terminated(run_state, end_time);
        record_terminated(run_state);
        warn!("清理实例: {}, {}", instance_id, run_state);
        self.process_terminated_instance(scope, &instance).await?;
        Ok(true)
    }

    /// 重新分发Worker上已丢失的等待任务
    pub async fn redispatch_instance(&self, instance_id: i64, workflow_instance_id: Option<i64>) -> SchedulerResult<bool> {
        let guard = self
            .lock_pool
            .lock(workflow_instance_id.unwrap_or(instance_id))
            .await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self
            .redispatch_instance_locked(&mut scope, instance_id, workflow_instance_id)
            .await;
        self.complete(Some(guard), scope, result).await
    }

    async fn redispatch_instance_locked(
        &self,
        scope: &mut TxScope,
        instance_id: i64,
        workflow_instance_id: Option<i64>,
    ) -> SchedulerResult<bool> {
        let instance = lock_instance(scope, instance_id, workflow_instance_id).await?;
        if instance.is_workflow_lead() || instance.is_terminal() || instance.run_state == RunState::Paused {
            return Ok(false);
        }

        let tasks = scope.find_tasks(instance_id).await?;
        let mut redispatch_tasks = Vec::new();
        for task in tasks.iter().filter(|t| t.is_waiting()) {
            if self.dispatcher.should_redispatch(task).await {
                redispatch_tasks.push(task.clone());
            }
        }
        if redispatch_tasks.is_empty() {
            return Ok(false);
        }

        let job = required_job(scope, instance.job_id).await?;
        let pausable_tasks: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.execute_state.is_pausable())
            .collect();
        info!("重新分发任务: {}, {}", instance_id, redispatch_tasks.len());
        scope.after_commit(AfterCommit::Dispatch(DispatchRequest::redispatch(
            job,
            instance,
            redispatch_tasks,
            pausable_tasks,
        )));
        Ok(true)
    }

    /// 任务分发失败，达到阈值后终止任务并重新计算实例状态
    pub async fn process_dispatch_failed(&self, task_id: i64) -> SchedulerResult<bool> {
        let Some((instance_id, lock_id)) = self.find_task_lock(task_id).await? else {
            return Ok(false);
        };
        let guard = self.lock_pool.lock(lock_id).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.process_dispatch_failed_locked(&mut scope, task_id).await;
        let terminated = self.complete(Some(guard), scope, result).await?;
        if terminated {
            self.refresh_instance(instance_id).await?;
        }
        Ok(terminated)
    }

    async fn process_dispatch_failed_locked(&self, scope: &mut TxScope, task_id: i64) -> SchedulerResult<bool> {
        let Some(task) = scope.get_task(task_id).await? else {
            return Ok(false);
        };
        if !task.is_waiting() {
            return Ok(false);
        }

        let threshold = self.config.task_dispatch_failed_count_threshold;
        let count = task.dispatch_failed_count;
        let reached = count >= threshold
            || (scope.increment_dispatch_failed_count(task_id, count).await? && count + 1 >= threshold);
        if !reached {
            debug!("task trace [{}] dispatch failed: {}", task_id, count + 1);
            return Ok(false);
        }

        if !scope
            .terminate_task(task_id, None, ExecuteState::DispatchFailed, ExecuteState::Waiting, None, None)
            .await?
        {
            return Ok(false);
        }
        metrics::counter!("scheduler_dispatch_failed_total").increment(1);
        warn!("task trace [{}] dispatch failed over threshold: {}", task_id, threshold);
        Ok(true)
    }

    /// 根据任务状态重新计算实例状态，实例终止时进入后续处理
    pub async fn refresh_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        let Some(lock_id) = self.find_instance_lock(instance_id).await? else {
            return Ok(false);
        };
        let guard = self.lock_pool.lock(lock_id).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = self.refresh_instance_locked(&mut scope, instance_id).await;
        self.complete(Some(guard), scope, result).await
    }

    async fn refresh_instance_locked(&self, scope: &mut TxScope, instance_id: i64) -> SchedulerResult<bool> {
        let instance = scope
            .lock_instance(instance_id)
            .await?
            .ok_or_else(|| SchedulerError::instance_not_found(instance_id))?;
        if instance.is_terminal() || instance.is_workflow_lead() {
            return Ok(false);
        }
        self.settle_instance(scope, instance, Operation::Trigger).await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // 事务与提交后动作

    async fn find_instance_lock(&self, instance_id: i64) -> SchedulerResult<Option<i64>> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = scope.get_instance(instance_id).await;
        scope.rollback().await?;
        Ok(result?.map(|i| i.lock_id()))
    }

    async fn find_task_lock(&self, task_id: i64) -> SchedulerResult<Option<(i64, i64)>> {
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = find_task_instance(&mut scope, task_id).await;
        scope.rollback().await?;
        Ok(result?.map(|i| (i.instance_id, i.lock_id())))
    }

    /// 结束事务：成功时提交并在释放锁后执行提交后动作，失败时回滚
    async fn complete<T>(
        &self,
        guard: Option<OwnedMutexGuard<()>>,
        scope: TxScope,
        result: SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        match result {
            Ok(value) => {
                let actions = scope.commit().await?;
                drop(guard);
                self.run_after_commit(actions).await;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = scope.rollback().await {
                    error!("事务回滚失败: {}, {}", e, rollback_error);
                }
                drop(guard);
                Err(e)
            }
        }
    }

    fn run_after_commit(&self, actions: Vec<AfterCommit>) -> BoxFuture<'_, ()> {
        async move {
            for action in actions {
                match action {
                    AfterCommit::Dispatch(request) => self.dispatch(request).await,
                    AfterCommit::Send { group, params } => self.send(&group, &params).await,
                }
            }
        }
        .boxed()
    }

    async fn dispatch(&self, request: DispatchRequest) {
        let plan = self.dispatcher.plan(
            &request.job,
            &request.instance,
            &request.tasks,
            request.redispatch,
            &request.pausable_tasks,
        );
        if !plan.broadcast_aborted.is_empty() {
            if let Err(e) = self
                .abort_broadcast_tasks(&request.instance, &plan.broadcast_aborted)
                .await
            {
                error!("终止广播任务失败: {}, {}", request.instance.instance_id, e);
            }
        }
        self.send(&request.job.group, &plan.params).await;
    }

    async fn abort_broadcast_tasks(&self, instance: &Instance, task_ids: &[i64]) -> SchedulerResult<()> {
        let guard = self.lock_pool.lock(instance.lock_id()).await;
        let mut scope = TxScope::begin(self.tx_manager.as_ref()).await?;
        let result = abort_broadcast_tasks_in(&mut scope, task_ids).await;
        self.complete(Some(guard), scope, result).await?;
        self.refresh_instance(instance.instance_id).await?;
        Ok(())
    }

    async fn send(&self, group: &str, params: &[ExecuteTaskParam]) {
        if self.dispatcher.send(group, params).await {
            return;
        }
        for param in params.iter().filter(|p| p.operation.is_trigger()) {
            if let Err(e) = self.process_dispatch_failed(param.task_id).await {
                error!("处理分发失败出错: {}, {}", param.task_id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // 状态流转

    /// 任务状态变化后汇总实例状态
    async fn settle_instance(&self, scope: &mut TxScope, mut instance: Instance, operation: Operation) -> SchedulerResult<()> {
        let tasks = scope.find_tasks(instance.instance_id).await?;
        let Some(resolved) = RunStateResolver::resolve(&tasks, Utc::now()) else {
            return Ok(());
        };

        match resolved {
            ResolvedRunState::Paused => {
                if let Some(workflow_instance_id) = instance.workflow_instance_id {
                    let lead = required_instance(scope, workflow_instance_id).await?;
                    self.pause(scope, lead).await?;
                } else {
                    self.pause(scope, instance).await?;
                }
            }
            ResolvedRunState::Terminal { state, end_time } => {
                if !scope
                    .terminate_instance(instance.instance_id, state, RunState::TERMINABLE, end_time)
                    .await?
                {
                    return Err(SchedulerError::illegal_state(format!(
                        "终止实例失败: {}, {}",
                        instance.instance_id, state
                    )));
                }
                instance.mark_terminated(state, end_time);
                record_terminated(state);
                info!("实例终止: {}, {}", instance.instance_id, state);

                if operation.is_trigger() {
                    self.process_terminated_instance(scope, &instance).await?;
                } else if let Some(workflow_instance_id) = instance.workflow_instance_id {
                    self.update_workflow_node_state(scope, &instance, state, RunState::TERMINABLE)
                        .await?;
                    let lead = required_instance(scope, workflow_instance_id).await?;
                    self.update_workflow_lead_state(scope, lead, RunState::Canceled, RunState::RUNNABLE)
                        .await?;
                } else {
                    self.after_terminated_instance(scope, &instance).await?;
                }
            }
        }
        Ok(())
    }

    async fn pause(&self, scope: &mut TxScope, instance: Instance) -> SchedulerResult<bool> {
        if !instance.run_state.is_pausable() {
            return Ok(false);
        }
        if instance.is_workflow_lead() {
            for node in scope.find_workflow_nodes(instance.instance_id).await? {
                if node.run_state.is_pausable() {
                    self.pause_single(scope, node).await?;
                }
            }
            self.update_workflow_lead_state(scope, instance, RunState::Paused, &[RunState::Waiting])
                .await?;
        } else {
            self.pause_single(scope, instance).await?;
        }
        Ok(true)
    }

    async fn pause_single(&self, scope: &mut TxScope, mut instance: Instance) -> SchedulerResult<()> {
        scope
            .update_tasks_state(instance.instance_id, ExecuteState::Paused, &[ExecuteState::Waiting], None)
            .await?;
        if let Some(action) = self
            .load_executing_tasks(scope, &instance, Operation::Pause)
            .await?
        {
            // 等待Worker暂停后上报
            scope.after_commit(action);
            return Ok(());
        }

        let now = Utc::now();
        let tasks = scope.find_tasks(instance.instance_id).await?;
        let resolved = RunStateResolver::resolve(&tasks, now).ok_or_else(|| {
            SchedulerError::illegal_state(format!("暂停后实例状态无法确定: {}", instance.instance_id))
        })?;
        let state = resolved.run_state();
        let updated = match resolved {
            ResolvedRunState::Paused => {
                scope
                    .update_instance_state(instance.instance_id, RunState::Paused, RunState::PAUSABLE)
                    .await?
            }
            ResolvedRunState::Terminal { state, end_time } => {
                instance.mark_terminated(state, end_time);
                scope
                    .terminate_instance(instance.instance_id, state, RunState::PAUSABLE, end_time)
                    .await?
            }
        };
        if !updated {
            return Err(SchedulerError::illegal_state(format!(
                "暂停实例失败: {}, {}",
                instance.instance_id, state
            )));
        }
        info!("暂停实例: {}, {}", instance.instance_id, state);

        if instance.is_workflow_node() {
            if state.is_terminal() {
                record_terminated(state);
            }
            self.update_workflow_node_state(scope, &instance, state, RunState::PAUSABLE)
                .await?;
        } else if state.is_terminal() {
            record_terminated(state);
            self.after_terminated_instance(scope, &instance).await?;
        }
        Ok(())
    }

    async fn cancel(&self, scope: &mut TxScope, instance: Instance, operation: Operation) -> SchedulerResult<bool> {
        if instance.is_terminal() {
            return Ok(false);
        }
        if instance.is_workflow_lead() {
            for node in scope.find_workflow_nodes(instance.instance_id).await? {
                if !node.is_terminal() {
                    self.cancel_single(scope, node, operation).await?;
                }
            }
            self.update_workflow_lead_state(scope, instance, RunState::Canceled, RunState::RUNNABLE)
                .await?;
        } else {
            self.cancel_single(scope, instance, operation).await?;
        }
        Ok(true)
    }

    async fn cancel_single(&self, scope: &mut TxScope, mut instance: Instance, operation: Operation) -> SchedulerResult<()> {
        let to_state = operation
            .to_state()
            .ok_or_else(|| SchedulerError::illegal_state(format!("不是取消操作: {operation}")))?;
        let now = Utc::now();
        scope
            .update_tasks_state(
                instance.instance_id,
                to_state,
                &[ExecuteState::Waiting, ExecuteState::Paused],
                Some(now),
            )
            .await?;
        if let Some(action) = self.load_executing_tasks(scope, &instance, operation).await? {
            scope.after_commit(action);
            return Ok(());
        }

        let tasks = scope.find_tasks(instance.instance_id).await?;
        let (state, end_time) = match RunStateResolver::resolve(&tasks, now) {
            Some(ResolvedRunState::Terminal { state, end_time }) => (state, end_time),
            Some(ResolvedRunState::Paused) => (RunState::Canceled, now),
            None => {
                return Err(SchedulerError::illegal_state(format!(
                    "取消后实例状态无法确定: {}",
                    instance.instance_id
                )));
            }
        };
        if !scope
            .terminate_instance(instance.instance_id, state, RunState::TERMINABLE, end_time)
            .await?
        {
            return Err(SchedulerError::illegal_state(format!(
                "取消实例失败: {}",
                instance.instance_id
            )));
        }
        instance.mark_terminated(state, end_time);
        record_terminated(state);
        info!("取消实例: {}, {}, {}", instance.instance_id, operation, state);

        if instance.is_workflow_node() {
            self.update_workflow_node_state(scope, &instance, state, RunState::TERMINABLE)
                .await
        } else {
            self.after_terminated_instance(scope, &instance).await
        }
    }

    async fn resume(&self, scope: &mut TxScope, instance: Instance) -> SchedulerResult<bool> {
        if instance.run_state != RunState::Paused {
            return Ok(false);
        }
        if !instance.is_workflow_lead() {
            self.resume_single(scope, instance).await?;
            return Ok(true);
        }

        let workflow_instance_id = instance.instance_id;
        if !scope
            .update_instance_state(workflow_instance_id, RunState::Running, &[RunState::Paused])
            .await?
        {
            return Err(SchedulerError::illegal_state(format!(
                "恢复工作流实例失败: {workflow_instance_id}"
            )));
        }
        scope.resume_waiting_edges(workflow_instance_id).await?;
        for node in scope.find_workflow_nodes(workflow_instance_id).await? {
            if node.run_state == RunState::Paused {
                self.update_workflow_node_state(scope, &node, RunState::Running, &[RunState::Paused])
                    .await?;
                self.resume_single(scope, node).await?;
            }
        }

        let job = required_job(scope, instance.job_id).await?;
        let mut lead = instance;
        lead.run_state = RunState::Running;
        let mut graph = WorkflowGraph::new(scope.find_edges(workflow_instance_id).await?);
        let advances = graph.advance_all();
        self.creator
            .start_workflow_nodes(scope, &job, &lead, advances)
            .await?;
        info!("恢复工作流实例: {}", workflow_instance_id);
        Ok(true)
    }

    async fn resume_single(&self, scope: &mut TxScope, mut instance: Instance) -> SchedulerResult<()> {
        let instance_id = instance.instance_id;
        if !scope
            .update_instance_state(instance_id, RunState::Waiting, &[RunState::Paused])
            .await?
        {
            return Err(SchedulerError::illegal_state(format!("恢复实例失败: {instance_id}")));
        }
        let rows = scope
            .update_tasks_state(instance_id, ExecuteState::Waiting, &[ExecuteState::Paused], None)
            .await?;
        if rows == 0 {
            return Err(SchedulerError::illegal_state(format!("恢复实例没有暂停的任务: {instance_id}")));
        }

        let job = required_job(scope, instance.job_id).await?;
        let tasks: Vec<Task> = scope
            .find_tasks(instance_id)
            .await?
            .into_iter()
            .filter(Task::is_waiting)
            .collect();
        instance.run_state = RunState::Waiting;
        info!("恢复实例: {}, {}", instance_id, tasks.len());
        scope.after_commit(AfterCommit::Dispatch(DispatchRequest::new(job, instance, tasks)));
        Ok(())
    }

    /// 为执行中的任务构建暂停/取消指令，Worker已下线的任务直接终止
    async fn load_executing_tasks(
        &self,
        scope: &mut TxScope,
        instance: &Instance,
        operation: Operation,
    ) -> SchedulerResult<Option<AfterCommit>> {
        let to_state = operation
            .to_state()
            .ok_or_else(|| SchedulerError::illegal_state(format!("操作没有目标状态: {operation}")))?;
        let executing: Vec<Task> = scope
            .find_tasks(instance.instance_id)
            .await?
            .into_iter()
            .filter(Task::is_executing)
            .collect();

        let mut lazy_job = LazyJob::new(instance.job_id);
        let mut params = Vec::new();
        let mut group = None;
        for task in executing {
            if self.dispatcher.is_alive(task.worker.as_ref()) {
                let job = lazy_job.get(scope).await?;
                group.get_or_insert_with(|| job.group.clone());
                params.push(
                    self.dispatcher
                        .build_param(operation, job, instance, task.task_id, task.worker.clone()),
                );
                continue;
            }

            // 暂停时Worker可能已执行了一部分，不能再恢复执行
            let end_time = to_state.is_terminal().then(Utc::now);
            if scope
                .terminate_task(
                    task.task_id,
                    task.worker.as_ref(),
                    ExecuteState::ExecuteAborted,
                    ExecuteState::Executing,
                    end_time,
                    None,
                )
                .await?
            {
                metrics::counter!("scheduler_tasks_aborted_total", "reason" => "dead_worker").increment(1);
                warn!("task trace [{}] worker dead, {} -> {}", task.task_id, operation, ExecuteState::ExecuteAborted);
            }
        }

        Ok(group.map(|group| AfterCommit::Send { group, params }))
    }

    async fn process_terminated_instance(&self, scope: &mut TxScope, instance: &Instance) -> SchedulerResult<()> {
        if instance.is_workflow_lead() {
            return Err(SchedulerError::illegal_state(format!(
                "工作流主实例不能直接结束: {}",
                instance.instance_id
            )));
        }
        match instance.run_state {
            RunState::Canceled => self.retry_job(scope, instance).await,
            RunState::Completed => {
                if instance.is_workflow_node() {
                    self.process_workflow_instance(scope, instance).await
                } else {
                    self.after_terminated_instance(scope, instance).await?;
                    self.dependency_resolver.trigger_children(scope, instance).await
                }
            }
            state => Err(SchedulerError::illegal_state(format!(
                "实例未终止: {}, {}",
                instance.instance_id, state
            ))),
        }
    }

    async fn retry_job(&self, scope: &mut TxScope, failed: &Instance) -> SchedulerResult<()> {
        match self.retry_planner.retry(scope, failed).await {
            Ok(Some(_)) => return self.start_retrying(scope, failed).await,
            Ok(None) => {}
            Err(e) => error!("重试实例失败: {}, {}", failed.instance_id, e),
        }

        if let Some(workflow_instance_id) = failed.workflow_instance_id {
            self.update_workflow_node_state(scope, failed, RunState::Canceled, RunState::TERMINABLE)
                .await?;
            let lead = required_instance(scope, workflow_instance_id).await?;
            self.update_workflow_lead_state(scope, lead, RunState::Canceled, RunState::RUNNABLE)
                .await
        } else {
            self.after_terminated_instance(scope, failed).await
        }
    }

    async fn start_retrying(&self, scope: &mut TxScope, failed: &Instance) -> SchedulerResult<()> {
        // 重试链的原始实例已标记
        if failed.is_retry() {
            return Ok(());
        }
        if !scope
            .update_retrying(failed.instance_id, true, failed.run_state, failed.run_state)
            .await?
        {
            return Err(SchedulerError::illegal_state(format!(
                "标记重试失败: {}",
                failed.instance_id
            )));
        }
        Ok(())
    }

    async fn stop_retrying(&self, scope: &mut TxScope, instance: &Instance) -> SchedulerResult<()> {
        if !instance.is_retry() {
            return Ok(());
        }
        let original = required_instance(scope, instance.retry_original_id()).await?;
        if !scope
            .update_retrying(original.instance_id, false, original.run_state, original.run_state)
            .await?
        {
            return Err(SchedulerError::illegal_state(format!(
                "清除重试标记失败: {}",
                original.instance_id
            )));
        }
        Ok(())
    }

    /// 实例链结束后的处理：清除重试标记，续期固定频率/延迟作业
    async fn after_terminated_instance(&self, scope: &mut TxScope, instance: &Instance) -> SchedulerResult<()> {
        self.stop_retrying(scope, instance).await?;

        let original = if instance.is_retry() {
            required_instance(scope, instance.retry_original_id()).await?
        } else {
            instance.clone()
        };
        if original.run_type != RunType::Schedule {
            return Ok(());
        }
        let Some(job) = scope.get_job(instance.job_id).await? else {
            error!("实例的作业不存在: {}, {}", instance.instance_id, instance.job_id);
            return Ok(());
        };
        if !job.is_enabled() || !job.trigger_type.is_fixed() {
            return Ok(());
        }

        let period = match job.trigger_type.fixed_period(&job.trigger_value) {
            Ok(period) => period,
            Err(e) => {
                error!("作业固定周期无效: {}, {}", job.job_id, e);
                return Ok(());
            }
        };
        let end_time = instance.run_end_time.unwrap_or_else(Utc::now);
        let next_trigger_time = match job.trigger_type {
            TriggerType::FixedRate => (original.trigger_time + period).max(end_time),
            _ => end_time + period,
        };
        if scope
            .update_fixed_next_trigger_time(job.job_id, next_trigger_time)
            .await?
        {
            info!("续期固定周期作业: {}, {}", job.job_id, next_trigger_time);
        } else {
            warn!("续期固定周期作业失败: {}", job.job_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 工作流

    /// 节点实例完成后推进工作流
    async fn process_workflow_instance(&self, scope: &mut TxScope, node: &Instance) -> SchedulerResult<()> {
        let (workflow_instance_id, dag_node) = workflow_node_of(node)?;
        self.update_workflow_node_state(scope, node, RunState::Completed, &[RunState::Running])
            .await?;

        let lead = required_instance(scope, workflow_instance_id).await?;
        let mut graph = WorkflowGraph::new(scope.find_edges(workflow_instance_id).await?);
        if self.stop_workflow_graph(scope, lead.clone(), &mut graph).await? {
            return Ok(());
        }

        let savepoint = scope.savepoint().await?;
        let advances = graph.advance_from(dag_node);
        let result = match required_job(scope, lead.job_id).await {
            Ok(job) => {
                self.creator
                    .start_workflow_nodes(scope, &job, &lead, advances)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                scope.release(savepoint).await?;
                let mut graph = WorkflowGraph::new(scope.find_edges(workflow_instance_id).await?);
                self.stop_workflow_graph(scope, lead, &mut graph).await?;
                Ok(())
            }
            Err(e) => {
                scope.rollback_to(savepoint).await?;
                error!("推进工作流失败: {}, {}, {}", workflow_instance_id, dag_node, e);
                self.update_workflow_lead_state(scope, lead, RunState::Canceled, RunState::RUNNABLE)
                    .await
            }
        }
    }

    /// 工作流已结束或已暂停时更新主实例，返回是否不再推进
    async fn stop_workflow_graph(
        &self,
        scope: &mut TxScope,
        mut lead: Instance,
        graph: &mut WorkflowGraph,
    ) -> SchedulerResult<bool> {
        let workflow_instance_id = lead.instance_id;
        if let Some(end_state) = graph.end_state() {
            scope
                .update_node_state(workflow_instance_id, &DagNode::End, end_state, RunState::RUNNABLE, None)
                .await?;
            graph.set_node_state(&DagNode::End, end_state);
        }

        if graph.all_terminal() {
            let state = graph.terminal_state();
            let end_time = Utc::now();
            if !scope
                .terminate_instance(workflow_instance_id, state, RunState::TERMINABLE, end_time)
                .await?
            {
                return Err(SchedulerError::illegal_state(format!(
                    "终止工作流实例失败: {workflow_instance_id}"
                )));
            }
            lead.mark_terminated(state, end_time);
            record_terminated(state);
            info!("工作流实例终止: {}, {}", workflow_instance_id, state);
            self.dependency_resolver.trigger_children(scope, &lead).await?;
            self.after_terminated_instance(scope, &lead).await?;
            return Ok(true);
        }

        if graph.all_terminal_or_paused() {
            if scope
                .update_instance_state(workflow_instance_id, RunState::Paused, &[RunState::Running])
                .await?
            {
                info!("工作流实例暂停: {}", workflow_instance_id);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn update_workflow_node_state(
        &self,
        scope: &mut TxScope,
        node: &Instance,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<()> {
        let (workflow_instance_id, dag_node) = workflow_node_of(node)?;
        let rows = scope
            .update_node_state(workflow_instance_id, dag_node, to_state, from_states, Some(node.instance_id))
            .await?;
        if rows == 0 {
            return Err(SchedulerError::illegal_state(format!(
                "更新工作流节点状态失败: {}, {}, {}",
                workflow_instance_id, dag_node, to_state
            )));
        }
        if to_state.is_terminal() {
            self.stop_retrying(scope, node).await?;
        }
        Ok(())
    }

    async fn update_workflow_lead_state(
        &self,
        scope: &mut TxScope,
        lead: Instance,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<()> {
        let workflow_instance_id = lead.instance_id;
        scope
            .update_edges_state(workflow_instance_id, to_state, from_states)
            .await?;
        let mut graph = WorkflowGraph::new(scope.find_edges(workflow_instance_id).await?);
        self.stop_workflow_graph(scope, lead, &mut graph).await?;
        Ok(())
    }
}

async fn find_task_instance(scope: &mut TxScope, task_id: i64) -> SchedulerResult<Option<Instance>> {
    match scope.get_task(task_id).await? {
        Some(task) => scope.get_instance(task.instance_id).await,
        None => Ok(None),
    }
}

async fn abort_broadcast_tasks_in(scope: &mut TxScope, task_ids: &[i64]) -> SchedulerResult<()> {
    let now = Utc::now();
    for task_id in task_ids {
        let aborted = scope
            .terminate_task(
                *task_id,
                None,
                ExecuteState::BroadcastAborted,
                ExecuteState::Waiting,
                Some(now),
                None,
            )
            .await?;
        if aborted {
            metrics::counter!("scheduler_tasks_aborted_total", "reason" => "broadcast").increment(1);
            warn!("task trace [{}] broadcast aborted", task_id);
        }
    }
    Ok(())
}

fn record_terminated(state: RunState) {
    metrics::counter!("scheduler_instances_terminated_total", "state" => state.as_str()).increment(1);
}

fn workflow_node_of(instance: &Instance) -> SchedulerResult<(i64, &DagNode)> {
    match (instance.workflow_instance_id, instance.workflow_node.as_ref()) {
        (Some(workflow_instance_id), Some(node)) => Ok((workflow_instance_id, node)),
        _ => Err(SchedulerError::illegal_state(format!(
            "不是工作流节点实例: {}",
            instance.instance_id
        ))),
    }
}

async fn required_job(scope: &mut TxScope, job_id: i64) -> SchedulerResult<Job> {
    scope
        .get_job(job_id)
        .await?
        .ok_or_else(|| SchedulerError::job_not_found(job_id))
}

async fn required_instance(scope: &mut TxScope, instance_id: i64) -> SchedulerResult<Instance> {
    scope
        .get_instance(instance_id)
        .await?
        .ok_or_else(|| SchedulerError::instance_not_found(instance_id))
}

/// 锁定实例并校验调用方给出的工作流ID
async fn lock_instance(
    scope: &mut TxScope,
    instance_id: i64,
    workflow_instance_id: Option<i64>,
) -> SchedulerResult<Instance> {
    let instance = scope
        .lock_instance(instance_id)
        .await?
        .ok_or_else(|| SchedulerError::instance_not_found(instance_id))?;
    if instance.workflow_instance_id != workflow_instance_id {
        return Err(SchedulerError::InconsistentWorkflow {
            instance_id,
            expect: workflow_instance_id,
            actual: instance.workflow_instance_id,
        });
    }
    Ok(instance)
}

async fn lock_lead(scope: &mut TxScope, instance_id: i64) -> SchedulerResult<Instance> {
    let instance = scope
        .lock_instance(instance_id)
        .await?
        .ok_or_else(|| SchedulerError::instance_not_found(instance_id))?;
    if instance.is_workflow_node() {
        return Err(SchedulerError::illegal_state(format!(
            "必须操作工作流主实例: {instance_id}"
        )));
    }
    Ok(instance)
}
