use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use scheduler_domain::{
    ExecuteTaskParam, Instance, Job, Operation, SupervisorTokenProvider, Task, Worker,
    WorkerDiscovery, WorkerRpc,
};

/// 一次分发的计划
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchPlan {
    pub params: Vec<ExecuteTaskParam>,
    /// 固定Worker已下线的广播任务，需终止为BROADCAST_ABORTED
    pub broadcast_aborted: Vec<i64>,
}

/// 任务分发器
///
/// 负责为任务选择Worker并构建指令，指令的投递由调用方在事务提交后执行。
pub struct Dispatcher {
    discovery: Arc<dyn WorkerDiscovery>,
    worker_rpc: Arc<dyn WorkerRpc>,
    token_provider: Arc<dyn SupervisorTokenProvider>,
}

impl Dispatcher {
    pub fn new(
        discovery: Arc<dyn WorkerDiscovery>,
        worker_rpc: Arc<dyn WorkerRpc>,
        token_provider: Arc<dyn SupervisorTokenProvider>,
    ) -> Self {
        Self {
            discovery,
            worker_rpc,
            token_provider,
        }
    }

    pub fn is_alive(&self, worker: Option<&Worker>) -> bool {
        worker.is_some_and(|w| self.discovery.is_discovered_server(w))
    }

    pub fn build_param(
        &self,
        operation: Operation,
        job: &Job,
        instance: &Instance,
        task_id: i64,
        worker: Option<Worker>,
    ) -> ExecuteTaskParam {
        let token = self.token_provider.supervisor_token(&job.group);
        ExecuteTaskParam::new(operation, job, instance, task_id, worker, token)
    }

    /// 为任务选择Worker
    ///
    /// - 广播任务发给拆分时固定的Worker，Worker已下线的任务不发送
    /// - 轮询策略的重新分发按Worker当前负载，每次选择任务最少的Worker
    /// - 其它情况不指定Worker，由传输层按路由策略选择
    pub fn plan(
        &self,
        job: &Job,
        instance: &Instance,
        tasks: &[Task],
        redispatch: bool,
        pausable_tasks: &[Task],
    ) -> DispatchPlan {
        let mut plan = DispatchPlan::default();

        if job.route_strategy.is_broadcast() {
            for task in tasks {
                if self.is_alive(task.worker.as_ref()) {
                    plan.params.push(self.build_param(
                        Operation::Trigger,
                        job,
                        instance,
                        task.task_id,
                        task.worker.clone(),
                    ));
                } else {
                    warn!("广播任务的Worker已下线: {}, {:?}", task.task_id, task.worker);
                    plan.broadcast_aborted.push(task.task_id);
                }
            }
            return plan;
        }

        let workload = if redispatch && job.route_strategy.is_round_robin() {
            self.calculate_workload(&job.group, pausable_tasks)
        } else {
            None
        };

        match workload {
            Some(mut workload) => {
                for task in tasks {
                    // 选择分配到任务最少的Worker
                    workload.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                    let first = &mut workload[0];
                    first.1 += 1;
                    plan.params.push(self.build_param(
                        Operation::Trigger,
                        job,
                        instance,
                        task.task_id,
                        Some(first.0.clone()),
                    ));
                }
            }
            None => {
                for task in tasks {
                    plan.params.push(self.build_param(
                        Operation::Trigger,
                        job,
                        instance,
                        task.task_id,
                        None,
                    ));
                }
            }
        }
        plan
    }

    /// 各存活Worker上已分配的等待/执行中任务数
    pub fn calculate_workload(&self, group: &str, pausable_tasks: &[Task]) -> Option<Vec<(Worker, usize)>> {
        let workers = self.discovery.get_discovered_servers(group);
        if workers.is_empty() {
            error!("计算负载时没有可用的Worker: {}", group);
            return None;
        }
        if pausable_tasks.is_empty() {
            return None;
        }
        let mut counts: HashMap<&Worker, usize> = HashMap::new();
        for task in pausable_tasks.iter().filter(|t| t.execute_state.is_pausable()) {
            if let Some(worker) = task.worker.as_ref() {
                *counts.entry(worker).or_insert(0) += 1;
            }
        }
        Some(
            workers
                .into_iter()
                .map(|w| {
                    let count = counts.get(&w).copied().unwrap_or(0);
                    (w, count)
                })
                .collect(),
        )
    }

    /// 等待中的任务是否需要重新分发
    pub async fn should_redispatch(&self, task: &Task) -> bool {
        if !task.is_waiting() {
            return false;
        }
        let Some(worker) = task.worker.as_ref() else {
            return true;
        };
        if !self.is_alive(Some(worker)) {
            return true;
        }
        match self.worker_rpc.exists_task(worker, task.task_id).await {
            Ok(exists) => !exists,
            Err(e) => {
                warn!("查询Worker任务失败: {}, {}, {}", worker, task.task_id, e);
                false
            }
        }
    }

    /// 投递指令，返回是否被接收
    pub async fn send(&self, group: &str, params: &[ExecuteTaskParam]) -> bool {
        if params.is_empty() {
            return true;
        }
        match self.worker_rpc.dispatch(group, params).await {
            Ok(true) => {
                debug!("分发任务成功: {}, {}", group, params.len());
                true
            }
            Ok(false) => {
                warn!("分发任务未被接收: {}, {}", group, params.len());
                false
            }
            Err(e) => {
                error!("分发任务失败: {}, {}", group, e);
                false
            }
        }
    }
}
