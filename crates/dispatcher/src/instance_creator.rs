use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use scheduler_core::{SchedulerError, SchedulerResult, SupervisorConfig};
use scheduler_domain::{
    DagExpression, DagNode, IdGenerator, Instance, InstanceRepository, Job, RunState, RunType,
    SplitJobParam, SupervisorTokenProvider, Task, TaskRepository, WorkerDiscovery, WorkerRpc,
    WorkflowEdge, WorkflowRepository,
};

use crate::tx_scope::{AfterCommit, DispatchRequest, TxScope};
use crate::workflow_graph::{NodeAdvance, WorkflowGraph};

/// 创建实例与拆分任务
pub struct InstanceCreator {
    id_generator: Arc<dyn IdGenerator>,
    discovery: Arc<dyn WorkerDiscovery>,
    worker_rpc: Arc<dyn WorkerRpc>,
    token_provider: Arc<dyn SupervisorTokenProvider>,
    config: SupervisorConfig,
}

impl InstanceCreator {
    pub fn new(
        id_generator: Arc<dyn IdGenerator>,
        discovery: Arc<dyn WorkerDiscovery>,
        worker_rpc: Arc<dyn WorkerRpc>,
        token_provider: Arc<dyn SupervisorTokenProvider>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            id_generator,
            discovery,
            worker_rpc,
            token_provider,
            config,
        }
    }

    pub fn generate_id(&self) -> i64 {
        self.id_generator.generate_id()
    }

    /// 拆分任务
    ///
    /// 广播作业为每个存活的Worker生成一个任务并固定该Worker，
    /// 其它作业由Worker按执行器拆分任务参数。
    pub async fn split_tasks(&self, job: &Job, executor: &str, instance_id: i64) -> SchedulerResult<Vec<Task>> {
        let workers = self.discovery.get_discovered_servers(&job.group);
        if workers.is_empty() {
            return Err(SchedulerError::NoAvailableWorker {
                group: job.group.clone(),
            });
        }

        if job.route_strategy.is_broadcast() {
            let count = workers.len() as i32;
            return Ok(workers
                .into_iter()
                .enumerate()
                .map(|(i, worker)| {
                    Task::new(
                        self.generate_id(),
                        instance_id,
                        i as i32 + 1,
                        count,
                        job.job_param.clone(),
                        Some(worker),
                    )
                })
                .collect());
        }

        let mut param = SplitJobParam::new(job, executor, workers.len());
        param.supervisor_token = self.token_provider.supervisor_token(&job.group);
        let task_params = self.worker_rpc.split_job(&param).await?;
        if task_params.is_empty() {
            return Err(SchedulerError::split_job(format!("拆分任务为空: {}, {}", job.job_id, executor)));
        }
        if task_params.len() > self.config.maximum_split_task_size {
            return Err(SchedulerError::split_job(format!(
                "拆分任务数 {} 超过最大值 {}: {}",
                task_params.len(),
                self.config.maximum_split_task_size,
                job.job_id
            )));
        }

        let count = task_params.len() as i32;
        Ok(task_params
            .into_iter()
            .enumerate()
            .map(|(i, param)| {
                Task::new(self.generate_id(), instance_id, i as i32 + 1, count, Some(param), None)
            })
            .collect())
    }

    /// 创建实例并在提交后分发
    ///
    /// 工作流作业创建RUNNING状态的主实例与全部边，并立即启动首批节点。
    pub async fn create_instance(
        &self,
        scope: &mut TxScope,
        job: &Job,
        run_type: RunType,
        trigger_time: DateTime<Utc>,
        parent: Option<&Instance>,
    ) -> SchedulerResult<Instance> {
        let instance_id = self.generate_id();
        let mut instance = match parent {
            Some(parent) => Instance::derive(parent, instance_id, None, job.job_id, run_type, trigger_time, 0),
            None => Instance::new(instance_id, job.job_id, run_type, trigger_time, 0),
        };

        if !job.is_workflow() {
            let tasks = self.split_tasks(job, &job.job_executor, instance_id).await?;
            scope.insert_instance(&instance).await?;
            scope.insert_tasks(&tasks).await?;
            debug!("创建实例: {}, {}, {}", job.job_id, instance_id, tasks.len());
            scope.after_commit(AfterCommit::Dispatch(DispatchRequest::new(
                job.clone(),
                instance.clone(),
                tasks,
            )));
            return Ok(instance);
        }

        let dag = DagExpression::parse(&job.job_executor)?;
        instance.workflow_instance_id = Some(instance_id);
        instance.run_state = RunState::Running;
        instance.run_start_time = Some(Utc::now());
        scope.insert_instance(&instance).await?;

        let edges: Vec<WorkflowEdge> = dag
            .edges()
            .iter()
            .enumerate()
            .map(|(i, e)| WorkflowEdge::new(instance_id, e.source.clone(), e.target.clone(), i as i32 + 1))
            .collect();
        scope.insert_edges(&edges).await?;

        let mut graph = WorkflowGraph::new(edges);
        let advances = graph.advance_all();
        self.start_workflow_nodes(scope, job, &instance, advances).await?;
        info!("创建工作流实例: {}, {}, {}", job.job_id, instance_id, dag.nodes().len());
        Ok(instance)
    }

    /// 执行工作流推进的决定：创建节点实例或取消节点
    pub async fn start_workflow_nodes(
        &self,
        scope: &mut TxScope,
        job: &Job,
        lead: &Instance,
        advances: Vec<NodeAdvance>,
    ) -> SchedulerResult<()> {
        let workflow_instance_id = lead.instance_id;
        for advance in advances {
            match advance {
                NodeAdvance::Cancel { node } => {
                    let row = scope
                        .update_node_state(workflow_instance_id, &node, RunState::Canceled, RunState::TERMINABLE, None)
                        .await?;
                    if row == 0 {
                        return Err(SchedulerError::illegal_state(format!(
                            "取消工作流节点失败: {}, {}",
                            workflow_instance_id, node
                        )));
                    }
                    info!("工作流节点前置失败，取消节点: {}, {}", workflow_instance_id, node);
                }
                NodeAdvance::Start {
                    node,
                    sequence,
                    predecessor_instance_ids,
                } => {
                    self.start_workflow_node(scope, job, lead, node, sequence, &predecessor_instance_ids)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn start_workflow_node(
        &self,
        scope: &mut TxScope,
        job: &Job,
        lead: &Instance,
        node: DagNode,
        sequence: i32,
        predecessor_instance_ids: &[i64],
    ) -> SchedulerResult<()> {
        let workflow_instance_id = lead.instance_id;

        // 最后结束的前置节点实例作为父实例，首批节点的父实例是主实例
        let mut parent: Option<Instance> = None;
        for id in predecessor_instance_ids {
            if let Some(instance) = scope.get_instance(*id).await? {
                if parent
                    .as_ref()
                    .map_or(true, |p| instance.run_end_time > p.run_end_time)
                {
                    parent = Some(instance);
                }
            }
        }
        let parent = parent.as_ref().unwrap_or(lead);

        // TODO: 不同主实例的触发时间加上序号后可能撞上唯一键，目前冲突会回滚推进并取消整个工作流
        let trigger_time = lead
            .trigger_time
            .checked_add_signed(Duration::milliseconds(i64::from(sequence)))
            .ok_or_else(|| SchedulerError::illegal_state(format!("节点触发时间溢出: {}", lead.instance_id)))?;

        let instance_id = self.generate_id();
        let mut instance = Instance::derive(
            parent,
            instance_id,
            Some(workflow_instance_id),
            job.job_id,
            lead.run_type,
            trigger_time,
            0,
        );
        instance.workflow_node = Some(node.clone());

        let row = scope
            .update_node_state(
                workflow_instance_id,
                &node,
                RunState::Running,
                &[RunState::Waiting],
                Some(instance_id),
            )
            .await?;
        if row == 0 {
            return Err(SchedulerError::illegal_state(format!(
                "启动工作流节点失败: {}, {}",
                workflow_instance_id, node
            )));
        }

        let tasks = self.split_tasks(job, node.name(), instance_id).await?;
        scope.insert_instance(&instance).await?;
        scope.insert_tasks(&tasks).await?;
        debug!("创建工作流节点实例: {}, {}, {}", workflow_instance_id, node, instance_id);
        scope.after_commit(AfterCommit::Dispatch(DispatchRequest::new(job.clone(), instance, tasks)));
        Ok(())
    }
}
