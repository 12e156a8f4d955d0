//! 测试装配
//!
//! `TestHarness` 在内存存储上装配编排器与作业管理，并提供模拟Worker上报的快捷方法。

use std::sync::Arc;

use scheduler_core::SupervisorConfig;
use scheduler_dispatcher::{InstanceOrchestrator, JobAdmin};
use scheduler_domain::{
    ConfiguredTokenProvider, ExecuteState, IdGenerator, Instance, Job, JobRepository, Operation,
    StartTaskParam, StartTaskResult, StopTaskParam, Task, TransactionManager, Worker,
    WorkflowEdge,
};
use scheduler_infrastructure::{MemoryStore, MemoryTransactionManager, SequenceIdGenerator};

use crate::builders::WorkerBuilder;
use crate::mocks::{MockWorkerDiscovery, MockWorkerRpc};

/// ID从这里开始分配，测试可以据此推算后续ID
pub const FIRST_ID: i64 = 1000;

pub struct TestHarness {
    pub tx_manager: MemoryTransactionManager,
    pub discovery: MockWorkerDiscovery,
    pub worker_rpc: MockWorkerRpc,
    pub id_generator: Arc<SequenceIdGenerator>,
    pub orchestrator: InstanceOrchestrator,
    pub job_admin: JobAdmin,
    pub config: SupervisorConfig,
}

impl TestHarness {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self::with_config(workers, SupervisorConfig::default())
    }

    pub fn with_config(workers: Vec<Worker>, config: SupervisorConfig) -> Self {
        let tx_manager = MemoryTransactionManager::new();
        let discovery = MockWorkerDiscovery::new(workers);
        let worker_rpc = MockWorkerRpc::new().with_transaction_probe(tx_manager.clone());
        let id_generator = Arc::new(SequenceIdGenerator::starting_at(FIRST_ID));
        let token_provider = Arc::new(ConfiguredTokenProvider::default());

        let orchestrator = InstanceOrchestrator::new(
            Arc::new(tx_manager.clone()),
            id_generator.clone(),
            Arc::new(discovery.clone()),
            Arc::new(worker_rpc.clone()),
            token_provider,
            config.clone(),
        );
        let job_admin = JobAdmin::new(
            Arc::new(tx_manager.clone()),
            id_generator.clone(),
            Arc::new(worker_rpc.clone()),
            config.clone(),
        );

        Self {
            tx_manager,
            discovery,
            worker_rpc,
            id_generator,
            orchestrator,
            job_admin,
            config,
        }
    }

    pub fn worker(worker_id: &str) -> Worker {
        WorkerBuilder::new(worker_id).build()
    }

    /// 直接写入作业，`job_id` 为0时分配新ID
    pub async fn insert_job(&self, mut job: Job) -> Job {
        if job.job_id == 0 {
            job.job_id = self.id_generator.generate_id();
        }
        let mut tx = self.tx_manager.begin().await.unwrap();
        tx.insert_job(&job).await.unwrap();
        tx.commit().await.unwrap();
        job
    }

    pub async fn snapshot(&self) -> MemoryStore {
        self.tx_manager.snapshot().await
    }

    pub async fn job(&self, job_id: i64) -> Job {
        self.snapshot().await.jobs.remove(&job_id).unwrap()
    }

    pub async fn instance(&self, instance_id: i64) -> Instance {
        self.snapshot().await.instances.remove(&instance_id).unwrap()
    }

    pub async fn find_instance(&self, instance_id: i64) -> Option<Instance> {
        self.snapshot().await.instances.remove(&instance_id)
    }

    /// 作业的全部实例，按ID排序
    pub async fn instances_of(&self, job_id: i64) -> Vec<Instance> {
        self.snapshot()
            .await
            .instances
            .into_values()
            .filter(|i| i.job_id == job_id)
            .collect()
    }

    pub async fn tasks(&self, instance_id: i64) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .snapshot()
            .await
            .tasks
            .into_values()
            .filter(|t| t.instance_id == instance_id)
            .collect();
        tasks.sort_by_key(|t| t.task_no);
        tasks
    }

    pub async fn edges(&self, workflow_instance_id: i64) -> Vec<WorkflowEdge> {
        let mut edges: Vec<WorkflowEdge> = self
            .snapshot()
            .await
            .edges
            .into_iter()
            .filter(|e| e.workflow_instance_id == workflow_instance_id)
            .collect();
        edges.sort_by_key(|e| e.sequence);
        edges
    }

    /// 工作流中指定节点当前的实例
    pub async fn node_instance(&self, workflow_instance_id: i64, node: &str) -> Instance {
        let instance_id = self
            .edges(workflow_instance_id)
            .await
            .into_iter()
            .find_map(|e| (e.cur_node.name() == node).then_some(e.instance_id).flatten())
            .unwrap();
        self.instance(instance_id).await
    }

    pub async fn start_task(&self, task_id: i64, worker: &Worker) -> StartTaskResult {
        self.start_task_with(task_id, worker, &format!("req-{task_id}")).await
    }

    pub async fn start_task_with(&self, task_id: i64, worker: &Worker, start_request_id: &str) -> StartTaskResult {
        let store = self.snapshot().await;
        let task = &store.tasks[&task_id];
        let instance = &store.instances[&task.instance_id];
        self.orchestrator
            .start_task(StartTaskParam {
                task_id,
                instance_id: instance.instance_id,
                workflow_instance_id: instance.workflow_instance_id,
                worker: worker.clone(),
                start_request_id: start_request_id.to_string(),
            })
            .await
            .unwrap()
    }

    /// Worker执行结束后上报
    pub async fn finish_task(&self, task_id: i64, worker: &Worker, to_state: ExecuteState) -> bool {
        self.stop_task(task_id, worker, Operation::Trigger, to_state).await
    }

    pub async fn stop_task(
        &self,
        task_id: i64,
        worker: &Worker,
        operation: Operation,
        to_state: ExecuteState,
    ) -> bool {
        let store = self.snapshot().await;
        let task = &store.tasks[&task_id];
        let instance = &store.instances[&task.instance_id];
        self.orchestrator
            .stop_task(StopTaskParam {
                task_id,
                instance_id: instance.instance_id,
                workflow_instance_id: instance.workflow_instance_id,
                worker: worker.clone(),
                operation,
                to_state,
                error_msg: to_state.is_failure().then(|| format!("{to_state}")),
            })
            .await
            .unwrap()
    }

    /// 启动并结束实例下全部等待中的任务，广播任务使用固定的Worker
    pub async fn run_instance(&self, instance_id: i64, to_state: ExecuteState) {
        let fallback = self.discovery.workers()[0].clone();
        for task in self.tasks(instance_id).await {
            if !task.is_waiting() {
                continue;
            }
            let worker = task.worker.clone().unwrap_or_else(|| fallback.clone());
            assert!(self.start_task(task.task_id, &worker).await.success);
            self.finish_task(task.task_id, &worker, to_state).await;
        }
    }
}
