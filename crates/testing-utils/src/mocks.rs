//! Worker通信与发现的测试替身
//!
//! 状态保存在 `Arc<Mutex<..>>` 中，测试可以在调用过程中随时修改行为并读取记录。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{ExecuteTaskParam, Job, SplitJobParam, Worker, WorkerDiscovery, WorkerRpc};
use scheduler_infrastructure::MemoryTransactionManager;

/// 存活Worker可变的发现服务
#[derive(Debug, Clone, Default)]
pub struct MockWorkerDiscovery {
    workers: Arc<Mutex<Vec<Worker>>>,
}

impl MockWorkerDiscovery {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self {
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    pub fn add(&self, worker: Worker) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.contains(&worker) {
            workers.push(worker);
        }
    }

    /// Worker下线
    pub fn remove(&self, worker: &Worker) {
        self.workers.lock().unwrap().retain(|w| w != worker);
    }

    pub fn clear(&self) {
        self.workers.lock().unwrap().clear();
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.workers.lock().unwrap().clone()
    }
}

impl WorkerDiscovery for MockWorkerDiscovery {
    fn get_discovered_servers(&self, group: &str) -> Vec<Worker> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.group == group)
            .cloned()
            .collect()
    }

    fn is_discovered_server(&self, worker: &Worker) -> bool {
        self.workers.lock().unwrap().contains(worker)
    }

    fn has_discovered_servers(&self) -> bool {
        !self.workers.lock().unwrap().is_empty()
    }
}

/// 一次分发调用的记录
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub group: String,
    pub params: Vec<ExecuteTaskParam>,
    /// 调用时是否有未结束的事务
    pub in_transaction: bool,
    /// 调用时已提交的事务数
    pub commit_count: u64,
}

#[derive(Debug)]
struct RpcState {
    default_split_size: usize,
    split_results: HashMap<String, Vec<String>>,
    split_failures: HashSet<String>,
    verify_error: Option<String>,
    dispatch_ok: bool,
    existing_tasks: HashSet<i64>,
    split_calls: Vec<SplitJobParam>,
    verify_calls: Vec<i64>,
    dispatches: Vec<DispatchRecord>,
}

impl Default for RpcState {
    fn default() -> Self {
        Self {
            default_split_size: 1,
            split_results: HashMap::new(),
            split_failures: HashSet::new(),
            verify_error: None,
            dispatch_ok: true,
            existing_tasks: HashSet::new(),
            split_calls: Vec::new(),
            verify_calls: Vec::new(),
            dispatches: Vec::new(),
        }
    }
}

/// 可编排的Worker远程接口
///
/// 未单独设置的执行器按默认数量拆分，任务参数为 `{executor}-{序号}`。
#[derive(Debug, Clone, Default)]
pub struct MockWorkerRpc {
    state: Arc<Mutex<RpcState>>,
    probe: Option<MemoryTransactionManager>,
}

impl MockWorkerRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分发时记录事务状态与提交数
    pub fn with_transaction_probe(mut self, manager: MemoryTransactionManager) -> Self {
        self.probe = Some(manager);
        self
    }

    /// 未单独设置的执行器拆分出的任务数
    pub fn set_split_size(&self, size: usize) {
        self.state.lock().unwrap().default_split_size = size;
    }

    pub fn set_split_result(&self, executor: &str, params: Vec<String>) {
        self.state
            .lock()
            .unwrap()
            .split_results
            .insert(executor.to_string(), params);
    }

    pub fn fail_split(&self, executor: &str) {
        self.state
            .lock()
            .unwrap()
            .split_failures
            .insert(executor.to_string());
    }

    pub fn fail_verify(&self, message: &str) {
        self.state.lock().unwrap().verify_error = Some(message.to_string());
    }

    pub fn set_dispatch_ok(&self, ok: bool) {
        self.state.lock().unwrap().dispatch_ok = ok;
    }

    /// Worker上已存在的任务
    pub fn add_existing_task(&self, task_id: i64) {
        self.state.lock().unwrap().existing_tasks.insert(task_id);
    }

    pub fn split_calls(&self) -> Vec<SplitJobParam> {
        self.state.lock().unwrap().split_calls.clone()
    }

    pub fn verify_calls(&self) -> Vec<i64> {
        self.state.lock().unwrap().verify_calls.clone()
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state.lock().unwrap().dispatches.clone()
    }

    /// 全部分发过的指令
    pub fn dispatched_params(&self) -> Vec<ExecuteTaskParam> {
        self.state
            .lock()
            .unwrap()
            .dispatches
            .iter()
            .flat_map(|d| d.params.clone())
            .collect()
    }

    pub fn clear_dispatches(&self) {
        self.state.lock().unwrap().dispatches.clear();
    }
}

#[async_trait]
impl WorkerRpc for MockWorkerRpc {
    async fn split_job(&self, param: &SplitJobParam) -> SchedulerResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.split_calls.push(param.clone());
        if state.split_failures.contains(&param.job_executor) {
            return Err(SchedulerError::split_job(format!(
                "拆分失败: {}",
                param.job_executor
            )));
        }
        if let Some(params) = state.split_results.get(&param.job_executor) {
            return Ok(params.clone());
        }
        Ok((1..=state.default_split_size)
            .map(|i| format!("{}-{}", param.job_executor, i))
            .collect())
    }

    async fn verify_job(&self, job: &Job) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.verify_calls.push(job.job_id);
        match &state.verify_error {
            Some(message) => Err(SchedulerError::invalid_job_config(message.clone())),
            None => Ok(()),
        }
    }

    async fn exists_task(&self, _worker: &Worker, task_id: i64) -> SchedulerResult<bool> {
        Ok(self.state.lock().unwrap().existing_tasks.contains(&task_id))
    }

    async fn dispatch(&self, group: &str, params: &[ExecuteTaskParam]) -> SchedulerResult<bool> {
        let (in_transaction, commit_count) = match &self.probe {
            Some(manager) => (manager.in_transaction(), manager.commit_count()),
            None => (false, 0),
        };
        let mut state = self.state.lock().unwrap();
        state.dispatches.push(DispatchRecord {
            group: group.to_string(),
            params: params.to_vec(),
            in_transaction,
            commit_count,
        });
        Ok(state.dispatch_ok)
    }
}
