//! 内存存储实现
//!
//! 事务持有整个存储的互斥锁，因此事务之间天然串行。写操作直接作用于存储，
//! 回滚时用事务开始时的快照还原，保存点即嵌套快照。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    DagNode, DependRepository, ExecuteState, Instance, InstanceRepository, Job, JobDepend,
    JobRepository, JobState, RunState, Savepoint, Task, TaskRepository, Transaction,
    TransactionManager, Worker, WorkflowEdge, WorkflowRepository,
};

/// 全部表数据
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub jobs: BTreeMap<i64, Job>,
    pub depends: Vec<JobDepend>,
    pub instances: BTreeMap<i64, Instance>,
    pub tasks: BTreeMap<i64, Task>,
    pub edges: Vec<WorkflowEdge>,
}

impl MemoryStore {
    fn job_mut(&mut self, job_id: i64) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    fn instance_mut(&mut self, instance_id: i64) -> Option<&mut Instance> {
        self.instances.get_mut(&instance_id)
    }

    fn task_mut(&mut self, task_id: i64) -> Option<&mut Task> {
        self.tasks.get_mut(&task_id)
    }
}

fn touch_instance(instance: &mut Instance) {
    instance.version += 1;
    instance.updated_at = Utc::now();
}

/// 内存事务管理器
#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionManager {
    store: Arc<Mutex<MemoryStore>>,
    commits: Arc<AtomicU64>,
}

impl MemoryTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已提交的事务数量
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// 提交计数器，测试中用于观察提交与分发的先后顺序
    pub fn commit_counter(&self) -> Arc<AtomicU64> {
        self.commits.clone()
    }

    /// 当前是否有未结束的事务
    pub fn in_transaction(&self) -> bool {
        self.store.try_lock().is_err()
    }

    /// 读取已提交的数据
    pub async fn snapshot(&self) -> MemoryStore {
        self.store.lock().await.clone()
    }
}

#[async_trait]
impl TransactionManager for MemoryTransactionManager {
    async fn begin(&self) -> SchedulerResult<Box<dyn Transaction>> {
        let guard = self.store.clone().lock_owned().await;
        let origin = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            origin,
            savepoints: Vec::new(),
            commits: self.commits.clone(),
        }))
    }
}

pub struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<MemoryStore>>,
    origin: MemoryStore,
    savepoints: Vec<MemoryStore>,
    commits: Arc<AtomicU64>,
}

impl MemoryTransaction {
    fn store(&mut self) -> SchedulerResult<&mut MemoryStore> {
        self.guard
            .as_deref_mut()
            .ok_or_else(|| SchedulerError::illegal_state("事务已结束"))
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            warn!("事务未提交即被释放，回滚全部修改");
            *guard = std::mem::take(&mut self.origin);
        }
    }
}

#[async_trait]
impl JobRepository for MemoryTransaction {
    async fn get_job(&mut self, job_id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.store()?.jobs.get(&job_id).cloned())
    }

    async fn find_jobs(&mut self, job_ids: &[i64]) -> SchedulerResult<Vec<Job>> {
        let store = self.store()?;
        Ok(job_ids
            .iter()
            .filter_map(|id| store.jobs.get(id).cloned())
            .collect())
    }

    async fn exists_job_name(&mut self, group: &str, job_name: &str) -> SchedulerResult<bool> {
        Ok(self
            .store()?
            .jobs
            .values()
            .any(|j| j.group == group && j.job_name == job_name))
    }

    async fn insert_job(&mut self, job: &Job) -> SchedulerResult<()> {
        let store = self.store()?;
        if store.jobs.contains_key(&job.job_id) {
            return Err(SchedulerError::conflict(format!("作业ID已存在: {}", job.job_id)));
        }
        store.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn update_job_state(
        &mut self,
        job_id: i64,
        to_state: JobState,
        from_state: JobState,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.job_mut(job_id) {
            Some(job) if job.job_state == from_state => {
                job.job_state = to_state;
                job.version += 1;
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn update_next_trigger_time(
        &mut self,
        job_id: i64,
        expect_next: Option<DateTime<Utc>>,
        last_trigger_time: Option<DateTime<Utc>>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.job_mut(job_id) {
            Some(job) if job.next_trigger_time == expect_next => {
                job.last_trigger_time = last_trigger_time;
                job.next_trigger_time = next_trigger_time;
                job.version += 1;
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn update_fixed_next_trigger_time(
        &mut self,
        job_id: i64,
        next_trigger_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.job_mut(job_id) {
            Some(job) if job.is_enabled() => {
                job.next_trigger_time = Some(next_trigger_time);
                job.version += 1;
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn delete_job(&mut self, job_id: i64) -> SchedulerResult<bool> {
        let store = self.store()?;
        match store.jobs.get(&job_id) {
            Some(job) if !job.is_enabled() => {
                store.jobs.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl DependRepository for MemoryTransaction {
    async fn insert_depends(&mut self, depends: &[JobDepend]) -> SchedulerResult<()> {
        let store = self.store()?;
        for depend in depends {
            let exists = store.depends.iter().any(|d| {
                d.parent_job_id == depend.parent_job_id && d.child_job_id == depend.child_job_id
            });
            if exists {
                return Err(SchedulerError::conflict(format!(
                    "依赖关系已存在: {} -> {}",
                    depend.parent_job_id, depend.child_job_id
                )));
            }
            store.depends.push(depend.clone());
        }
        Ok(())
    }

    async fn find_by_parent_job_id(&mut self, parent_job_id: i64) -> SchedulerResult<Vec<JobDepend>> {
        Ok(self
            .store()?
            .depends
            .iter()
            .filter(|d| d.parent_job_id == parent_job_id)
            .cloned()
            .collect())
    }

    async fn find_by_child_job_ids(&mut self, child_job_ids: &[i64]) -> SchedulerResult<Vec<JobDepend>> {
        Ok(self
            .store()?
            .depends
            .iter()
            .filter(|d| child_job_ids.contains(&d.child_job_id))
            .cloned()
            .collect())
    }

    async fn delete_depends_by_job_id(&mut self, job_id: i64) -> SchedulerResult<u64> {
        let store = self.store()?;
        let before = store.depends.len();
        store
            .depends
            .retain(|d| d.parent_job_id != job_id && d.child_job_id != job_id);
        Ok((before - store.depends.len()) as u64)
    }
}

#[async_trait]
impl InstanceRepository for MemoryTransaction {
    async fn get_instance(&mut self, instance_id: i64) -> SchedulerResult<Option<Instance>> {
        Ok(self.store()?.instances.get(&instance_id).cloned())
    }

    async fn lock_instance(&mut self, instance_id: i64) -> SchedulerResult<Option<Instance>> {
        // 事务持有整个存储的锁
        self.get_instance(instance_id).await
    }

    async fn insert_instance(&mut self, instance: &Instance) -> SchedulerResult<()> {
        let store = self.store()?;
        if store.instances.contains_key(&instance.instance_id) {
            return Err(SchedulerError::conflict(format!(
                "实例ID已存在: {}",
                instance.instance_id
            )));
        }
        if instance.run_type.is_unique_keyed() {
            let duplicated = store.instances.values().any(|e| {
                e.job_id == instance.job_id
                    && e.trigger_time == instance.trigger_time
                    && e.run_type == instance.run_type
            });
            if duplicated {
                return Err(SchedulerError::conflict(format!(
                    "实例唯一键冲突: {}, {}, {}",
                    instance.job_id, instance.trigger_time, instance.run_type
                )));
            }
        }
        store.instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn start_instance(&mut self, instance_id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        Ok(match self.store()?.instance_mut(instance_id) {
            Some(instance) if instance.run_state == RunState::Waiting => {
                instance.run_state = RunState::Running;
                if instance.run_start_time.is_none() {
                    instance.run_start_time = Some(now);
                }
                touch_instance(instance);
                true
            }
            _ => false,
        })
    }

    async fn terminate_instance(
        &mut self,
        instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
        run_end_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.instance_mut(instance_id) {
            Some(instance) if from_states.contains(&instance.run_state) => {
                instance.run_state = to_state;
                if to_state.is_terminal() {
                    instance.run_end_time = Some(run_end_time);
                }
                touch_instance(instance);
                true
            }
            _ => false,
        })
    }

    async fn update_instance_state(
        &mut self,
        instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.instance_mut(instance_id) {
            Some(instance) if from_states.contains(&instance.run_state) => {
                instance.run_state = to_state;
                if !to_state.is_terminal() {
                    instance.run_end_time = None;
                }
                touch_instance(instance);
                true
            }
            _ => false,
        })
    }

    async fn update_next_scan_time(
        &mut self,
        instance_id: i64,
        next_scan_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.instance_mut(instance_id) {
            Some(instance) => {
                instance.next_scan_time = Some(next_scan_time);
                touch_instance(instance);
                true
            }
            None => false,
        })
    }

    async fn update_retrying(
        &mut self,
        instance_id: i64,
        retrying: bool,
        to_state: RunState,
        from_state: RunState,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.instance_mut(instance_id) {
            Some(instance) if instance.run_state == from_state && instance.retrying != retrying => {
                instance.retrying = retrying;
                instance.run_state = to_state;
                touch_instance(instance);
                true
            }
            _ => false,
        })
    }

    async fn find_workflow_nodes(&mut self, workflow_instance_id: i64) -> SchedulerResult<Vec<Instance>> {
        Ok(self
            .store()?
            .instances
            .values()
            .filter(|e| {
                e.workflow_instance_id == Some(workflow_instance_id)
                    && e.instance_id != workflow_instance_id
            })
            .cloned()
            .collect())
    }

    async fn find_retry_children(&mut self, parent_instance_id: i64) -> SchedulerResult<Vec<Instance>> {
        Ok(self
            .store()?
            .instances
            .values()
            .filter(|e| e.is_retry() && e.parent_instance_id == Some(parent_instance_id))
            .cloned()
            .collect())
    }

    async fn delete_instance(&mut self, instance_id: i64) -> SchedulerResult<bool> {
        Ok(self.store()?.instances.remove(&instance_id).is_some())
    }
}

#[async_trait]
impl TaskRepository for MemoryTransaction {
    async fn get_task(&mut self, task_id: i64) -> SchedulerResult<Option<Task>> {
        Ok(self.store()?.tasks.get(&task_id).cloned())
    }

    async fn find_tasks(&mut self, instance_id: i64) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .store()?
            .tasks
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.task_no);
        Ok(tasks)
    }

    async fn insert_tasks(&mut self, tasks: &[Task]) -> SchedulerResult<()> {
        let store = self.store()?;
        if let Some(task) = tasks.iter().find(|t| store.tasks.contains_key(&t.task_id)) {
            return Err(SchedulerError::conflict(format!("任务ID已存在: {}", task.task_id)));
        }
        for task in tasks {
            store.tasks.insert(task.task_id, task.clone());
        }
        Ok(())
    }

    async fn start_task(
        &mut self,
        task_id: i64,
        worker: &Worker,
        start_request_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.task_mut(task_id) {
            Some(task) if task.execute_state == ExecuteState::Waiting => {
                task.execute_state = ExecuteState::Executing;
                task.worker = Some(worker.clone());
                task.start_request_id = Some(start_request_id.to_string());
                task.execute_start_time = Some(now);
                task.version += 1;
                true
            }
            _ => false,
        })
    }

    async fn check_start_idempotent(
        &mut self,
        task_id: i64,
        worker: &Worker,
        start_request_id: &str,
    ) -> SchedulerResult<bool> {
        Ok(self.store()?.tasks.get(&task_id).is_some_and(|task| {
            task.execute_state == ExecuteState::Executing
                && task.worker.as_ref() == Some(worker)
                && task.start_request_id.as_deref() == Some(start_request_id)
        }))
    }

    async fn terminate_task(
        &mut self,
        task_id: i64,
        worker: Option<&Worker>,
        to_state: ExecuteState,
        from_state: ExecuteState,
        execute_end_time: Option<DateTime<Utc>>,
        error_msg: Option<&str>,
    ) -> SchedulerResult<bool> {
        let Some(task) = self.store()?.task_mut(task_id) else {
            return Ok(false);
        };
        if task.execute_state != from_state {
            return Ok(false);
        }
        if worker.is_some_and(|w| task.worker.as_ref() != Some(w)) {
            debug!("任务 {} 的Worker不一致: {:?}", task_id, task.worker);
            return Ok(false);
        }
        task.execute_state = to_state;
        task.execute_end_time = execute_end_time;
        if let Some(msg) = error_msg {
            task.error_msg = Some(msg.to_string());
        }
        task.version += 1;
        Ok(true)
    }

    async fn update_tasks_state(
        &mut self,
        instance_id: i64,
        to_state: ExecuteState,
        from_states: &[ExecuteState],
        execute_end_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<u64> {
        let mut affected = 0;
        for task in self.store()?.tasks.values_mut() {
            if task.instance_id == instance_id && from_states.contains(&task.execute_state) {
                task.execute_state = to_state;
                task.execute_end_time = execute_end_time;
                task.version += 1;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn force_change_tasks_state(
        &mut self,
        instance_id: i64,
        to_state: ExecuteState,
    ) -> SchedulerResult<u64> {
        let mut affected = 0;
        let end_time = to_state.is_terminal().then(Utc::now);
        for task in self.store()?.tasks.values_mut() {
            if task.instance_id == instance_id {
                task.execute_state = to_state;
                task.execute_end_time = end_time;
                task.dispatch_failed_count = 0;
                task.start_request_id = None;
                task.version += 1;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn increment_dispatch_failed_count(
        &mut self,
        task_id: i64,
        current_count: i32,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.task_mut(task_id) {
            Some(task)
                if task.execute_state == ExecuteState::Waiting
                    && task.dispatch_failed_count == current_count =>
            {
                task.dispatch_failed_count += 1;
                task.version += 1;
                true
            }
            _ => false,
        })
    }

    async fn savepoint_task(
        &mut self,
        task_id: i64,
        worker: &Worker,
        execute_snapshot: &str,
    ) -> SchedulerResult<bool> {
        Ok(match self.store()?.task_mut(task_id) {
            Some(task) if task.is_executing() && task.worker.as_ref() == Some(worker) => {
                task.execute_snapshot = Some(execute_snapshot.to_string());
                task.version += 1;
                true
            }
            _ => false,
        })
    }

    async fn delete_tasks(&mut self, instance_id: i64) -> SchedulerResult<u64> {
        let store = self.store()?;
        let before = store.tasks.len();
        store.tasks.retain(|_, t| t.instance_id != instance_id);
        Ok((before - store.tasks.len()) as u64)
    }
}

#[async_trait]
impl WorkflowRepository for MemoryTransaction {
    async fn insert_edges(&mut self, edges: &[WorkflowEdge]) -> SchedulerResult<()> {
        let store = self.store()?;
        for edge in edges {
            let exists = store.edges.iter().any(|e| {
                e.workflow_instance_id == edge.workflow_instance_id
                    && e.pre_node == edge.pre_node
                    && e.cur_node == edge.cur_node
            });
            if exists {
                return Err(SchedulerError::conflict(format!(
                    "工作流边已存在: {}, {} -> {}",
                    edge.workflow_instance_id, edge.pre_node, edge.cur_node
                )));
            }
            store.edges.push(edge.clone());
        }
        Ok(())
    }

    async fn find_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<Vec<WorkflowEdge>> {
        let mut edges: Vec<WorkflowEdge> = self
            .store()?
            .edges
            .iter()
            .filter(|e| e.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect();
        edges.sort_by_key(|e| e.sequence);
        Ok(edges)
    }

    async fn update_node_state(
        &mut self,
        workflow_instance_id: i64,
        cur_node: &DagNode,
        to_state: RunState,
        from_states: &[RunState],
        instance_id: Option<i64>,
    ) -> SchedulerResult<u64> {
        let mut affected = 0;
        for edge in self.store()?.edges.iter_mut() {
            if edge.workflow_instance_id == workflow_instance_id
                && &edge.cur_node == cur_node
                && from_states.contains(&edge.run_state)
            {
                edge.run_state = to_state;
                if instance_id.is_some() {
                    edge.instance_id = instance_id;
                }
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn update_edges_state(
        &mut self,
        workflow_instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<u64> {
        let mut affected = 0;
        for edge in self.store()?.edges.iter_mut() {
            if edge.workflow_instance_id == workflow_instance_id
                && from_states.contains(&edge.run_state)
            {
                edge.run_state = to_state;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn resume_waiting_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<u64> {
        let mut affected = 0;
        for edge in self.store()?.edges.iter_mut() {
            if edge.workflow_instance_id == workflow_instance_id
                && edge.run_state == RunState::Paused
                && edge.instance_id.is_none()
            {
                edge.run_state = RunState::Waiting;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn replace_node_instance(
        &mut self,
        workflow_instance_id: i64,
        cur_node: &DagNode,
        from_instance_id: i64,
        to_instance_id: i64,
    ) -> SchedulerResult<u64> {
        let mut affected = 0;
        for edge in self.store()?.edges.iter_mut() {
            if edge.workflow_instance_id == workflow_instance_id
                && &edge.cur_node == cur_node
                && edge.run_state == RunState::Running
                && edge.instance_id == Some(from_instance_id)
            {
                edge.instance_id = Some(to_instance_id);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<u64> {
        let store = self.store()?;
        let before = store.edges.len();
        store
            .edges
            .retain(|e| e.workflow_instance_id != workflow_instance_id);
        Ok((before - store.edges.len()) as u64)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn savepoint(&mut self) -> SchedulerResult<Savepoint> {
        let snapshot = self.store()?.clone();
        self.savepoints.push(snapshot);
        Ok(Savepoint(self.savepoints.len() as u32))
    }

    async fn release_savepoint(&mut self, savepoint: Savepoint) -> SchedulerResult<()> {
        let depth = savepoint.0 as usize;
        if depth == 0 || depth > self.savepoints.len() {
            return Err(SchedulerError::illegal_state(format!("无效的保存点: {savepoint:?}")));
        }
        self.savepoints.truncate(depth - 1);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, savepoint: Savepoint) -> SchedulerResult<()> {
        let depth = savepoint.0 as usize;
        if depth == 0 || depth > self.savepoints.len() {
            return Err(SchedulerError::illegal_state(format!("无效的保存点: {savepoint:?}")));
        }
        // 与SQL语义一致：回滚后保存点仍然有效
        self.savepoints.truncate(depth);
        let snapshot = self.savepoints[depth - 1].clone();
        *self.store()? = snapshot;
        Ok(())
    }

    async fn commit(&mut self) -> SchedulerResult<()> {
        let guard = self
            .guard
            .take()
            .ok_or_else(|| SchedulerError::illegal_state("事务已结束"))?;
        self.savepoints.clear();
        self.commits.fetch_add(1, Ordering::SeqCst);
        drop(guard);
        Ok(())
    }

    async fn rollback(&mut self) -> SchedulerResult<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| SchedulerError::illegal_state("事务已结束"))?;
        *guard = std::mem::take(&mut self.origin);
        self.savepoints.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::RunType;

    fn instance(id: i64, run_type: RunType, trigger_time: DateTime<Utc>) -> Instance {
        Instance::new(id, 1, run_type, trigger_time, 0)
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let manager = MemoryTransactionManager::new();
        let now = Utc::now();

        let mut tx = manager.begin().await.unwrap();
        tx.insert_instance(&instance(1, RunType::Manual, now)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = manager.begin().await.unwrap();
        assert!(tx.start_instance(1, now).await.unwrap());
        tx.rollback().await.unwrap();

        let store = manager.snapshot().await;
        assert_eq!(store.instances[&1].run_state, RunState::Waiting);
        assert_eq!(manager.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let manager = MemoryTransactionManager::new();
        {
            let mut tx = manager.begin().await.unwrap();
            tx.insert_instance(&instance(1, RunType::Manual, Utc::now()))
                .await
                .unwrap();
            assert!(manager.in_transaction());
        }
        assert!(!manager.in_transaction());
        assert!(manager.snapshot().await.instances.is_empty());
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_outer_writes() {
        let manager = MemoryTransactionManager::new();
        let now = Utc::now();
        let mut tx = manager.begin().await.unwrap();
        tx.insert_instance(&instance(1, RunType::Manual, now)).await.unwrap();

        let sp = tx.savepoint().await.unwrap();
        tx.insert_instance(&instance(2, RunType::Manual, now)).await.unwrap();
        tx.rollback_to_savepoint(sp).await.unwrap();
        tx.release_savepoint(sp).await.unwrap();
        tx.commit().await.unwrap();

        let store = manager.snapshot().await;
        assert!(store.instances.contains_key(&1));
        assert!(!store.instances.contains_key(&2));
    }

    #[tokio::test]
    async fn test_unique_key_only_for_schedule_and_depend() {
        let manager = MemoryTransactionManager::new();
        let now = Utc::now();
        let mut tx = manager.begin().await.unwrap();
        tx.insert_instance(&instance(1, RunType::Schedule, now)).await.unwrap();
        let err = tx
            .insert_instance(&instance(2, RunType::Schedule, now))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));

        tx.insert_instance(&instance(3, RunType::Manual, now)).await.unwrap();
        tx.insert_instance(&instance(4, RunType::Manual, now)).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_task_cas_transitions() {
        let manager = MemoryTransactionManager::new();
        let worker = Worker::new("default", "w1", "127.0.0.1", 8080);
        let other = Worker::new("default", "w2", "127.0.0.1", 8081);
        let mut tx = manager.begin().await.unwrap();
        tx.insert_tasks(&[Task::new(10, 1, 1, 1, None, None)]).await.unwrap();

        let now = Utc::now();
        assert!(tx.start_task(10, &worker, "req-1", now).await.unwrap());
        assert!(!tx.start_task(10, &worker, "req-1", now).await.unwrap());
        assert!(tx.check_start_idempotent(10, &worker, "req-1").await.unwrap());
        assert!(!tx.check_start_idempotent(10, &worker, "req-2").await.unwrap());

        let stopped = tx
            .terminate_task(10, Some(&other), ExecuteState::Completed, ExecuteState::Executing, Some(now), None)
            .await
            .unwrap();
        assert!(!stopped);
        let stopped = tx
            .terminate_task(10, Some(&worker), ExecuteState::Completed, ExecuteState::Executing, Some(now), None)
            .await
            .unwrap();
        assert!(stopped);
        tx.commit().await.unwrap();
    }
}
