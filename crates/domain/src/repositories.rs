//! 持久化接口
//!
//! 所有读写都发生在 [`Transaction`] 内。状态变更均为CAS语义：
//! 只有当前状态在 `from` 列表中才会更新，返回值表示是否（或多少行）被更新，
//! 未更新即视为已被其它调度节点处理，不作为错误。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scheduler_core::SchedulerResult;

use crate::dag::DagNode;
use crate::entities::{Instance, Job, JobDepend, Task, WorkflowEdge};
use crate::value_objects::{ExecuteState, JobState, RunState};
use crate::worker::Worker;

#[async_trait]
pub trait JobRepository: Send {
    async fn get_job(&mut self, job_id: i64) -> SchedulerResult<Option<Job>>;

    async fn find_jobs(&mut self, job_ids: &[i64]) -> SchedulerResult<Vec<Job>>;

    async fn exists_job_name(&mut self, group: &str, job_name: &str) -> SchedulerResult<bool>;

    async fn insert_job(&mut self, job: &Job) -> SchedulerResult<()>;

    async fn update_job_state(
        &mut self,
        job_id: i64,
        to_state: JobState,
        from_state: JobState,
    ) -> SchedulerResult<bool>;

    /// 触发后推进下次触发时间，以 `expect_next` 为CAS条件
    async fn update_next_trigger_time(
        &mut self,
        job_id: i64,
        expect_next: Option<DateTime<Utc>>,
        last_trigger_time: Option<DateTime<Utc>>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<bool>;

    /// 固定频率/延迟作业在实例结束后写入下次触发时间，仅当作业仍启用时生效
    async fn update_fixed_next_trigger_time(
        &mut self,
        job_id: i64,
        next_trigger_time: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 只能删除已停用的作业
    async fn delete_job(&mut self, job_id: i64) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait DependRepository: Send {
    async fn insert_depends(&mut self, depends: &[JobDepend]) -> SchedulerResult<()>;

    async fn find_by_parent_job_id(&mut self, parent_job_id: i64) -> SchedulerResult<Vec<JobDepend>>;

    async fn find_by_child_job_ids(&mut self, child_job_ids: &[i64]) -> SchedulerResult<Vec<JobDepend>>;

    /// 删除作业作为父或子的全部依赖
    async fn delete_depends_by_job_id(&mut self, job_id: i64) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait InstanceRepository: Send {
    async fn get_instance(&mut self, instance_id: i64) -> SchedulerResult<Option<Instance>>;

    /// 在事务内锁定实例行并返回当前数据
    async fn lock_instance(&mut self, instance_id: i64) -> SchedulerResult<Option<Instance>>;

    /// 违反 `(job_id, trigger_time, run_type)` 唯一约束时返回 `SchedulerError::Conflict`
    async fn insert_instance(&mut self, instance: &Instance) -> SchedulerResult<()>;

    /// WAITING -> RUNNING，并记录开始时间
    async fn start_instance(&mut self, instance_id: i64, now: DateTime<Utc>) -> SchedulerResult<bool>;

    async fn terminate_instance(
        &mut self,
        instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
        run_end_time: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn update_instance_state(
        &mut self,
        instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<bool>;

    async fn update_next_scan_time(
        &mut self,
        instance_id: i64,
        next_scan_time: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 设置原始实例的重试标记，同时把状态由 `from_state` 改为 `to_state`
    async fn update_retrying(
        &mut self,
        instance_id: i64,
        retrying: bool,
        to_state: RunState,
        from_state: RunState,
    ) -> SchedulerResult<bool>;

    /// 工作流主实例下的全部节点实例（不含主实例）
    async fn find_workflow_nodes(&mut self, workflow_instance_id: i64) -> SchedulerResult<Vec<Instance>>;

    /// 以指定实例为父实例的重试实例
    async fn find_retry_children(&mut self, parent_instance_id: i64) -> SchedulerResult<Vec<Instance>>;

    async fn delete_instance(&mut self, instance_id: i64) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait TaskRepository: Send {
    async fn get_task(&mut self, task_id: i64) -> SchedulerResult<Option<Task>>;

    async fn find_tasks(&mut self, instance_id: i64) -> SchedulerResult<Vec<Task>>;

    async fn insert_tasks(&mut self, tasks: &[Task]) -> SchedulerResult<()>;

    /// WAITING -> EXECUTING，写入Worker与启动请求ID
    async fn start_task(
        &mut self,
        task_id: i64,
        worker: &Worker,
        start_request_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 任务已由同一Worker以同一请求ID启动
    async fn check_start_idempotent(
        &mut self,
        task_id: i64,
        worker: &Worker,
        start_request_id: &str,
    ) -> SchedulerResult<bool>;

    /// 单个任务的状态变更，`worker` 不为None时要求当前Worker一致
    async fn terminate_task(
        &mut self,
        task_id: i64,
        worker: Option<&Worker>,
        to_state: ExecuteState,
        from_state: ExecuteState,
        execute_end_time: Option<DateTime<Utc>>,
        error_msg: Option<&str>,
    ) -> SchedulerResult<bool>;

    /// 批量变更实例下处于 `from_states` 的任务
    async fn update_tasks_state(
        &mut self,
        instance_id: i64,
        to_state: ExecuteState,
        from_states: &[ExecuteState],
        execute_end_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<u64>;

    /// 强制变更实例下所有任务的状态，并重置分发失败次数与启动请求ID
    async fn force_change_tasks_state(
        &mut self,
        instance_id: i64,
        to_state: ExecuteState,
    ) -> SchedulerResult<u64>;

    /// 以当前计数为CAS条件递增分发失败次数
    async fn increment_dispatch_failed_count(
        &mut self,
        task_id: i64,
        current_count: i32,
    ) -> SchedulerResult<bool>;

    async fn savepoint_task(
        &mut self,
        task_id: i64,
        worker: &Worker,
        execute_snapshot: &str,
    ) -> SchedulerResult<bool>;

    async fn delete_tasks(&mut self, instance_id: i64) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait WorkflowRepository: Send {
    async fn insert_edges(&mut self, edges: &[WorkflowEdge]) -> SchedulerResult<()>;

    async fn find_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<Vec<WorkflowEdge>>;

    /// 更新指向 `cur_node` 的所有边，`instance_id` 不为None时一并写入
    async fn update_node_state(
        &mut self,
        workflow_instance_id: i64,
        cur_node: &DagNode,
        to_state: RunState,
        from_states: &[RunState],
        instance_id: Option<i64>,
    ) -> SchedulerResult<u64>;

    /// 更新工作流中所有处于 `from_states` 的边
    async fn update_edges_state(
        &mut self,
        workflow_instance_id: i64,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedulerResult<u64>;

    /// 恢复工作流时把未启动的已暂停节点改回WAITING
    async fn resume_waiting_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<u64>;

    /// 节点重试后把边指向新的实例
    async fn replace_node_instance(
        &mut self,
        workflow_instance_id: i64,
        cur_node: &DagNode,
        from_instance_id: i64,
        to_instance_id: i64,
    ) -> SchedulerResult<u64>;

    async fn delete_edges(&mut self, workflow_instance_id: i64) -> SchedulerResult<u64>;
}

/// 事务内的保存点，可以独立回滚
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(pub u32);

/// 一次存储事务，提交或回滚后不可再使用
#[async_trait]
pub trait Transaction:
    JobRepository + DependRepository + InstanceRepository + TaskRepository + WorkflowRepository + Send
{
    async fn savepoint(&mut self) -> SchedulerResult<Savepoint>;

    async fn release_savepoint(&mut self, savepoint: Savepoint) -> SchedulerResult<()>;

    async fn rollback_to_savepoint(&mut self, savepoint: Savepoint) -> SchedulerResult<()>;

    async fn commit(&mut self) -> SchedulerResult<()>;

    async fn rollback(&mut self) -> SchedulerResult<()>;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> SchedulerResult<Box<dyn Transaction>>;
}

/// 分布式ID生成器
pub trait IdGenerator: Send + Sync {
    fn generate_id(&self) -> i64;
}
