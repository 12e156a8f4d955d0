use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::DagNode;
use crate::value_objects::{
    ExecuteState, JobState, JobType, RetryType, RouteStrategy, RunState, RunType, TriggerType,
};
use crate::worker::Worker;

/// 作业定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: i64,
    /// Worker分组
    pub group: String,
    pub job_name: String,
    pub job_type: JobType,
    pub job_state: JobState,
    /// 执行器引用，工作流作业保存DAG表达式
    pub job_executor: String,
    pub job_param: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_value: String,
    pub route_strategy: RouteStrategy,
    pub retry_type: RetryType,
    pub retry_count: i32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: i64,
    pub last_trigger_time: Option<DateTime<Utc>>,
    pub next_trigger_time: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_enabled(&self) -> bool {
        self.job_state == JobState::Enabled
    }

    pub fn is_workflow(&self) -> bool {
        self.job_type == JobType::Workflow
    }

    /// 是否配置了重试
    pub fn is_retryable(&self) -> bool {
        self.retry_type != RetryType::None && self.retry_count > 0
    }

    /// 实例以 `run_state` 结束且已重试 `retried_count` 次后是否还能重试
    pub fn retryable(&self, run_state: RunState, retried_count: i32) -> bool {
        run_state.is_failure() && self.is_retryable() && retried_count < self.retry_count
    }

    /// 第 `retried_count` 次重试的触发时间，间隔按次数平方递增
    pub fn compute_retry_trigger_time(&self, retried_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let factor = i64::from(retried_count).pow(2);
        let delay = self.retry_interval_ms.max(0).saturating_mul(factor);
        now.checked_add_signed(chrono::Duration::milliseconds(delay))
            .unwrap_or(now)
    }
}

/// 作业的一次执行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub instance_id: i64,
    /// 重试链/依赖链的根实例
    pub root_instance_id: Option<i64>,
    pub parent_instance_id: Option<i64>,
    /// 工作流主实例ID，非工作流为None
    pub workflow_instance_id: Option<i64>,
    pub job_id: i64,
    pub trigger_time: DateTime<Utc>,
    pub run_type: RunType,
    pub run_state: RunState,
    pub run_start_time: Option<DateTime<Utc>>,
    pub run_end_time: Option<DateTime<Utc>>,
    pub retried_count: i32,
    /// 是否存在进行中的重试实例
    pub retrying: bool,
    /// 工作流节点实例对应的DAG节点
    pub workflow_node: Option<DagNode>,
    pub next_scan_time: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        instance_id: i64,
        job_id: i64,
        run_type: RunType,
        trigger_time: DateTime<Utc>,
        retried_count: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            root_instance_id: None,
            parent_instance_id: None,
            workflow_instance_id: None,
            job_id,
            trigger_time,
            run_type,
            run_state: RunState::Waiting,
            run_start_time: None,
            run_end_time: None,
            retried_count,
            retrying: false,
            workflow_node: None,
            next_scan_time: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// 由父实例派生：继承根实例，父实例指向重试链的原始实例
    pub fn derive(
        parent: &Instance,
        instance_id: i64,
        workflow_instance_id: Option<i64>,
        job_id: i64,
        run_type: RunType,
        trigger_time: DateTime<Utc>,
        retried_count: i32,
    ) -> Self {
        let mut instance = Self::new(instance_id, job_id, run_type, trigger_time, retried_count);
        instance.root_instance_id = Some(parent.root_id());
        instance.parent_instance_id = Some(parent.retry_original_id());
        instance.workflow_instance_id = workflow_instance_id;
        instance
    }

    pub fn is_workflow(&self) -> bool {
        self.workflow_instance_id.is_some()
    }

    /// 工作流主实例
    pub fn is_workflow_lead(&self) -> bool {
        self.workflow_instance_id == Some(self.instance_id)
    }

    /// 工作流节点实例
    pub fn is_workflow_node(&self) -> bool {
        self.workflow_instance_id
            .is_some_and(|id| id != self.instance_id)
    }

    pub fn is_retry(&self) -> bool {
        self.run_type == RunType::Retry
    }

    /// 重试链/依赖链的根实例ID
    pub fn root_id(&self) -> i64 {
        self.root_instance_id
            .or(self.parent_instance_id)
            .unwrap_or(self.instance_id)
    }

    /// 重试链的原始实例ID，重试实例的父实例即原始实例
    pub fn retry_original_id(&self) -> i64 {
        if self.is_retry() {
            self.parent_instance_id.unwrap_or(self.instance_id)
        } else {
            self.instance_id
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.run_state.is_terminal()
    }

    /// 加锁使用的键：工作流节点与主实例共用一把锁
    pub fn lock_id(&self) -> i64 {
        self.workflow_instance_id.unwrap_or(self.instance_id)
    }

    pub fn mark_terminated(&mut self, run_state: RunState, run_end_time: DateTime<Utc>) {
        self.run_state = run_state;
        self.run_end_time = Some(run_end_time);
    }
}

/// 实例内的一个任务分片
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: i64,
    pub instance_id: i64,
    /// 分片序号，从1开始
    pub task_no: i32,
    pub task_count: i32,
    pub task_param: Option<String>,
    pub execute_state: ExecuteState,
    /// 广播任务在拆分时固定Worker，其它任务在启动时写入
    pub worker: Option<Worker>,
    pub start_request_id: Option<String>,
    pub dispatch_failed_count: i32,
    pub execute_start_time: Option<DateTime<Utc>>,
    pub execute_end_time: Option<DateTime<Utc>>,
    pub execute_snapshot: Option<String>,
    pub error_msg: Option<String>,
    pub version: i32,
}

impl Task {
    pub fn new(
        task_id: i64,
        instance_id: i64,
        task_no: i32,
        task_count: i32,
        task_param: Option<String>,
        worker: Option<Worker>,
    ) -> Self {
        Self {
            task_id,
            instance_id,
            task_no,
            task_count,
            task_param,
            execute_state: ExecuteState::Waiting,
            worker,
            start_request_id: None,
            dispatch_failed_count: 0,
            execute_start_time: None,
            execute_end_time: None,
            execute_snapshot: None,
            error_msg: None,
            version: 1,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.execute_state == ExecuteState::Executing
    }

    pub fn is_waiting(&self) -> bool {
        self.execute_state == ExecuteState::Waiting
    }
}

/// 工作流实例中的一条边，状态即目标节点的状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEdge {
    pub workflow_instance_id: i64,
    pub pre_node: DagNode,
    pub cur_node: DagNode,
    /// 用于推导节点实例唯一触发时间的序号
    pub sequence: i32,
    pub run_state: RunState,
    /// 目标节点的实例ID，启动后写入
    pub instance_id: Option<i64>,
}

impl WorkflowEdge {
    pub fn new(workflow_instance_id: i64, pre_node: DagNode, cur_node: DagNode, sequence: i32) -> Self {
        Self {
            workflow_instance_id,
            pre_node,
            cur_node,
            sequence,
            run_state: RunState::Waiting,
            instance_id: None,
        }
    }
}

/// 作业依赖关系（父作业完成后触发子作业）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDepend {
    pub parent_job_id: i64,
    pub child_job_id: i64,
    /// 同一子作业多个父作业之间的序号，用于错开触发时间
    pub sequence: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(retry_type: RetryType, retry_count: i32) -> Job {
        let now = Utc::now();
        Job {
            job_id: 1,
            group: "default".to_string(),
            job_name: "job".to_string(),
            job_type: JobType::General,
            job_state: JobState::Enabled,
            job_executor: "executor".to_string(),
            job_param: None,
            trigger_type: TriggerType::Cron,
            trigger_value: "0 * * * * *".to_string(),
            route_strategy: RouteStrategy::RoundRobin,
            retry_type,
            retry_count,
            retry_interval_ms: 1000,
            last_trigger_time: None,
            next_trigger_time: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_job_retryable() {
        let failed = job(RetryType::Failed, 2);
        assert!(failed.retryable(RunState::Canceled, 0));
        assert!(failed.retryable(RunState::Canceled, 1));
        assert!(!failed.retryable(RunState::Canceled, 2));
        assert!(!failed.retryable(RunState::Completed, 0));
        assert!(!job(RetryType::None, 3).retryable(RunState::Canceled, 0));
    }

    #[test]
    fn test_retry_backoff_is_quadratic() {
        let now = Utc::now();
        let job = job(RetryType::All, 3);
        assert_eq!(job.compute_retry_trigger_time(1, now), now + chrono::Duration::seconds(1));
        assert_eq!(job.compute_retry_trigger_time(3, now), now + chrono::Duration::seconds(9));
    }

    #[test]
    fn test_instance_workflow_roles() {
        let now = Utc::now();
        let mut lead = Instance::new(10, 1, RunType::Schedule, now, 0);
        lead.workflow_instance_id = Some(10);
        assert!(lead.is_workflow());
        assert!(lead.is_workflow_lead());
        assert!(!lead.is_workflow_node());
        assert_eq!(lead.lock_id(), 10);

        let mut node = Instance::new(11, 1, RunType::Schedule, now, 0);
        node.workflow_instance_id = Some(10);
        node.root_instance_id = Some(10);
        assert!(node.is_workflow_node());
        assert_eq!(node.lock_id(), 10);
        assert_eq!(node.root_id(), 10);

        let plain = Instance::new(12, 1, RunType::Manual, now, 0);
        assert!(!plain.is_workflow());
        assert_eq!(plain.lock_id(), 12);
        assert_eq!(plain.root_id(), 12);
    }

    #[test]
    fn test_derive_from_retry_points_to_original() {
        let now = Utc::now();
        let original = Instance::new(30, 1, RunType::Schedule, now, 0);
        let retry1 = Instance::derive(&original, 31, None, 1, RunType::Retry, now, 1);
        assert_eq!(retry1.root_instance_id, Some(30));
        assert_eq!(retry1.parent_instance_id, Some(30));
        assert_eq!(retry1.retry_original_id(), 30);

        let retry2 = Instance::derive(&retry1, 32, None, 1, RunType::Retry, now, 2);
        assert_eq!(retry2.root_instance_id, Some(30));
        assert_eq!(retry2.parent_instance_id, Some(30));
        assert_eq!(retry2.retried_count, 2);
    }

    #[test]
    fn test_root_id_falls_back_to_parent() {
        let mut instance = Instance::new(20, 1, RunType::Depend, Utc::now(), 0);
        instance.parent_instance_id = Some(5);
        assert_eq!(instance.root_id(), 5);
    }
}
