use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{Instance, Job, Task};
use crate::value_objects::{ExecuteState, JobType, Operation, RouteStrategy};
use crate::worker::Worker;

/// 发送给Worker的任务指令
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteTaskParam {
    pub operation: Operation,
    pub task_id: i64,
    pub instance_id: i64,
    pub workflow_instance_id: Option<i64>,
    pub trigger_time: DateTime<Utc>,
    pub job_id: i64,
    pub job_type: JobType,
    pub route_strategy: RouteStrategy,
    /// 目标Worker，None表示由传输层按路由策略选择
    pub worker: Option<Worker>,
    /// 作业分组范围内的Supervisor认证令牌
    pub supervisor_token: Option<String>,
}

impl ExecuteTaskParam {
    pub fn new(
        operation: Operation,
        job: &Job,
        instance: &Instance,
        task_id: i64,
        worker: Option<Worker>,
        supervisor_token: Option<String>,
    ) -> Self {
        Self {
            operation,
            task_id,
            instance_id: instance.instance_id,
            workflow_instance_id: instance.workflow_instance_id,
            trigger_time: instance.trigger_time,
            job_id: job.job_id,
            job_type: job.job_type,
            route_strategy: job.route_strategy,
            worker,
            supervisor_token,
        }
    }
}

/// 请求Worker拆分作业的参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitJobParam {
    pub group: String,
    pub job_id: i64,
    pub job_type: JobType,
    /// 执行器引用，工作流节点为节点名
    pub job_executor: String,
    pub job_param: Option<String>,
    pub route_strategy: RouteStrategy,
    /// 当前分组可用的Worker数量
    pub worker_count: usize,
    pub supervisor_token: Option<String>,
}

impl SplitJobParam {
    pub fn new(job: &Job, job_executor: &str, worker_count: usize) -> Self {
        Self {
            group: job.group.clone(),
            job_id: job.job_id,
            job_type: job.job_type,
            job_executor: job_executor.to_string(),
            job_param: job.job_param.clone(),
            route_strategy: job.route_strategy,
            worker_count,
            supervisor_token: None,
        }
    }
}

/// Worker启动任务的请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartTaskParam {
    pub task_id: i64,
    pub instance_id: i64,
    pub workflow_instance_id: Option<i64>,
    pub worker: Worker,
    /// 调用方生成的请求ID，用于幂等
    pub start_request_id: String,
}

/// 启动任务的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartTaskResult {
    pub success: bool,
    pub message: Option<String>,
    pub task_id: i64,
    pub task_param: Option<String>,
    pub execute_snapshot: Option<String>,
}

impl StartTaskResult {
    pub fn success(task: &Task) -> Self {
        Self {
            success: true,
            message: None,
            task_id: task.task_id,
            task_param: task.task_param.clone(),
            execute_snapshot: task.execute_snapshot.clone(),
        }
    }

    pub fn failure<S: Into<String>>(task_id: i64, message: S) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            task_id,
            task_param: None,
            execute_snapshot: None,
        }
    }
}

/// Worker上报任务停止（完成/失败/暂停/回退）的请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopTaskParam {
    pub task_id: i64,
    pub instance_id: i64,
    pub workflow_instance_id: Option<i64>,
    pub worker: Worker,
    pub operation: Operation,
    pub to_state: ExecuteState,
    pub error_msg: Option<String>,
}
