use async_trait::async_trait;

use scheduler_core::{DispatchConfig, SchedulerResult};

use crate::entities::Job;
use crate::params::{ExecuteTaskParam, SplitJobParam};
use crate::worker::Worker;

/// Supervisor调用Worker的远程接口
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// 拆分作业，返回每个任务的参数。作业配置无效时返回错误
    async fn split_job(&self, param: &SplitJobParam) -> SchedulerResult<Vec<String>>;

    /// 校验作业配置
    async fn verify_job(&self, job: &Job) -> SchedulerResult<()>;

    /// 查询Worker上是否存在该任务
    async fn exists_task(&self, worker: &Worker, task_id: i64) -> SchedulerResult<bool>;

    /// 投递任务指令，返回是否被Worker接收
    async fn dispatch(&self, group: &str, params: &[ExecuteTaskParam]) -> SchedulerResult<bool>;
}

/// 按作业分组提供Supervisor认证令牌
pub trait SupervisorTokenProvider: Send + Sync {
    fn supervisor_token(&self, group: &str) -> Option<String>;
}

/// 从配置读取的令牌
#[derive(Debug, Clone, Default)]
pub struct ConfiguredTokenProvider {
    config: DispatchConfig,
}

impl ConfiguredTokenProvider {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }
}

impl SupervisorTokenProvider for ConfiguredTokenProvider {
    fn supervisor_token(&self, group: &str) -> Option<String> {
        self.config.token_for(group).map(str::to_string)
    }
}
