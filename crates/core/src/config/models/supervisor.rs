use serde::{Deserialize, Serialize};

/// Supervisor核心参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// 单个实例允许拆分的最大任务数
    pub maximum_split_task_size: usize,
    /// 作业依赖的最大层级
    pub maximum_job_depends_depth: usize,
    /// 作业允许配置的最大重试次数
    pub maximum_job_retry_count: i32,
    /// 任务分发失败次数阈值，达到后任务终止为DISPATCH_FAILED
    pub task_dispatch_failed_count_threshold: i32,
    /// Worker关闭时回退任务的实例延迟扫描时间（毫秒）
    pub shutdown_task_delay_resume_ms: i64,
    /// 实例本地锁分片数
    pub instance_lock_shards: usize,
    /// 批量处理大小
    pub process_batch_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            maximum_split_task_size: 1000,
            maximum_job_depends_depth: 20,
            maximum_job_retry_count: 5,
            task_dispatch_failed_count_threshold: 3,
            shutdown_task_delay_resume_ms: 600_000, // 10分钟
            instance_lock_shards: 64,
            process_batch_size: 200,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.maximum_split_task_size == 0 {
            return Err(anyhow::anyhow!("最大拆分任务数必须大于0"));
        }

        if self.maximum_job_depends_depth == 0 {
            return Err(anyhow::anyhow!("最大依赖层级必须大于0"));
        }

        if self.maximum_job_retry_count < 0 {
            return Err(anyhow::anyhow!("最大重试次数不能小于0"));
        }

        if self.task_dispatch_failed_count_threshold <= 0 {
            return Err(anyhow::anyhow!("任务分发失败阈值必须大于0"));
        }

        if self.shutdown_task_delay_resume_ms < 0 {
            return Err(anyhow::anyhow!("关闭任务延迟恢复时间不能小于0"));
        }

        if self.instance_lock_shards == 0 {
            return Err(anyhow::anyhow!("实例锁分片数必须大于0"));
        }

        if self.process_batch_size == 0 {
            return Err(anyhow::anyhow!("批量处理大小必须大于0"));
        }

        Ok(())
    }
}
