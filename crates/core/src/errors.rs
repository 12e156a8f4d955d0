use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("数据冲突: {0}")]
    Conflict(String),

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("实例未找到: {id}")]
    InstanceNotFound { id: i64 },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("工作流实例不一致: 期望={expect:?}, 实际={actual:?}, 实例={instance_id}")]
    InconsistentWorkflow {
        instance_id: i64,
        expect: Option<i64>,
        actual: Option<i64>,
    },

    #[error("非法状态: {0}")]
    IllegalState(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的触发配置 {trigger_type}: {value} - {message}")]
    InvalidTrigger {
        trigger_type: String,
        value: String,
        message: String,
    },

    #[error("检测到循环依赖: 作业 {job_id}")]
    CircularDependency { job_id: i64 },

    #[error("依赖层级过深: {depth} 超过最大值 {max}")]
    DependencyTooDeep { depth: usize, max: usize },

    #[error("无效的作业配置: {0}")]
    InvalidJobConfig(String),

    #[error("拆分任务失败: {0}")]
    SplitJob(String),

    #[error("分组 {group} 没有可用的Worker")]
    NoAvailableWorker { group: String },

    #[error("网络错误: {0}")]
    Network(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn illegal_state<S: Into<String>>(message: S) -> Self {
        Self::IllegalState(message.into())
    }

    pub fn job_not_found(id: i64) -> Self {
        Self::JobNotFound { id }
    }

    pub fn instance_not_found(id: i64) -> Self {
        Self::InstanceNotFound { id }
    }

    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn invalid_job_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidJobConfig(message.into())
    }

    pub fn split_job<S: Into<String>>(message: S) -> Self {
        Self::SplitJob(message.into())
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict(message.into())
    }

    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::DatabaseOperation(message.into())
    }

    /// 作业定义阶段同步抛出给调用方的配置类错误
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCron { .. }
                | Self::InvalidTrigger { .. }
                | Self::CircularDependency { .. }
                | Self::DependencyTooDeep { .. }
                | Self::InvalidJobConfig(_)
                | Self::Configuration(_)
        )
    }

    /// 不变量被破坏，当前操作必须中止并回滚
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IllegalState(_)
                | Self::InconsistentWorkflow { .. }
                | Self::InstanceNotFound { .. }
                | Self::JobNotFound { .. }
                | Self::TaskNotFound { .. }
                | Self::Internal(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::DatabaseOperation(_) | Self::Network(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SchedulerError::CircularDependency { job_id: 1 }.is_configuration_error());
        assert!(SchedulerError::DependencyTooDeep { depth: 21, max: 20 }.is_configuration_error());
        assert!(!SchedulerError::conflict("dup").is_configuration_error());

        assert!(SchedulerError::illegal_state("broken").is_fatal());
        assert!(SchedulerError::instance_not_found(7).is_fatal());
        assert!(!SchedulerError::split_job("empty").is_fatal());

        assert!(SchedulerError::Network("timeout".to_string()).is_retryable());
        assert!(!SchedulerError::invalid_job_config("bad").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::InconsistentWorkflow {
            instance_id: 3,
            expect: Some(1),
            actual: None,
        };
        assert!(err.to_string().contains("实例=3"));
        assert_eq!(SchedulerError::task_not_found(9).to_string(), "任务未找到: 9");
    }
}
