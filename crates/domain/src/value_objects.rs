use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use scheduler_core::SchedulerError;

/// 为状态枚举生成 `as_str` / `Display` / `FromStr`，字符串即持久化编码
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = SchedulerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(SchedulerError::Serialization(format!(
                        "无效的{}: {}",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }
    };
}

/// 作业类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    General,
    Workflow,
}

string_enum!(JobType { General => "GENERAL", Workflow => "WORKFLOW" });

/// 作业启用状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Disabled,
    Enabled,
}

string_enum!(JobState { Disabled => "DISABLED", Enabled => "ENABLED" });

/// 触发类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// CRON表达式
    Cron,
    /// 指定时间执行一次
    Once,
    /// 固定频率（秒）
    FixedRate,
    /// 固定延迟（秒）
    FixedDelay,
    /// 依赖父作业完成
    Depend,
}

string_enum!(TriggerType {
    Cron => "CRON",
    Once => "ONCE",
    FixedRate => "FIXED_RATE",
    FixedDelay => "FIXED_DELAY",
    Depend => "DEPEND",
});

impl TriggerType {
    /// 固定频率/延迟类型的作业需要在实例结束后才计算下次触发时间
    pub fn is_fixed(&self) -> bool {
        matches!(self, TriggerType::FixedRate | TriggerType::FixedDelay)
    }
}

/// 路由策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteStrategy {
    RoundRobin,
    Random,
    SimpleHash,
    Broadcast,
}

string_enum!(RouteStrategy {
    RoundRobin => "ROUND_ROBIN",
    Random => "RANDOM",
    SimpleHash => "SIMPLE_HASH",
    Broadcast => "BROADCAST",
});

impl RouteStrategy {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, RouteStrategy::Broadcast)
    }

    pub fn is_round_robin(&self) -> bool {
        matches!(self, RouteStrategy::RoundRobin)
    }
}

/// 重试类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryType {
    /// 不重试
    None,
    /// 重新拆分全部任务
    All,
    /// 只重试失败的任务
    Failed,
}

string_enum!(RetryType { None => "NONE", All => "ALL", Failed => "FAILED" });

/// 实例运行类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    Schedule,
    Manual,
    Retry,
    Depend,
}

string_enum!(RunType {
    Schedule => "SCHEDULE",
    Manual => "MANUAL",
    Retry => "RETRY",
    Depend => "DEPEND",
});

impl RunType {
    /// 受 `(job_id, trigger_time, run_type)` 唯一约束的运行类型
    pub fn is_unique_keyed(&self) -> bool {
        matches!(self, RunType::Schedule | RunType::Depend)
    }
}

/// 实例运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Waiting,
    Running,
    Paused,
    Completed,
    Canceled,
}

string_enum!(RunState {
    Waiting => "WAITING",
    Running => "RUNNING",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    Canceled => "CANCELED",
});

impl RunState {
    /// 可暂停的状态
    pub const PAUSABLE: &'static [RunState] = &[RunState::Waiting, RunState::Running];
    /// 未启动或已暂停，可直接变更的状态
    pub const RUNNABLE: &'static [RunState] = &[RunState::Waiting, RunState::Paused];
    /// 可终止（未终止）的状态
    pub const TERMINABLE: &'static [RunState] =
        &[RunState::Waiting, RunState::Running, RunState::Paused];

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Canceled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunState::Canceled)
    }

    pub fn is_pausable(&self) -> bool {
        Self::PAUSABLE.contains(self)
    }

    pub fn is_runnable(&self) -> bool {
        Self::RUNNABLE.contains(self)
    }
}

/// 任务执行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecuteState {
    Waiting,
    Executing,
    Paused,
    Completed,
    DispatchFailed,
    InitializeFailed,
    ExecuteFailed,
    ExecuteTimeout,
    ExecuteCollided,
    BroadcastAborted,
    ExecuteAborted,
    ShutdownCanceled,
    ManualCanceled,
}

string_enum!(ExecuteState {
    Waiting => "WAITING",
    Executing => "EXECUTING",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    DispatchFailed => "DISPATCH_FAILED",
    InitializeFailed => "INITIALIZE_FAILED",
    ExecuteFailed => "EXECUTE_FAILED",
    ExecuteTimeout => "EXECUTE_TIMEOUT",
    ExecuteCollided => "EXECUTE_COLLIDED",
    BroadcastAborted => "BROADCAST_ABORTED",
    ExecuteAborted => "EXECUTE_ABORTED",
    ShutdownCanceled => "SHUTDOWN_CANCELED",
    ManualCanceled => "MANUAL_CANCELED",
});

impl ExecuteState {
    /// 可暂停的状态
    pub const PAUSABLE: &'static [ExecuteState] = &[ExecuteState::Waiting, ExecuteState::Executing];

    /// 对应的实例运行状态
    pub fn run_state(&self) -> RunState {
        match self {
            ExecuteState::Waiting => RunState::Waiting,
            ExecuteState::Executing => RunState::Running,
            ExecuteState::Paused => RunState::Paused,
            ExecuteState::Completed => RunState::Completed,
            _ => RunState::Canceled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.run_state().is_terminal()
    }

    pub fn is_failure(&self) -> bool {
        self.run_state().is_failure()
    }

    pub fn is_pausable(&self) -> bool {
        Self::PAUSABLE.contains(self)
    }
}

/// 发送给Worker的操作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Trigger,
    Pause,
    Cancel,
    ExclusiveCancel,
    ShutdownCancel,
    ShutdownResume,
}

string_enum!(Operation {
    Trigger => "TRIGGER",
    Pause => "PAUSE",
    Cancel => "CANCEL",
    ExclusiveCancel => "EXCLUSIVE_CANCEL",
    ShutdownCancel => "SHUTDOWN_CANCEL",
    ShutdownResume => "SHUTDOWN_RESUME",
});

impl Operation {
    /// 操作完成后任务的目标状态，TRIGGER没有目标状态
    pub fn to_state(&self) -> Option<ExecuteState> {
        match self {
            Operation::Trigger => None,
            Operation::Pause => Some(ExecuteState::Paused),
            Operation::Cancel => Some(ExecuteState::ManualCanceled),
            Operation::ExclusiveCancel => Some(ExecuteState::ExecuteCollided),
            Operation::ShutdownCancel => Some(ExecuteState::ShutdownCanceled),
            Operation::ShutdownResume => Some(ExecuteState::Waiting),
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Operation::Trigger)
    }

    /// 取消类操作
    pub fn is_cancel(&self) -> bool {
        self.to_state().is_some_and(|s| s.is_failure())
    }
}
