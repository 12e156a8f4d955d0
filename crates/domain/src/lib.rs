//! 调度领域模型
//!
//! 作业、实例、任务与工作流边的定义，状态枚举，以及持久化和Worker通信的接口。

pub mod dag;
pub mod discovery;
pub mod entities;
pub mod params;
pub mod repositories;
pub mod run_state;
pub mod trigger;
pub mod value_objects;
pub mod worker;
pub mod worker_rpc;

pub use dag::{DagEdge, DagExpression, DagNode};
pub use discovery::WorkerDiscovery;
pub use entities::*;
pub use params::*;
pub use repositories::*;
pub use run_state::{ResolvedRunState, RunStateResolver};
pub use scheduler_core::{SchedulerError, SchedulerResult};
pub use trigger::parse_depend_parents;
pub use value_objects::*;
pub use worker::Worker;
pub use worker_rpc::{ConfiguredTokenProvider, SupervisorTokenProvider, WorkerRpc};
