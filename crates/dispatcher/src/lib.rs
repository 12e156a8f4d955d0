//! 调度核心
//!
//! 实例/任务状态机、工作流推进、重试与依赖触发，以及作业管理。

pub mod dependency_resolver;
pub mod dispatcher;
pub mod instance_creator;
pub mod job_admin;
pub mod lock_pool;
pub mod orchestrator;
pub mod retry_planner;
pub mod tx_scope;
pub mod workflow_graph;

pub use dependency_resolver::DependencyResolver;
pub use dispatcher::{DispatchPlan, Dispatcher};
pub use instance_creator::InstanceCreator;
pub use job_admin::JobAdmin;
pub use lock_pool::LockPool;
pub use orchestrator::InstanceOrchestrator;
pub use retry_planner::RetryPlanner;
pub use tx_scope::{AfterCommit, DispatchRequest, TxScope};
pub use workflow_graph::{NodeAdvance, WorkflowGraph};
