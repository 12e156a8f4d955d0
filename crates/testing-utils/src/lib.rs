//! # Scheduler Testing Utils
//!
//! 调度核心的共享测试工具：
//!
//! - **Mocks**: 可编排的 `WorkerRpc` 与可变的 `WorkerDiscovery`
//! - **Builders**: 作业、实例、任务与Worker的测试数据构建器
//! - **Helpers**: 基于内存存储装配好的 `TestHarness`
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
