//! 配置管理
//!
//! 配置按“默认值 -> TOML文件 -> 环境变量”的顺序加载，每个配置段都提供 `validate()`。

pub mod models;

pub use models::{
    AppConfig, DatabaseConfig, DispatchConfig, LogFormat, LoggingConfig, SupervisorConfig,
};
