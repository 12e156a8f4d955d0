pub mod app_config;
pub mod database;
pub mod dispatch;
pub mod logging;
pub mod supervisor;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatch::DispatchConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use supervisor::SupervisorConfig;
