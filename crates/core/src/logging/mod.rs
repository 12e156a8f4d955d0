//! 结构化日志初始化

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::{SchedulerError, SchedulerResult};

/// 初始化全局日志订阅器
///
/// 优先使用 `RUST_LOG` 环境变量，未设置时使用配置中的日志级别。
/// 重复初始化时返回配置错误，调用方可以忽略该错误。
pub fn init_logging(config: &LoggingConfig) -> SchedulerResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| SchedulerError::Configuration(format!("无效的日志级别 {}: {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread_ids);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread_ids);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread_ids);
            registry.with(fmt_layer).try_init()
        }
    };

    result.map_err(|e| SchedulerError::Configuration(format!("日志系统初始化失败: {e}")))?;

    info!(
        logging.format = ?config.format,
        logging.level = %config.level,
        "日志系统初始化完成"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_reports_error() {
        let config = LoggingConfig::default();
        // 同一进程中只有第一次初始化成功
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
