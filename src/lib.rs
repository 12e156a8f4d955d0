//! Supervisor调度核心的装配入口
//!
//! 按配置初始化日志与SQLite存储，并将Worker发现、Worker调用与令牌装配到实例编排器和作业管理上。

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use scheduler_core::{init_logging, AppConfig};
use scheduler_dispatcher::{InstanceOrchestrator, JobAdmin};
use scheduler_domain::{ConfiguredTokenProvider, WorkerRpc};
use scheduler_infrastructure::{SequenceIdGenerator, SqliteTransactionManager, StaticWorkerDiscovery};

pub use scheduler_core as core;
pub use scheduler_dispatcher as dispatcher;
pub use scheduler_domain as domain;

pub struct Supervisor {
    config: AppConfig,
    tx_manager: Arc<SqliteTransactionManager>,
    discovery: Arc<StaticWorkerDiscovery>,
    orchestrator: Arc<InstanceOrchestrator>,
    job_admin: Arc<JobAdmin>,
}

impl Supervisor {
    /// 加载配置文件后装配
    pub async fn load(config_path: Option<&str>, worker_rpc: Arc<dyn WorkerRpc>) -> Result<Self> {
        let config = AppConfig::load(config_path).context("加载配置失败")?;
        Self::from_config(config, worker_rpc).await
    }

    pub async fn from_config(config: AppConfig, worker_rpc: Arc<dyn WorkerRpc>) -> Result<Self> {
        config.validate().context("配置验证失败")?;

        // 嵌入方可能已经初始化了全局日志
        if let Err(e) = init_logging(&config.logging) {
            warn!("跳过日志初始化: {}", e);
        }

        let tx_manager = Arc::new(
            SqliteTransactionManager::connect(&config.database)
                .await
                .context("连接数据库失败")?,
        );
        tx_manager.migrate().await.context("初始化数据库表结构失败")?;

        let discovery = Arc::new(StaticWorkerDiscovery::new());
        let id_generator = Arc::new(SequenceIdGenerator::new());
        let token_provider = Arc::new(ConfiguredTokenProvider::new(config.dispatch.clone()));

        let orchestrator = Arc::new(InstanceOrchestrator::new(
            tx_manager.clone(),
            id_generator.clone(),
            discovery.clone(),
            worker_rpc.clone(),
            token_provider,
            config.supervisor.clone(),
        ));
        let job_admin = Arc::new(JobAdmin::new(
            tx_manager.clone(),
            id_generator,
            worker_rpc,
            config.supervisor.clone(),
        ));

        info!(
            database.url = %config.database.url,
            lock_shards = config.supervisor.instance_lock_shards,
            "Supervisor初始化完成"
        );

        Ok(Self {
            config,
            tx_manager,
            discovery,
            orchestrator,
            job_admin,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 注册与摘除Worker
    pub fn discovery(&self) -> &Arc<StaticWorkerDiscovery> {
        &self.discovery
    }

    pub fn orchestrator(&self) -> &Arc<InstanceOrchestrator> {
        &self.orchestrator
    }

    pub fn job_admin(&self) -> &Arc<JobAdmin> {
        &self.job_admin
    }

    pub fn tx_manager(&self) -> &Arc<SqliteTransactionManager> {
        &self.tx_manager
    }

    pub async fn shutdown(&self) {
        info!("Supervisor正在关闭");
        self.tx_manager.close().await;
    }
}
