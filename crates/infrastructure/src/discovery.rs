//! 静态配置的Worker发现，适用于单机部署与测试

use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::{info, warn};

use scheduler_domain::{Worker, WorkerDiscovery};

/// 按分组保存Worker列表，可在运行时注册与摘除
#[derive(Debug, Default)]
pub struct StaticWorkerDiscovery {
    workers: RwLock<BTreeMap<String, Vec<Worker>>>,
}

impl StaticWorkerDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(workers: impl IntoIterator<Item = Worker>) -> Self {
        let discovery = Self::new();
        for worker in workers {
            discovery.register(worker);
        }
        discovery
    }

    pub fn register(&self, worker: Worker) {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        let group = workers.entry(worker.group.clone()).or_default();
        if !group.contains(&worker) {
            info!("注册Worker: {}", worker);
            group.push(worker);
        }
    }

    pub fn deregister(&self, worker: &Worker) -> bool {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        let Some(group) = workers.get_mut(&worker.group) else {
            return false;
        };
        let before = group.len();
        group.retain(|w| w != worker);
        let removed = group.len() < before;
        if removed {
            warn!("摘除Worker: {}", worker);
        }
        if group.is_empty() {
            workers.remove(&worker.group);
        }
        removed
    }
}

impl WorkerDiscovery for StaticWorkerDiscovery {
    fn get_discovered_servers(&self, group: &str) -> Vec<Worker> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    fn is_discovered_server(&self, worker: &Worker) -> bool {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&worker.group)
            .is_some_and(|group| group.contains(worker))
    }

    fn has_discovered_servers(&self) -> bool {
        !self.workers.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}
