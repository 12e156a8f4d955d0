use crate::worker::Worker;

/// Worker发现接口，返回的是调用时刻的存活快照
pub trait WorkerDiscovery: Send + Sync {
    /// 分组内当前存活的Worker
    fn get_discovered_servers(&self, group: &str) -> Vec<Worker>;

    fn is_discovered_server(&self, worker: &Worker) -> bool;

    fn has_discovered_servers(&self) -> bool;

    /// 分组内是否存在存活的Worker
    fn has_alive_workers(&self, group: &str) -> bool {
        !self.get_discovered_servers(group).is_empty()
    }
}
