use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// 实例锁：按锁ID分片的进程内互斥锁
///
/// 工作流节点使用主实例ID加锁，同一工作流的操作在本节点内串行执行。
/// 跨节点的互斥由存储事务中的行锁保证。
#[derive(Debug, Clone)]
pub struct LockPool {
    shards: Arc<Vec<Arc<Mutex<()>>>>,
}

impl LockPool {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Arc::new(Mutex::new(()))).collect();
        Self {
            shards: Arc::new(shards),
        }
    }

    pub async fn lock(&self, lock_id: i64) -> OwnedMutexGuard<()> {
        self.shard(lock_id).clone().lock_owned().await
    }

    fn shard(&self, lock_id: i64) -> &Arc<Mutex<()>> {
        let index = lock_id.rem_euclid(self.shards.len() as i64) as usize;
        &self.shards[index]
    }
}
