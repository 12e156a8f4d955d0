use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use scheduler_domain::IdGenerator;

/// 进程内递增ID，起始值取启动时刻的毫秒数左移，保证重启后不回退
#[derive(Debug)]
pub struct SequenceIdGenerator {
    next: AtomicI64,
}

impl SequenceIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis() << 10)
    }

    pub fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn generate_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
