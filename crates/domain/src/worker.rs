use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use scheduler_core::SchedulerError;

/// 已注册的Worker节点，序列化形式为 `group:worker_id:host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Worker {
    pub group: String,
    pub worker_id: String,
    pub host: String,
    pub port: u16,
}

impl Worker {
    pub fn new<G, W, H>(group: G, worker_id: W, host: H, port: u16) -> Self
    where
        G: Into<String>,
        W: Into<String>,
        H: Into<String>,
    {
        Self {
            group: group.into(),
            worker_id: worker_id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.group, self.worker_id, self.host, self.port)
    }
}

impl FromStr for Worker {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::Serialization(format!("无效的Worker: {s}"));
        // host可能是IPv6地址，所以从右侧取端口
        let (rest, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let mut parts = rest.splitn(3, ':');
        let group = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let worker_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let host = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        Ok(Worker::new(group, worker_id, host, port))
    }
}
