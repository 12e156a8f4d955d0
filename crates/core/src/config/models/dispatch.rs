use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 任务分发配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// 未配置分组时使用的令牌
    pub default_token: Option<String>,
    /// 分组 -> Supervisor认证令牌
    pub group_tokens: HashMap<String, String>,
}

impl DispatchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (group, token) in &self.group_tokens {
            if group.trim().is_empty() {
                return Err(anyhow::anyhow!("分组名称不能为空"));
            }
            if token.trim().is_empty() {
                return Err(anyhow::anyhow!("分组 {} 的认证令牌不能为空", group));
            }
        }

        if let Some(token) = &self.default_token {
            if token.trim().is_empty() {
                return Err(anyhow::anyhow!("默认认证令牌不能为空字符串"));
            }
        }

        Ok(())
    }

    /// 获取分组的认证令牌
    pub fn token_for(&self, group: &str) -> Option<&str> {
        self.group_tokens
            .get(group)
            .or(self.default_token.as_ref())
            .map(String::as_str)
    }
}
