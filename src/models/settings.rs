// Settings 配置数据结构

use serde::{Deserialize, Serialize};

// ======================== 主机密钥策略 ========================

/// 主机密钥校验策略
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// 接受任意主机密钥（不安全，需显式选择）
    #[default]
    AcceptAll,
    /// 首次连接时记录指纹，之后严格比对
    TrustOnFirstUse,
    /// 仅接受 known_hosts 中已有的指纹
    Strict,
}

// ======================== 连接池设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolSettings {
    /// 单会话心跳间隔（秒）
    pub keepalive_interval_secs: u64,
    /// 空闲清理间隔（秒）
    pub idle_sweep_interval_secs: u64,
    /// 空闲超时（秒），超过则关闭连接
    pub idle_timeout_secs: u64,
    /// 存活探测超时（秒）
    pub ping_timeout_secs: u64,
    /// 心跳成功时是否刷新最后使用时间
    pub refresh_on_keepalive: bool,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 30,
            idle_sweep_interval_secs: 300,
            idle_timeout_secs: 1800,
            ping_timeout_secs: 5,
            refresh_on_keepalive: true,
            host_key_policy: HostKeyPolicy::AcceptAll,
        }
    }
}
