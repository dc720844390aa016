// SSH 连接模块
//
// 模块结构:
// - config: 连接配置 (AuthMethod, ProxyConfig, PoolConfig, 超时解析)
// - error: 错误类型 (SshError)
// - handler: russh Handler 实现
// - host_key: 主机密钥校验策略
// - proxy: HTTP CONNECT / SOCKS5 代理拨号
// - client: SSH 客户端核心（会话工厂）
// - session: SSH 会话管理 (SshSession, TerminalChannel, ExecChannel)
// - pool: 连接池 (ConnectionPool)

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod host_key;
pub mod pool;
pub mod proxy;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// 公开导出
pub use client::SshClient;
pub use config::{AuthMethod, PoolConfig, ProxyConfig, ProxyType};
pub use error::SshError;
pub use host_key::{verifier_for_policy, AcceptAllHostKeys, HostKeyVerifier, KnownHostsVerifier};
pub use pool::{ConnectionPool, PoolKey, PooledClient, SessionFactory};
pub use session::{CommandOutput, ExecChannel, PtyRequest, SshSession, TerminalChannel};
