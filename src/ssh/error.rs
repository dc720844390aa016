// SSH 错误类型定义

use thiserror::Error;

/// SSH 错误类型
#[derive(Debug, Error)]
pub enum SshError {
    /// 配置错误（超时格式、代理 URI 格式等）
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 网络连接失败（TCP 连接或 SSH 握手）
    #[error("Dial error: {0}")]
    Dial(String),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// 密钥错误（无法读取或解析）
    #[error("Key error: {0}")]
    Key(String),

    /// 主机密钥校验失败
    #[error("Host key rejected: {0}")]
    HostKey(String),

    /// 代理错误
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// 不支持的代理类型
    #[error("Unsupported proxy type: {0}")]
    UnsupportedProxy(String),

    /// 别名不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 连接超时
    #[error("Connection timeout after {0}s")]
    Timeout(u64),

    /// 通道错误
    #[error("Channel error: {0}")]
    Channel(String),

    /// 会话已断开
    #[error("Session disconnected: {0}")]
    Disconnected(String),
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Protocol(e.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::Key(e.to_string())
    }
}
