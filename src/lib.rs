// sshm - SSH 连接池
//
// 按 user@host:port 复用已认证的 SSH 会话，支持直连、HTTP CONNECT 与 SOCKS5 代理。

pub mod models;
pub mod services;
pub mod ssh;
