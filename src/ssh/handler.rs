// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait

use russh::keys::PublicKey;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::host_key::HostKeyVerifier;

/// SSH 客户端 Handler
/// 处理 SSH 连接过程中的各种回调
pub struct SshClientHandler {
    /// 服务器主机名
    host: String,
    /// 服务器端口
    port: u16,
    /// 主机密钥校验器
    verifier: Arc<dyn HostKeyVerifier>,
}

impl SshClientHandler {
    /// 创建新的 Handler
    pub fn new(host: String, port: u16, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            host,
            port,
            verifier,
        }
    }
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥，交给配置的校验策略决定
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        debug!(
            "[SSH] Server key type for {}:{}: {}",
            self.host,
            self.port,
            server_public_key.algorithm()
        );

        let verifier = self.verifier.clone();
        let host = self.host.clone();
        let port = self.port;
        let key = server_public_key.clone();
        async move { Ok(verifier.verify(&host, port, &key).await) }
    }
}
