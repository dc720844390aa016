// SSH 客户端核心实现（会话工厂）
//
// 连接流程：解析认证方式 -> 解析超时 -> 直连或代理拨号 -> SSH 握手 -> 认证

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{AuthResult, Handle};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::{resolve_timeout, russh_config, AuthMethod, ProxyConfig};
use super::error::SshError;
use super::handler::SshClientHandler;
use super::host_key::HostKeyVerifier;
use super::pool::SessionFactory;
use super::proxy::connect_via_proxy;
use super::session::SshSession;
use crate::models::{ConnectionDescriptor, Credential, CredentialKind};

/// 默认存活探测超时
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// SSH 客户端
/// 负责建立 SSH 连接并返回 SshSession
pub struct SshClient {
    /// 主机密钥校验策略
    verifier: Arc<dyn HostKeyVerifier>,
    /// 会话存活探测超时
    ping_timeout: Duration,
    russh_config: Arc<russh::client::Config>,
}

impl SshClient {
    /// 创建新的 SSH 客户端
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            verifier,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            russh_config: Arc::new(russh_config()),
        }
    }

    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// 执行连接（异步）
    ///
    /// 配置类错误（密钥、超时、代理 URI）都在任何网络操作之前返回。
    pub async fn connect(
        &self,
        conn: &ConnectionDescriptor,
        cred: Option<&Credential>,
    ) -> Result<SshSession, SshError> {
        validate_descriptor(conn)?;

        let username = conn.effective_user(cred).to_string();
        debug!("[SSH] Target: {}@{}:{}", username, conn.host, conn.port);

        let auth = resolve_auth(conn, cred).await?;
        let connect_timeout = resolve_timeout(conn.timeout.as_deref())?;
        let proxy = conn
            .proxy
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(ProxyConfig::parse)
            .transpose()?;

        // TCP 连接（直连或经代理）
        let stream = open_transport(conn, proxy.as_ref(), connect_timeout).await?;
        debug!("[SSH] TCP connection established to {}", conn.address());

        // SSH 握手
        let handler = SshClientHandler::new(conn.host.clone(), conn.port, self.verifier.clone());
        let mut handle = timeout(
            connect_timeout,
            russh::client::connect_stream(self.russh_config.clone(), stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(connect_timeout.as_secs()))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => SshError::HostKey(format!(
                "Server key for {} was not accepted",
                conn.address()
            )),
            other => SshError::Dial(format!("SSH handshake failed: {}", other)),
        })?;

        debug!("[SSH] SSH handshake completed");

        // 认证
        authenticate(&mut handle, &username, &auth).await?;

        info!("[SSH] Connected to {}@{}", username, conn.address());

        Ok(SshSession::new(
            handle,
            conn.host.clone(),
            username,
            self.ping_timeout,
        ))
    }
}

#[async_trait]
impl SessionFactory for SshClient {
    type Client = SshSession;

    async fn dial(
        &self,
        conn: &ConnectionDescriptor,
        cred: Option<&Credential>,
    ) -> Result<Arc<SshSession>, SshError> {
        self.connect(conn, cred).await.map(Arc::new)
    }
}

/// 校验连接描述：主机不能为空，端口不能为 0
pub fn validate_descriptor(conn: &ConnectionDescriptor) -> Result<(), SshError> {
    if conn.host.trim().is_empty() {
        return Err(SshError::Config("Host must not be empty".to_string()));
    }
    if conn.port == 0 {
        return Err(SshError::Config("Port must be between 1 and 65535".to_string()));
    }
    Ok(())
}

/// 解析认证方式
///
/// 有凭证时只使用凭证（按类型选择），不会读取描述中的密码或私钥；
/// 无凭证时依次使用描述中的密码和私钥文件。
pub async fn resolve_auth(
    conn: &ConnectionDescriptor,
    cred: Option<&Credential>,
) -> Result<Vec<AuthMethod>, SshError> {
    let mut methods = Vec::new();

    match cred {
        Some(cred) => match cred.kind {
            CredentialKind::Key => {
                let key_path = non_empty(cred.key_path.as_deref())
                    .ok_or_else(|| SshError::Key("Credential has no key path".to_string()))?;
                let key = load_private_key(key_path, non_empty(cred.key_password.as_deref()))
                    .await?;
                methods.push(AuthMethod::PublicKey(Arc::new(key)));
            }
            CredentialKind::Password => {
                methods.push(AuthMethod::Password(
                    cred.password.clone().unwrap_or_default(),
                ));
            }
        },
        None => {
            if let Some(password) = non_empty(conn.password.as_deref()) {
                methods.push(AuthMethod::Password(password.to_string()));
            }
            if let Some(identity) = non_empty(conn.identity_file.as_deref()) {
                let key = load_private_key(identity, None).await?;
                methods.push(AuthMethod::PublicKey(Arc::new(key)));
            }
        }
    }

    if methods.is_empty() {
        return Err(SshError::Auth(
            "No authentication method configured".to_string(),
        ));
    }
    Ok(methods)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// 加载私钥文件（路径支持 ~ 与环境变量展开）
pub async fn load_private_key(
    key_path: &str,
    passphrase: Option<&str>,
) -> Result<russh::keys::PrivateKey, SshError> {
    let expanded = shellexpand::full(key_path)
        .map_err(|e| SshError::Key(format!("Failed to expand key path {}: {}", key_path, e)))?;

    debug!("[SSH] Loading private key from {}", expanded);

    let key_data = tokio::fs::read(expanded.as_ref())
        .await
        .map_err(|e| SshError::Key(format!("Failed to read key file {}: {}", expanded, e)))?;

    russh::keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)
        .map_err(|e| SshError::Key(format!("Failed to decode key {}: {}", expanded, e)))
}

/// 建立到目标主机的原始 TCP 连接
async fn open_transport(
    conn: &ConnectionDescriptor,
    proxy: Option<&ProxyConfig>,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    if let Some(proxy) = proxy {
        return connect_via_proxy(proxy, &conn.host, conn.port, connect_timeout).await;
    }

    timeout(
        connect_timeout,
        TcpStream::connect((conn.host.as_str(), conn.port)),
    )
    .await
    .map_err(|_| SshError::Timeout(connect_timeout.as_secs()))?
    .map_err(|e| SshError::Dial(format!("Unable to connect to {}: {}", conn.address(), e)))
}

/// 依次尝试各认证方式，任一成功即返回
async fn authenticate(
    handle: &mut Handle<SshClientHandler>,
    username: &str,
    methods: &[AuthMethod],
) -> Result<(), SshError> {
    let mut failures = Vec::new();

    for method in methods {
        let result = match method {
            AuthMethod::Password(password) => {
                debug!("[SSH] Using password authentication");
                handle.authenticate_password(username, password).await
            }
            AuthMethod::PublicKey(key) => {
                debug!("[SSH] Using public key authentication ({})", key.algorithm());
                let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(key.clone(), None);
                handle.authenticate_publickey(username, key_with_alg).await
            }
        };

        match result {
            Ok(AuthResult::Success) => return Ok(()),
            Ok(AuthResult::Failure {
                remaining_methods,
                partial_success,
            }) => {
                if partial_success {
                    failures.push("partial success, additional auth required".to_string());
                } else {
                    failures.push(format!("rejected, server suggests {:?}", remaining_methods));
                }
            }
            Err(e) => {
                return Err(SshError::Auth(format!("Authentication aborted: {}", e)));
            }
        }
    }

    Err(SshError::Auth(format!(
        "All methods failed for '{}': {}",
        username,
        failures.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KnownHost, KnownHostsConfig};
    use crate::ssh::host_key::{AcceptAllHostKeys, KnownHostsVerifier};
    use crate::ssh::pool::PooledClient;
    use crate::ssh::testing::{self, TestServer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const KEY: &str = include_str!("testdata/id_ed25519");
    const PROTECTED_KEY: &str = include_str!("testdata/id_ed25519_protected");

    fn write_key(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn client() -> SshClient {
        SshClient::new(Arc::new(AcceptAllHostKeys))
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_credential_takes_priority_over_descriptor() {
        let mut conn = ConnectionDescriptor::new("example.com", 22, "deploy");
        conn.password = Some("descriptor-password".to_string());
        conn.identity_file = Some("/nonexistent/id_rsa".to_string());

        let cred = Credential::password(Some("ops"), "credential-password");
        let methods = resolve_auth(&conn, Some(&cred)).await.unwrap();

        assert_eq!(methods.len(), 1);
        assert!(matches!(&methods[0], AuthMethod::Password(p) if p == "credential-password"));
    }

    #[tokio::test]
    async fn test_key_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_key(&dir, "id", KEY);
        let mut conn = ConnectionDescriptor::new("example.com", 22, "deploy");
        conn.password = Some("ignored".to_string());

        let cred = Credential::key(None, path, None);
        let methods = resolve_auth(&conn, Some(&cred)).await.unwrap();
        assert_eq!(methods.len(), 1);
        assert!(matches!(methods[0], AuthMethod::PublicKey(_)));
    }

    #[tokio::test]
    async fn test_passphrase_protected_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_key(&dir, "id_protected", PROTECTED_KEY);
        let conn = ConnectionDescriptor::new("example.com", 22, "deploy");

        let cred = Credential::key(None, path.clone(), Some("letmein"));
        let methods = resolve_auth(&conn, Some(&cred)).await.unwrap();
        assert!(matches!(methods[0], AuthMethod::PublicKey(_)));

        let wrong = Credential::key(None, path, Some("wrong"));
        assert!(matches!(
            resolve_auth(&conn, Some(&wrong)).await,
            Err(SshError::Key(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_or_garbage_key_is_key_error() {
        let dir = tempfile::tempdir().unwrap();
        let conn = ConnectionDescriptor::new("example.com", 22, "deploy");

        let missing = Credential::key(None, "/nonexistent/id_ed25519", None);
        assert!(matches!(
            resolve_auth(&conn, Some(&missing)).await,
            Err(SshError::Key(_))
        ));

        let garbage = write_key(&dir, "garbage", "this is not a key");
        let cred = Credential::key(None, garbage.clone(), None);
        assert!(matches!(
            resolve_auth(&conn, Some(&cred)).await,
            Err(SshError::Key(_))
        ));

        // 描述中的私钥文件同样适用
        let mut conn = conn;
        conn.identity_file = Some(garbage);
        assert!(matches!(resolve_auth(&conn, None).await, Err(SshError::Key(_))));
    }

    #[tokio::test]
    async fn test_descriptor_fallback_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = ConnectionDescriptor::new("example.com", 22, "deploy");
        conn.password = Some("pw".to_string());
        conn.identity_file = Some(write_key(&dir, "id", KEY));

        let methods = resolve_auth(&conn, None).await.unwrap();
        assert_eq!(methods.len(), 2);
        assert!(matches!(methods[0], AuthMethod::Password(_)));
        assert!(matches!(methods[1], AuthMethod::PublicKey(_)));

        let bare = ConnectionDescriptor::new("example.com", 22, "deploy");
        assert!(matches!(resolve_auth(&bare, None).await, Err(SshError::Auth(_))));
    }

    #[tokio::test]
    async fn test_key_path_env_expansion() {
        let dir = tempfile::tempdir().unwrap();
        write_key(&dir, "id_env", KEY);
        std::env::set_var("SSHM_TEST_KEY_DIR", dir.path());

        let key = load_private_key("$SSHM_TEST_KEY_DIR/id_env", None).await;
        assert!(key.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_descriptor() {
        let conn = ConnectionDescriptor::new("", 22, "deploy");
        assert!(matches!(validate_descriptor(&conn), Err(SshError::Config(_))));
        let conn = ConnectionDescriptor::new("example.com", 0, "deploy");
        assert!(matches!(validate_descriptor(&conn), Err(SshError::Config(_))));
    }

    #[tokio::test]
    async fn test_malformed_timeout_fails_before_dial() {
        let port = closed_port().await;
        let mut conn = ConnectionDescriptor::new("127.0.0.1", port, "deploy");
        conn.password = Some("pw".to_string());
        conn.timeout = Some("10x".to_string());

        let err = client().connect(&conn, None).await.unwrap_err();
        assert!(matches!(err, SshError::Config(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unsupported_proxy_fails_before_dial() {
        let mut conn = ConnectionDescriptor::new("127.0.0.1", 22, "deploy");
        conn.password = Some("pw".to_string());
        conn.proxy = Some("ftp://127.0.0.1:21".to_string());

        let err = client().connect(&conn, None).await.unwrap_err();
        assert!(matches!(err, SshError::UnsupportedProxy(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_direct_dial_failure() {
        let port = closed_port().await;
        let mut conn = ConnectionDescriptor::new("127.0.0.1", port, "deploy");
        conn.password = Some("pw".to_string());

        let err = client().connect(&conn, None).await.unwrap_err();
        assert!(matches!(err, SshError::Dial(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_dial_routes_through_http_proxy() {
        // 代理接受 CONNECT 后立即断开，握手失败，但请求已经经过代理
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let _ = tx.send(String::from_utf8(head).unwrap());
        });

        let mut conn = ConnectionDescriptor::new("target.internal", 22, "deploy");
        conn.password = Some("pw".to_string());
        conn.timeout = Some("2s".to_string());
        conn.proxy = Some(format!("http://user:pass@{}", proxy_addr));

        let err = client().connect(&conn, None).await.unwrap_err();
        assert!(
            matches!(err, SshError::Dial(_) | SshError::Timeout(_)),
            "{:?}",
            err
        );

        let head = rx.await.unwrap();
        assert!(head.starts_with("CONNECT target.internal:22 HTTP/1.1\r\n"));
        assert!(head.contains("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn test_unreachable_socks5_proxy() {
        let port = closed_port().await;
        let mut conn = ConnectionDescriptor::new("target.internal", 22, "deploy");
        conn.password = Some("pw".to_string());
        conn.proxy = Some(format!("socks5://127.0.0.1:{}", port));

        let err = client().connect(&conn, None).await.unwrap_err();
        assert!(matches!(err, SshError::Proxy(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_password_login_against_live_server() {
        let server = TestServer::start().await;

        let session = client().connect(&server.descriptor(), None).await.unwrap();
        assert!(session.is_alive());
        assert_eq!(session.username(), testing::USER);
        assert_eq!(server.accepts(), 1);

        session.close().await;
    }

    #[tokio::test]
    async fn test_rejected_password_is_auth_error() {
        let server = TestServer::start().await;
        let mut conn = server.descriptor();
        conn.password = Some("wrong".to_string());

        let err = client().connect(&conn, None).await.unwrap_err();
        assert!(matches!(err, SshError::Auth(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_rejected_host_key_is_host_key_error() {
        let server = TestServer::start().await;
        let strict = SshClient::new(Arc::new(KnownHostsVerifier::new(
            KnownHostsConfig::default(),
            None,
            false,
        )));

        let err = strict.connect(&server.descriptor(), None).await.unwrap_err();
        assert!(matches!(err, SshError::HostKey(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_known_host_key_is_accepted() {
        let server = TestServer::start().await;
        let hosts = KnownHostsConfig {
            hosts: vec![KnownHost {
                host: format!("127.0.0.1:{}", server.port()),
                key_type: "ssh-ed25519".to_string(),
                fingerprint: testing::HOST_FINGERPRINT.to_string(),
                first_seen: "2024-01-01 00:00".to_string(),
                last_used: "2024-01-01 00:00".to_string(),
            }],
        };
        let strict = SshClient::new(Arc::new(KnownHostsVerifier::new(hosts, None, false)));

        let session = strict.connect(&server.descriptor(), None).await.unwrap();
        assert!(session.is_alive());
        session.close().await;
    }
}
