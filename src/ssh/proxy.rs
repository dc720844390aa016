// 代理拨号
//
// 先在超时内建立到代理的 TCP 连接，再在同一超时内完成隧道握手：
// - http: CONNECT 隧道，配置了用户名时附带 Basic 认证
// - socks5: 可选用户名/密码协商，然后 CONNECT 到目标
//
// 代理阶段的任何失败都是 SshError::Proxy，不回退到直连。

use std::net::SocketAddr;
use std::time::Duration;

use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth, HttpError};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use super::config::{ProxyConfig, ProxyType};
use super::error::SshError;

/// 通过代理建立到目标主机的 TCP 隧道
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    let scheme = proxy.proxy_type.scheme();
    let proxy_addr = resolve_proxy_addr(proxy, connect_timeout).await?;

    debug!(
        "[Proxy] {} proxy {} -> {}:{}",
        scheme, proxy_addr, target_host, target_port
    );

    let mut stream = timeout(connect_timeout, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| proxy_timeout(scheme, "connect"))?
        .map_err(|e| {
            SshError::Proxy(format!("Unable to reach {} proxy {}: {}", scheme, proxy_addr, e))
        })?;

    let auth = proxy.auth.as_ref().map(|(user, pass)| (user.as_str(), pass.as_str()));

    match proxy.proxy_type {
        ProxyType::Socks5 => {
            let handshake = async {
                match auth {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password_and_socket(
                            stream,
                            (target_host, target_port),
                            user,
                            pass,
                        )
                        .await
                    }
                    None => {
                        Socks5Stream::connect_with_socket(stream, (target_host, target_port)).await
                    }
                }
            };
            let tunnel = timeout(connect_timeout, handshake)
                .await
                .map_err(|_| proxy_timeout(scheme, "handshake"))?
                .map_err(socks5_error)?;
            Ok(tunnel.into_inner())
        }
        ProxyType::Http => {
            let handshake = async {
                match auth {
                    Some((user, pass)) => {
                        http_connect_tokio_with_basic_auth(
                            &mut stream,
                            target_host,
                            target_port,
                            user,
                            pass,
                        )
                        .await
                    }
                    None => http_connect_tokio(&mut stream, target_host, target_port).await,
                }
            };
            timeout(connect_timeout, handshake)
                .await
                .map_err(|_| proxy_timeout(scheme, "CONNECT"))?
                .map_err(http_error)?;
            Ok(stream)
        }
    }
}

/// 解析代理地址（IP:PORT 直接使用，否则走 DNS）
async fn resolve_proxy_addr(
    proxy: &ProxyConfig,
    connect_timeout: Duration,
) -> Result<SocketAddr, SshError> {
    if let Ok(addr) = proxy.address().parse::<SocketAddr>() {
        return Ok(addr);
    }

    timeout(
        connect_timeout,
        tokio::net::lookup_host((proxy.host.as_str(), proxy.port)),
    )
    .await
    .map_err(|_| proxy_timeout(proxy.proxy_type.scheme(), "address resolution"))?
    .map_err(|e| SshError::Proxy(format!("Failed to resolve proxy {}: {}", proxy.host, e)))?
    .next()
    .ok_or_else(|| SshError::Proxy(format!("No address found for proxy {}", proxy.host)))
}

fn proxy_timeout(scheme: &str, phase: &str) -> SshError {
    SshError::Proxy(format!("{} proxy {} timed out", scheme, phase))
}

fn socks5_error(e: tokio_socks::Error) -> SshError {
    use tokio_socks::Error as Socks;

    let reason = match &e {
        Socks::PasswordAuthFailure(_) | Socks::AuthorizationRequired => "authentication rejected",
        Socks::NoAcceptableAuthMethods | Socks::UnknownAuthMethod => {
            "no acceptable authentication method"
        }
        Socks::ConnectionNotAllowedByRuleset => "connection not allowed",
        Socks::NetworkUnreachable
        | Socks::HostUnreachable
        | Socks::ConnectionRefused
        | Socks::TtlExpired => "target unreachable from proxy",
        Socks::InvalidTargetAddress(_) | Socks::InvalidAuthValues(_) => "invalid request",
        Socks::Io(_) => "connection lost",
        _ => "protocol error",
    };
    SshError::Proxy(format!("socks5 {}: {}", reason, e))
}

fn http_error(e: HttpError) -> SshError {
    let reason = match &e {
        HttpError::HttpCode200(407) => "authentication required".to_string(),
        HttpError::HttpCode200(code) => format!("tunnel refused with status {}", code),
        HttpError::IoError(_) | HttpError::EndOfFile => "connection lost".to_string(),
        _ => "malformed response".to_string(),
    };
    SshError::Proxy(format!("http {}: {}", reason, e))
}
