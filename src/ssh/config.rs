// SSH 连接配置

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::error::SshError;
use crate::models::PoolSettings;

/// 未配置超时时的默认连接超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 认证方式（已解析，密钥已加载）
#[derive(Clone)]
pub enum AuthMethod {
    /// 密码认证
    Password(String),
    /// 公钥认证
    PublicKey(Arc<russh::keys::PrivateKey>),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::PublicKey(key) => write!(f, "PublicKey({})", key.algorithm()),
        }
    }
}

/// 解析连接超时：为空时使用默认值，格式错误时立即失败
///
/// 接受 humantime 格式（`30s`、`2min`、`1h 30m`），也接受带小数的紧凑写法（`1.5s`、`1h2.5m`）。
pub fn resolve_timeout(timeout: Option<&str>) -> Result<Duration, SshError> {
    let Some(t) = timeout.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(DEFAULT_CONNECT_TIMEOUT);
    };
    match humantime::parse_duration(t) {
        Ok(duration) => Ok(duration),
        Err(e) => parse_fractional_duration(t)
            .ok_or_else(|| SshError::Config(format!("Invalid timeout value '{}': {}", t, e))),
    }
}

/// `<小数><单位>` 序列，单位为 ns/us/µs/ms/s/m/h
fn parse_fractional_duration(input: &str) -> Option<Duration> {
    let mut rest = input;
    let mut total = 0f64;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    Duration::try_from_secs_f64(total).ok()
}

/// 代理类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Socks5,
}

impl ProxyType {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Socks5 => "socks5",
        }
    }
}

/// 代理配置
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// 代理类型
    pub proxy_type: ProxyType,
    /// 代理主机
    pub host: String,
    /// 代理端口
    pub port: u16,
    /// 认证信息（用户名, 密码）
    pub auth: Option<(String, String)>,
}

impl ProxyConfig {
    /// 解析单行代理 URI：scheme://[user[:pass]@]host:port
    ///
    /// 只识别 http 与 socks5，其他 scheme 返回 UnsupportedProxy。
    pub fn parse(uri: &str) -> Result<Self, SshError> {
        let url = Url::parse(uri.trim())
            .map_err(|e| SshError::Config(format!("Unable to parse proxy URI: {}", e)))?;

        let proxy_type = match url.scheme() {
            "http" => ProxyType::Http,
            "socks5" => ProxyType::Socks5,
            other => return Err(SshError::UnsupportedProxy(other.to_string())),
        };

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SshError::Config("Proxy URI has no host".to_string()))?
            .to_string();

        // http 省略端口时 url 会返回已知默认端口 80；socks5 必须显式指定
        let port = url
            .port_or_known_default()
            .ok_or_else(|| SshError::Config("Invalid proxy port".to_string()))?;

        let auth = if url.username().is_empty() {
            None
        } else {
            let user = decode_component(url.username())?;
            let password = decode_component(url.password().unwrap_or_default())?;
            Some((user, password))
        };

        Ok(Self {
            proxy_type,
            host,
            port,
            auth,
        })
    }

    /// 代理地址 host:port
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn decode_component(raw: &str) -> Result<String, SshError> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| SshError::Config(format!("Invalid proxy credentials encoding: {}", e)))
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("proxy_type", &self.proxy_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth", &self.auth.as_ref().map(|(user, _)| (user, "***")))
            .finish()
    }
}

/// 连接池配置
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// 单会话心跳间隔
    pub keepalive_interval: Duration,
    /// 空闲清理间隔
    pub idle_sweep_interval: Duration,
    /// 空闲超时阈值
    pub idle_timeout: Duration,
    /// 心跳成功是否刷新最后使用时间
    pub refresh_on_keepalive: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(settings.keepalive_interval_secs.max(1)),
            idle_sweep_interval: Duration::from_secs(settings.idle_sweep_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            refresh_on_keepalive: settings.refresh_on_keepalive,
        }
    }
}

/// 会话存活探测超时，至少 1 秒
pub fn ping_timeout(settings: &PoolSettings) -> Duration {
    Duration::from_secs(settings.ping_timeout_secs.max(1))
}

/// 构建 russh 客户端配置
///
/// 连接由连接池自行探活和回收，这里关闭 russh 的不活动超时与内置心跳。
pub fn russh_config() -> russh::client::Config {
    let mut config = russh::client::Config::default();
    config.inactivity_timeout = None;
    config.keepalive_interval = None;
    config
}
