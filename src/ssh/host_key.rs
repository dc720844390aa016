// 主机密钥校验策略
//
// - AcceptAllHostKeys: 接受任意主机密钥（不安全，必须显式选择）
// - KnownHostsVerifier: 基于 known_hosts.json 的指纹比对，可选首次信任

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use tracing::{error, info, warn};

use crate::models::{HostKeyPolicy, KnownHost, KnownHostsConfig};
use crate::services::storage;

/// 主机密钥校验器
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    /// 返回 true 表示接受该主机密钥
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool;
}

/// 接受任意主机密钥
///
/// 不做任何校验，容易遭受中间人攻击。每次接受都会记录一条警告。
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllHostKeys;

#[async_trait]
impl HostKeyVerifier for AcceptAllHostKeys {
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        warn!(
            "[HostKey] Accepting unverified host key for {}:{} ({})",
            host,
            port,
            key.fingerprint(HashAlg::Sha256)
        );
        true
    }
}

/// 指纹比对结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// 与记录一致
    Trusted,
    /// 未记录的主机
    Unknown,
    /// 与记录不一致
    Mismatch { expected: String },
}

/// 一次校验的结论
enum Verdict {
    Trusted,
    Learned,
    Mismatch(String),
    Unknown,
}

/// 基于 known_hosts 的校验器
pub struct KnownHostsVerifier {
    hosts: Mutex<KnownHostsConfig>,
    /// 持久化路径，None 时只在内存中记录
    path: Option<PathBuf>,
    /// 首次连接时自动信任并记录
    trust_on_first_use: bool,
    /// 串行化写文件，保证最后一次写入的是最新快照
    save_lock: tokio::sync::Mutex<()>,
}

impl KnownHostsVerifier {
    pub fn new(hosts: KnownHostsConfig, path: Option<PathBuf>, trust_on_first_use: bool) -> Self {
        Self {
            hosts: Mutex::new(hosts),
            path,
            trust_on_first_use,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 从文件加载
    pub fn load(path: PathBuf, trust_on_first_use: bool) -> anyhow::Result<Self> {
        let hosts = storage::load_known_hosts(&path)?;
        Ok(Self::new(hosts, Some(path), trust_on_first_use))
    }

    /// 比对指纹（只读）
    pub fn check(&self, host_id: &str, fingerprint: &str) -> HostKeyStatus {
        let hosts = self.hosts.lock();
        match hosts.find(host_id) {
            Some(known) if known.fingerprint == fingerprint => HostKeyStatus::Trusted,
            Some(known) => HostKeyStatus::Mismatch {
                expected: known.fingerprint.clone(),
            },
            None => HostKeyStatus::Unknown,
        }
    }

    /// 当前记录快照
    pub fn snapshot(&self) -> KnownHostsConfig {
        self.hosts.lock().clone()
    }

    /// 比对并在同一把锁内更新记录
    fn judge(&self, host_id: &str, key_type: &str, fingerprint: &str) -> Verdict {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M").to_string();
        let mut hosts = self.hosts.lock();

        let position = hosts.hosts.iter().position(|h| h.host == host_id);
        match position {
            Some(index) if hosts.hosts[index].fingerprint == fingerprint => {
                hosts.hosts[index].last_used = now;
                Verdict::Trusted
            }
            Some(index) => Verdict::Mismatch(hosts.hosts[index].fingerprint.clone()),
            None if self.trust_on_first_use => {
                hosts.hosts.push(KnownHost {
                    host: host_id.to_string(),
                    key_type: key_type.to_string(),
                    fingerprint: fingerprint.to_string(),
                    first_seen: now.clone(),
                    last_used: now,
                });
                Verdict::Learned
            }
            None => Verdict::Unknown,
        }
    }

    /// 写入 known_hosts 文件（阻塞 IO 放到 blocking 线程池）
    async fn persist(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };

        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot();
        let result =
            tokio::task::spawn_blocking(move || storage::save_known_hosts(&path, &snapshot)).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[HostKey] Failed to save known hosts: {:#}", e),
            Err(e) => error!("[HostKey] Known hosts writer panicked: {}", e),
        }
    }
}

#[async_trait]
impl HostKeyVerifier for KnownHostsVerifier {
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let host_id = format!("{}:{}", host, port);
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        match self.judge(&host_id, key.algorithm().as_str(), &fingerprint) {
            Verdict::Trusted => {
                self.persist().await;
                true
            }
            Verdict::Learned => {
                info!("[HostKey] Trusting new host {} ({})", host_id, fingerprint);
                self.persist().await;
                true
            }
            Verdict::Mismatch(expected) => {
                warn!(
                    "[HostKey] WARNING: Host key mismatch for {}! Expected: {}, Got: {}",
                    host_id, expected, fingerprint
                );
                false
            }
            Verdict::Unknown => {
                warn!("[HostKey] Unknown host {} ({}), rejecting", host_id, fingerprint);
                false
            }
        }
    }
}

/// 根据策略构建校验器
pub fn verifier_for_policy(
    policy: HostKeyPolicy,
    known_hosts_path: PathBuf,
) -> anyhow::Result<Arc<dyn HostKeyVerifier>> {
    Ok(match policy {
        HostKeyPolicy::AcceptAll => {
            warn!("[HostKey] Host key verification is disabled (accept_all)");
            Arc::new(AcceptAllHostKeys)
        }
        HostKeyPolicy::TrustOnFirstUse => Arc::new(KnownHostsVerifier::load(known_hosts_path, true)?),
        HostKeyPolicy::Strict => Arc::new(KnownHostsVerifier::load(known_hosts_path, false)?),
    })
}
