// SSH 连接池
//
// 按 user@host:port 复用已认证的会话：
// - 命中时先做存活探测，失败则移除并重新创建
// - 每个会话一个心跳任务，探测失败即移除
// - 全局空闲清理任务，关闭超过空闲阈值的会话
//
// 所有移除路径都按 Arc 身份比对，同一会话只会被移除、关闭一次。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::validate_descriptor;
use super::config::PoolConfig;
use super::error::SshError;
use crate::models::{ConnectionDescriptor, Credential};

/// 可被连接池管理的会话
#[async_trait]
pub trait PooledClient: Send + Sync + 'static {
    /// 需要对端回应的存活探测，超时或出错都返回 false
    async fn ping(&self) -> bool;

    /// 关闭底层连接，可重复调用
    async fn close(&self);
}

/// 会话工厂：拨号并完成认证
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Client: PooledClient;

    async fn dial(
        &self,
        conn: &ConnectionDescriptor,
        cred: Option<&Credential>,
    ) -> Result<Arc<Self::Client>, SshError>;
}

/// 连接池键：effective_user@host:port
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn new(conn: &ConnectionDescriptor, cred: Option<&Credential>) -> Self {
        Self(format!(
            "{}@{}:{}",
            conn.effective_user(cred),
            conn.host,
            conn.port
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct PooledEntry<C> {
    client: Arc<C>,
    last_used: Instant,
}

enum Registration<C> {
    Inserted,
    Existing(Arc<C>),
    PoolClosed,
}

struct PoolInner<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    entries: RwLock<HashMap<PoolKey, PooledEntry<F::Client>>>,
    shutdown: CancellationToken,
}

impl<F: SessionFactory> PoolInner<F> {
    /// 条目是否仍指向该会话
    fn holds(&self, key: &PoolKey, client: &Arc<F::Client>) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.client, client))
    }

    fn touch(&self, key: &PoolKey, client: &Arc<F::Client>) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            if Arc::ptr_eq(&entry.client, client) {
                entry.last_used = Instant::now();
            }
        }
    }

    /// 移除并关闭会话；条目已被替换或移除时什么都不做
    async fn evict(&self, key: &PoolKey, client: &Arc<F::Client>) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let same = entries
                .get(key)
                .is_some_and(|entry| Arc::ptr_eq(&entry.client, client));
            if same {
                entries.remove(key);
            }
            same
        };

        if removed {
            client.close().await;
        }
        removed
    }

    async fn sweep_idle(&self, now: Instant) -> Vec<PoolKey> {
        let idle_timeout = self.config.idle_timeout;
        let mut expired = Vec::new();

        self.entries.write().retain(|key, entry| {
            if now.saturating_duration_since(entry.last_used) > idle_timeout {
                expired.push((key.clone(), entry.client.clone()));
                false
            } else {
                true
            }
        });

        for (key, _) in &expired {
            info!("[Pool] Closing idle session {}", key);
        }
        join_all(expired.iter().map(|(_, client)| client.close())).await;
        expired.into_iter().map(|(key, _)| key).collect()
    }
}

/// SSH 连接池
///
/// 必须在 Tokio 运行时内创建（会启动空闲清理任务）。克隆只复制句柄，
/// 所有克隆共享同一个注册表。
pub struct ConnectionPool<F: SessionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: SessionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: SessionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            factory,
            config,
            entries: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(idle_sweep_loop(
            Arc::downgrade(&inner),
            inner.config.idle_sweep_interval,
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 获取（或创建）会话
    ///
    /// 命中时探测失败不会返回给调用方，只会触发移除并重新创建。
    /// 工厂的错误原样返回，不重试。
    pub async fn get_client(
        &self,
        conn: &ConnectionDescriptor,
        cred: Option<&Credential>,
    ) -> Result<Arc<F::Client>, SshError> {
        validate_descriptor(conn)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(SshError::Disconnected("Connection pool is shut down".to_string()));
        }

        let key = PoolKey::new(conn, cred);

        let cached = self
            .inner
            .entries
            .read()
            .get(&key)
            .map(|entry| entry.client.clone());

        if let Some(client) = cached {
            if client.ping().await {
                self.inner.touch(&key, &client);
                debug!("[Pool] Reusing session {}", key);
                return Ok(client);
            }
            warn!("[Pool] Session {} failed liveness check, recreating", key);
            self.inner.evict(&key, &client).await;
        }

        debug!("[Pool] Creating session {}", key);
        let client = self.inner.factory.dial(conn, cred).await?;

        // 先到先得：其他调用已注册同一个键时，关闭自己新建的会话
        let registration = {
            let mut entries = self.inner.entries.write();
            if self.inner.shutdown.is_cancelled() {
                Registration::PoolClosed
            } else {
                match entries.entry(key.clone()) {
                    Entry::Occupied(occupied) => {
                        Registration::Existing(occupied.get().client.clone())
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(PooledEntry {
                            client: client.clone(),
                            last_used: Instant::now(),
                        });
                        Registration::Inserted
                    }
                }
            }
        };

        match registration {
            Registration::PoolClosed => {
                client.close().await;
                Err(SshError::Disconnected("Connection pool is shut down".to_string()))
            }
            Registration::Existing(registered) => {
                debug!("[Pool] Session {} was registered concurrently, dropping duplicate", key);
                client.close().await;
                Ok(registered)
            }
            Registration::Inserted => {
                info!("[Pool] Registered session {}", key);
                tokio::spawn(keepalive_loop(
                    Arc::downgrade(&self.inner),
                    key,
                    client.clone(),
                    self.inner.shutdown.clone(),
                ));
                Ok(client)
            }
        }
    }

    /// 执行一次空闲清理，返回被关闭的键
    pub async fn sweep_idle(&self, now: Instant) -> Vec<PoolKey> {
        self.inner.sweep_idle(now).await
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    pub fn contains(&self, key: &PoolKey) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    /// 停止后台任务并关闭所有会话
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let drained: Vec<_> = self.inner.entries.write().drain().collect();
        if !drained.is_empty() {
            info!("[Pool] Shutting down, closing {} session(s)", drained.len());
        }
        join_all(drained.iter().map(|(_, entry)| entry.client.close())).await;
    }
}

/// 单会话心跳：探测失败即移除；条目已不属于该会话时退出
async fn keepalive_loop<F: SessionFactory>(
    pool: Weak<PoolInner<F>>,
    key: PoolKey,
    client: Arc<F::Client>,
    shutdown: CancellationToken,
) {
    let Some(period) = pool.upgrade().map(|inner| inner.config.keepalive_interval) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = pool.upgrade() else { break };
        if !inner.holds(&key, &client) {
            debug!("[Pool] Session {} no longer pooled, keepalive stopped", key);
            break;
        }

        if client.ping().await {
            if inner.config.refresh_on_keepalive {
                inner.touch(&key, &client);
            }
        } else {
            warn!("[Pool] Keepalive failed for {}, evicting", key);
            inner.evict(&key, &client).await;
            break;
        }
    }
}

async fn idle_sweep_loop<F: SessionFactory>(
    pool: Weak<PoolInner<F>>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = pool.upgrade() else { break };
        let evicted = inner.sweep_idle(Instant::now()).await;
        if !evicted.is_empty() {
            debug!("[Pool] Idle sweep closed {} session(s)", evicted.len());
        }
    }
}
