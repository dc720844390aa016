// 本地数据持久化服务

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{ConnectionDescriptor, Credential, KnownHostsConfig, PoolSettings};
use crate::ssh::SshError;

/// 覆盖配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "SSHM_CONFIG";

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/sshm
/// Linux: ~/.config/sshm
/// Windows: C:\Users\<用户名>\AppData\Roaming\sshm
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join("sshm");
    Ok(config_dir)
}

/// 获取连接配置文件路径
pub fn get_config_file() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(get_config_dir()?.join("ssh.yaml"))
}

/// 获取 known_hosts 文件路径
pub fn get_known_hosts_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("known_hosts.json"))
}

/// 配置文件结构
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub connections: HashMap<String, ConnectionDescriptor>,
    #[serde(default)]
    pub credentials: HashMap<String, Credential>,
    #[serde(default)]
    pub settings: PoolSettings,
}

/// 配置存储（别名 -> 连接描述 / 凭证）
#[derive(Clone, Debug, Default)]
pub struct ConfigStore {
    file: ConfigFile,
}

impl ConfigStore {
    pub fn new(file: ConfigFile) -> Self {
        Self { file }
    }

    /// 从默认路径加载
    pub fn load_default() -> Result<Self> {
        Self::load(&get_config_file()?)
    }

    /// 从指定路径加载，文件不存在时返回空配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("[Storage] {} not found, using empty config", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        let file: ConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("无法解析配置文件 {}", path.display()))?;
        Ok(Self { file })
    }

    /// 保存到指定路径
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("无法创建配置目录")?;
        }
        let content = serde_yaml::to_string(&self.file).context("无法序列化配置")?;
        fs::write(path, content).context("无法写入配置文件")?;
        Ok(())
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.file.settings
    }

    pub fn get_connection(&self, alias: &str) -> Result<ConnectionDescriptor, SshError> {
        self.file
            .connections
            .get(alias)
            .cloned()
            .ok_or_else(|| SshError::NotFound(format!("connection alias '{}'", alias)))
    }

    pub fn get_credential(&self, alias: &str) -> Result<Credential, SshError> {
        self.file
            .credentials
            .get(alias)
            .cloned()
            .ok_or_else(|| SshError::NotFound(format!("credential alias '{}'", alias)))
    }

    /// 解析别名，并按优先级选择凭证：显式指定 > 连接的默认凭证 > 无
    pub fn resolve(
        &self,
        alias: &str,
        credential_alias: Option<&str>,
    ) -> Result<(ConnectionDescriptor, Option<Credential>), SshError> {
        let conn = self.get_connection(alias)?;
        let cred_alias = credential_alias
            .filter(|a| !a.is_empty())
            .or(conn.default_credential.as_deref().filter(|a| !a.is_empty()));
        let cred = match cred_alias {
            Some(a) => Some(self.get_credential(a)?),
            None => None,
        };
        Ok((conn, cred))
    }
}

// ======================== Known Hosts 持久化 ========================

/// 加载 known_hosts
pub fn load_known_hosts(path: &Path) -> Result<KnownHostsConfig> {
    if !path.exists() {
        return Ok(KnownHostsConfig::default());
    }
    let content = fs::read_to_string(path).context("无法读取 known_hosts 文件")?;
    let config: KnownHostsConfig =
        serde_json::from_str(&content).context("无法解析 known_hosts 文件")?;
    Ok(config)
}

/// 保存 known_hosts
pub fn save_known_hosts(path: &Path, config: &KnownHostsConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("无法创建配置目录")?;
    }
    let content = serde_json::to_string_pretty(config).context("无法序列化 known_hosts")?;
    fs::write(path, content).context("无法写入 known_hosts 文件")?;
    Ok(())
}
