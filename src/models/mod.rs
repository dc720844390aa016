// 数据模型模块

pub mod connection;
pub mod known_hosts;
pub mod settings;

pub use connection::{ConnectionDescriptor, Credential, CredentialKind};
pub use known_hosts::{KnownHost, KnownHostsConfig};
pub use settings::{HostKeyPolicy, PoolSettings};
