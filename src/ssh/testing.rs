// 测试用的进程内 SSH 服务器
//
// 只接受 deploy/secret 口令登录，支持 exec / shell / sftp：
// - exec "exit N": 以退出码 N 结束
// - exec "kill": 以 SIGKILL 信号结束
// - 其他 exec 命令: stdout 回显命令，stderr 输出 "err"，退出码 0
// - shell: 原样回显写入的数据

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::server::{Auth, Config, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, Sig};
use russh_sftp::protocol::StatusCode;
use tokio::net::TcpListener;

use crate::models::ConnectionDescriptor;

pub const USER: &str = "deploy";
pub const PASSWORD: &str = "secret";

/// 服务器主机密钥的 SHA256 指纹
pub const HOST_FINGERPRINT: &str = "SHA256:2MWT+cKo7TfnKzIyhaJKajrIEzHARBhnoOFKdfi0nso";

#[derive(Clone, Copy, Debug, Default)]
pub struct ServerOptions {
    /// 拒绝所有会话通道
    pub refuse_channels: bool,
}

pub struct TestServer {
    port: u16,
    accepts: Arc<AtomicUsize>,
    handles: Arc<Mutex<Vec<Handle>>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> Self {
        let key = russh::keys::decode_secret_key(include_str!("testdata/id_ed25519"), None)
            .expect("host key fixture");
        let config = Arc::new(Config {
            keys: vec![key],
            auth_rejection_time: Duration::ZERO,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let handles = Arc::new(Mutex::new(Vec::new()));

        let counter = accepts.clone();
        let running = handles.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let handler = TestHandler {
                    options,
                    channels: HashMap::new(),
                    shells: HashSet::new(),
                };
                if let Ok(session) = russh::server::run_stream(config.clone(), stream, handler).await {
                    running.lock().push(session.handle());
                    tokio::spawn(async move {
                        let _ = session.await;
                    });
                }
            }
        });

        Self {
            port,
            accepts,
            handles,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 已接受的 TCP 连接数
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// 服务器端主动断开所有连接
    pub async fn drop_connections(&self) {
        let handles: Vec<Handle> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle
                .disconnect(Disconnect::ByApplication, String::new(), "en".to_string())
                .await;
        }
    }

    /// 口令正确的连接描述
    pub fn descriptor(&self) -> ConnectionDescriptor {
        let mut conn = ConnectionDescriptor::new("127.0.0.1", self.port, USER);
        conn.password = Some(PASSWORD.to_string());
        conn
    }
}

struct TestHandler {
    options: ServerOptions,
    channels: HashMap<ChannelId, Channel<Msg>>,
    shells: HashSet<ChannelId>,
}

impl TestHandler {
    /// 取走通道对象；不读取的通道必须丢弃，否则缓冲区写满会阻塞会话
    fn take_channel(&mut self, id: ChannelId) -> Option<Channel<Msg>> {
        self.channels.remove(&id)
    }
}

impl russh::server::Handler for TestHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.options.refuse_channels {
            return Ok(false);
        }
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        drop(self.take_channel(channel));
        session.channel_success(channel)?;

        let command = String::from_utf8_lossy(data).to_string();
        if command == "kill" {
            session.exit_signal_request(channel, Sig::KILL, false, "", "")?;
        } else if let Some(code) = command.strip_prefix("exit ") {
            session.exit_status_request(channel, code.trim().parse().unwrap_or(1))?;
        } else {
            session.data(channel, CryptoVec::from(format!("{}\n", command).into_bytes()))?;
            session.extended_data(channel, 1, CryptoVec::from(b"err".to_vec()))?;
            session.exit_status_request(channel, 0)?;
        }

        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        drop(self.take_channel(channel));
        self.shells.insert(channel);
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // 只有 shell 通道回显，SFTP 通道的数据交给子系统处理
        if self.shells.contains(&channel) {
            session.data(channel, CryptoVec::from(data))?;
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match (name, self.take_channel(channel)) {
            ("sftp", Some(sftp_channel)) => {
                session.channel_success(channel)?;
                russh_sftp::server::run(sftp_channel.into_stream(), SftpHandler).await;
            }
            _ => session.channel_failure(channel)?,
        }
        Ok(())
    }
}

/// 只完成版本协商的 SFTP 服务端
struct SftpHandler;

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }
}
