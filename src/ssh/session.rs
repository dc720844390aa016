// SSH 会话管理
// 认证成功后的会话句柄，调用方在其上打开自己的通道（Shell / Exec / SFTP）

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh::client::Msg;
use russh::{ChannelMsg, Disconnect, Sig};
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::error::SshError;
use super::handler::SshClientHandler;
use super::pool::PooledClient;

/// PTY 请求参数
#[derive(Clone, Debug)]
pub struct PtyRequest {
    /// 终端类型
    pub term: String,
    /// 列数
    pub col_width: u32,
    /// 行数
    pub row_height: u32,
    /// 像素宽度
    pub pix_width: u32,
    /// 像素高度
    pub pix_height: u32,
    /// 终端模式
    pub modes: Vec<(russh::Pty, u32)>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            modes: vec![
                (russh::Pty::ECHO, 1),
                (russh::Pty::TTY_OP_ISPEED, 14400),
                (russh::Pty::TTY_OP_OSPEED, 14400),
            ],
        }
    }
}

/// SSH 会话（认证成功后）
///
/// 生命周期归连接池所有：调用方只关闭自己打开的通道，不要关闭会话本身。
pub struct SshSession {
    /// 会话 ID
    id: String,
    /// 共享的 russh Handle
    handle: Arc<Handle<SshClientHandler>>,
    /// 服务器主机名
    host: String,
    /// 用户名
    username: String,
    /// 存活探测超时
    ping_timeout: Duration,
    /// 连接状态
    is_connected: AtomicBool,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("connected", &self.is_connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl SshSession {
    /// 创建新的会话
    pub fn new(
        handle: Handle<SshClientHandler>,
        host: String,
        username: String,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            handle: Arc::new(handle),
            host,
            username,
            ping_timeout,
            is_connected: AtomicBool::new(true),
        }
    }

    /// 获取会话 ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 获取主机名
    pub fn host(&self) -> &str {
        &self.host
    }

    /// 获取用户名
    pub fn username(&self) -> &str {
        &self.username
    }

    /// 检查会话是否活跃（不发送网络请求）
    pub fn is_alive(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed) && !self.handle.is_closed()
    }

    fn ensure_alive(&self) -> Result<(), SshError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SshError::Disconnected("Session is disconnected".to_string()))
        }
    }

    /// 打开终端 Shell 通道
    pub async fn open_terminal(&self, pty: PtyRequest) -> Result<TerminalChannel, SshError> {
        self.ensure_alive()?;

        let channel = self.handle.channel_open_session().await?;

        channel
            .request_pty(
                false,
                &pty.term,
                pty.col_width,
                pty.row_height,
                pty.pix_width,
                pty.pix_height,
                &pty.modes,
            )
            .await?;

        channel.request_shell(false).await?;

        Ok(TerminalChannel::new(channel, self.handle.clone()))
    }

    /// 打开执行通道
    pub async fn open_exec(&self) -> Result<ExecChannel, SshError> {
        self.ensure_alive()?;
        let channel = self.handle.channel_open_session().await?;
        Ok(ExecChannel::new(channel))
    }

    /// 打开 SFTP 子系统
    pub async fn open_sftp(&self) -> Result<SftpSession, SshError> {
        self.ensure_alive()?;

        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;

        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Channel(format!("Failed to create SFTP session: {}", e)))
    }
}

#[async_trait]
impl PooledClient for SshSession {
    /// 发送 keepalive@openssh.com（want_reply），服务器无论回复成功还是失败都说明连接仍然存活
    async fn ping(&self) -> bool {
        if !self.is_alive() {
            return false;
        }

        match timeout(self.ping_timeout, self.handle.send_ping()).await {
            // 会话任务退出时 send_ping 也会返回，需要再确认一次
            Ok(Ok(())) => !self.handle.is_closed(),
            Ok(Err(e)) => {
                debug!("[SSH] Ping failed for session {}: {}", self.id, e);
                false
            }
            Err(_) => {
                debug!("[SSH] Ping timed out for session {}", self.id);
                false
            }
        }
    }

    async fn close(&self) {
        // 只关闭一次
        if !self.is_connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("[SSH] Disconnect of session {} failed: {}", self.id, e);
        }
    }
}

// 使用 russh::client::Msg 作为消息类型
type RusshChannel = russh::Channel<Msg>;

/// 终端通道
/// 分离读写路径以避免死锁：
/// - 读：需要 channel.wait()，会持有 channel 内部状态
/// - 写：直接使用 handle.data()，不需要持有 channel 锁
pub struct TerminalChannel {
    id: russh::ChannelId,
    handle: Arc<Handle<SshClientHandler>>,
    channel: Mutex<RusshChannel>,
}

impl TerminalChannel {
    fn new(channel: RusshChannel, handle: Arc<Handle<SshClientHandler>>) -> Self {
        Self {
            id: channel.id(),
            channel: Mutex::new(channel),
            handle,
        }
    }

    /// 写入数据到终端
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.handle
            .data(self.id, data.to_vec().into())
            .await
            .map_err(|_| SshError::Channel("Failed to send data to channel".to_string()))
    }

    /// 读取终端输出，None 表示通道已关闭
    pub async fn read(&self) -> Result<Option<Vec<u8>>, SshError> {
        let mut channel = self.channel.lock().await;

        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => Ok(Some(data.to_vec())),
            Some(ChannelMsg::ExtendedData { data, .. }) => Ok(Some(data.to_vec())),
            Some(ChannelMsg::Eof | ChannelMsg::Close) | None => Ok(None),
            Some(_) => Ok(Some(vec![])),
        }
    }

    /// 调整终端大小
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        let channel = self.channel.lock().await;
        channel
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    /// 关闭通道（不影响底层会话）
    pub async fn close(&self) -> Result<(), SshError> {
        let channel = self.channel.lock().await;
        channel
            .eof()
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }
}

/// 执行通道（执行单个命令）
pub struct ExecChannel {
    channel: Mutex<RusshChannel>,
}

impl ExecChannel {
    fn new(channel: RusshChannel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// 执行命令并获取输出
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.channel.lock().await;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        let mut exit_signal = None;

        while let Some(channel_msg) = channel.wait().await {
            match channel_msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                // ext == 1 为 stderr
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => exit_signal = Some(signal_name),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        // 被信号终止时按 shell 惯例返回 128 + 信号值；既无退出码也无信号视为异常
        let exit_code = match (exit_code, &exit_signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal_number(signal),
            (None, None) => {
                debug!("[SSH] Channel closed without exit status");
                255
            }
        };

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            exit_signal: exit_signal.map(|signal| signal_name(&signal)),
        })
    }
}

fn signal_number(signal: &Sig) -> u32 {
    match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::Custom(_) => 127,
    }
}

fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

/// 命令输出
#[derive(Debug)]
pub struct CommandOutput {
    /// 标准输出
    pub stdout: Vec<u8>,
    /// 标准错误
    pub stderr: Vec<u8>,
    /// 退出码
    pub exit_code: u32,
    /// 终止命令的信号名（如 KILL）
    pub exit_signal: Option<String>,
}

impl CommandOutput {
    /// 获取标准输出字符串
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// 获取标准错误字符串
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// 检查命令是否成功
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.exit_signal.is_none()
    }
}
