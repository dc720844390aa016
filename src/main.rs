// sshm - 通过连接池在远程主机上执行命令
//
// 用法: sshm <alias> [--credential <alias>] [command...]

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use sshm::services::{storage, ConfigStore};
use sshm::ssh::config::ping_timeout;
use sshm::ssh::{verifier_for_policy, ConnectionPool, PoolConfig, SshClient};

const DEFAULT_COMMAND: &str = "uname -a";

struct Args {
    alias: String,
    credential: Option<String>,
    command: String,
}

fn parse_args() -> Result<Args> {
    let mut alias = None;
    let mut credential = None;
    let mut command = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--credential" if alias.is_some() && command.is_empty() => {
                credential = Some(args.next().context("--credential requires a value")?);
            }
            _ if alias.is_none() => alias = Some(arg),
            _ => command.push(arg),
        }
    }

    let Some(alias) = alias else {
        bail!("usage: sshm <alias> [--credential <alias>] [command...]");
    };
    let command = if command.is_empty() {
        DEFAULT_COMMAND.to_string()
    } else {
        command.join(" ")
    };

    Ok(Args {
        alias,
        credential,
        command,
    })
}

async fn run(args: Args) -> Result<i32> {
    let store = ConfigStore::load_default()?;
    let settings = store.settings().clone();

    let verifier = verifier_for_policy(settings.host_key_policy, storage::get_known_hosts_file()?)?;
    let factory = SshClient::new(verifier)
        .with_ping_timeout(ping_timeout(&settings));
    let pool = ConnectionPool::new(factory, PoolConfig::from(&settings));

    let (conn, cred) = store.resolve(&args.alias, args.credential.as_deref())?;

    let result = async {
        let session = pool.get_client(&conn, cred.as_ref()).await?;
        let exec = session.open_exec().await?;
        exec.exec(&args.command).await
    }
    .await;

    pool.shutdown().await;

    let output = result.with_context(|| format!("Failed to run command on '{}'", args.alias))?;
    print!("{}", output.stdout_string());
    eprint!("{}", output.stderr_string());
    match &output.exit_signal {
        Some(signal) => warn!("Command killed by signal {}", signal),
        None => info!("Command exited with status {}", output.exit_code),
    }

    Ok(output.exit_code as i32)
}

fn main() -> Result<()> {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug sshm prod
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false) // 不显示 target（模块路径）
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ssh-worker")
        .build()
        .context("Failed to create Tokio runtime")?;

    let code = runtime.block_on(run(args))?;
    drop(runtime);
    std::process::exit(code);
}
