//! # SIS Gateway 主程序
//!
//! 校园考勤平台出站集成网关守护进程

use clap::{Parser, Subcommand};
use sis_gateway::{
    GatewayCoordinator, Result,
    config::{self, CredentialCrypto, MASTER_KEY_ENV},
    lerror, linfo,
    logging::{self, LogComponent, LogStage},
};
use std::path::PathBuf;

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "sis-gateway", about = "Outbound SIS integration gateway")]
struct Cli {
    /// 配置文件路径（默认 config/gateway.{RUST_ENV}.toml）
    #[arg(long)]
    config: Option<PathBuf>,
    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

/// 子命令
#[derive(Debug, Subcommand)]
enum Command {
    /// 生成一个新的主密钥（写入环境变量后用于密钥存储加密）
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Keygen) = cli.command {
        println!("{}={}", MASTER_KEY_ENV, CredentialCrypto::generate_key());
        return Ok(());
    }

    // 初始化日志系统
    logging::init_logging(cli.log_level.as_ref());

    // 加载并验证配置
    let app_config = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };

    // 构建并启动协调器
    let coordinator = GatewayCoordinator::new(app_config)?;
    coordinator.start().await?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "service_started",
        "SIS gateway started, waiting for shutdown signal"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        lerror!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "signal_wait_failed",
            "Failed to wait for shutdown signal",
            error = %err
        );
    }

    coordinator.stop().await;

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_stopped",
        "SIS gateway stopped"
    );
    Ok(())
}
