use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use scheduler_core::{init_logging, AppConfig, LogFormat};
use scheduler_infrastructure::DatabaseManager;
use scheduler_jobstore::{JobStore, LoggingSignaler};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("scheduler-node")
        .version("1.0.0")
        .about("集群作业存储节点")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找 config/scheduler.toml 和 scheduler.toml"),
        )
        .arg(
            Arg::new("instance-id")
                .long("instance-id")
                .value_name("ID")
                .help("实例ID，AUTO 表示按主机名和时间生成"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");

    // 加载配置，命令行参数优先
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .context("加载配置失败")?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.parse::<LogFormat>()?;
    }
    if let Some(id) = matches.get_one::<String>("instance-id") {
        config.job_store.instance_id = id.clone();
    }

    init_logging(&config.logging)?;

    info!("启动集群作业存储节点");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }
    info!("数据库: {}", config.database.url);

    let database = DatabaseManager::new(&config.database).await?;
    database.migrate().await.context("初始化数据库表结构失败")?;

    let repositories = database.repositories(&config.job_store.instance_name);
    let store = JobStore::new(config.job_store.clone(), repositories)
        .context("创建作业存储失败")?;
    store.initialize(Arc::new(LoggingSignaler))?;

    let report = store.scheduler_started().await.context("启动作业存储失败")?;
    info!(
        "节点 {} 已加入集群 {}: {:?}",
        store.instance_id(),
        store.instance_name(),
        report
    );

    wait_for_shutdown_signal().await;

    info!("收到关闭信号，开始优雅关闭...");
    if let Err(e) = store.shutdown().await {
        error!("关闭作业存储失败: {e}");
    }
    database.close().await;

    info!("集群作业存储节点已退出");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
