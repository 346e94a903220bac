mod anytun;
mod config;
mod forwarder;
mod plugin;
mod server;
mod socks5;
mod upstream;
mod utils;

use clap::Parser;
use config::Config;
use server::DnsServer;
use std::path::PathBuf;
use tracing::{error, info};

/// 经SOCKS5代理的双路DNS转发器
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/config.json")]
    config: PathBuf,

    /// 打印默认配置后退出
    #[arg(long)]
    dump_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.dump_default_config {
        println!("{}", serde_json::to_string_pretty(&Config::default_config())?);
        return Ok(());
    }

    // 加载配置
    let config = match Config::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置文件失败: {}", e);
            return Err(e.into());
        }
    };

    // 初始化 tracing 日志系统
    tracing_subscriber::fmt()
        .with_max_level(config.level()?)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("启动DNS转发器...");

    plugin::init_registry();

    let server = match DnsServer::new(&config) {
        Ok(server) => server,
        Err(e) => {
            error!("创建DNS服务器失败: {}", e);
            return Err(e.into());
        }
    };

    info!("监听地址: {}", server.listen_address());

    if let Err(e) = server.run().await {
        error!("DNS服务器运行错误: {}", e);
        return Err(e.into());
    }
    Ok(())
}
