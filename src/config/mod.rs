use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("无效的日志级别: {0}")]
    LogLevel(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 按顺序组成插件链
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

/// 插件指令，例如 `{"name": "dualforwardsocks", "args": ["8.8.8.8:53", "1.1.1.1", "127.0.0.1", "1080"]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("加载配置文件: {}", path.display());

        let content = fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;

        info!("配置文件加载成功");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.level()?;
        Ok(config)
    }

    pub fn level(&self) -> Result<tracing::Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }

    pub fn default_config() -> Self {
        let directive = |name: &str, args: &[&str]| PluginConfig {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };

        Config {
            server: ServerConfig {
                listen_addr: SocketAddr::from(([127, 0, 0, 1], 53)),
            },
            log_level: default_log_level(),
            plugins: vec![
                directive("log", &[]),
                directive(
                    "dualforwardsocks",
                    &["8.8.8.8:53", "1.1.1.1", "127.0.0.1", "1080"],
                ),
                directive("forward", &["1.1.1.1:53", "8.8.8.8:53"]),
            ],
        }
    }
}
