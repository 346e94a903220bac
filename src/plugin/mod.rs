pub mod log;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::PluginConfig;
use crate::anytun;
use crate::forwarder;
use crate::upstream::{self, UpstreamError};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// 单个请求的上下文
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_addr: SocketAddr,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            received_at: Instant::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{plugin}: 缺少参数 <{argument}>")]
    MissingArgument {
        plugin: &'static str,
        argument: &'static str,
    },
    #[error("{plugin}: 参数 <{argument}> 无效 ({value}): {reason}")]
    InvalidArgument {
        plugin: &'static str,
        argument: &'static str,
        value: String,
        reason: String,
    },
    #[error("{plugin}: 至少需要 {required} 个参数: {usage}")]
    TooFewArguments {
        plugin: &'static str,
        required: usize,
        usage: &'static str,
    },
    #[error("未知插件: {0}")]
    UnknownPlugin(String),
    #[error("插件已注册: {0}")]
    AlreadyRegistered(&'static str),
    #[error("插件链为空")]
    EmptyChain,
    #[error("插件注册表尚未初始化")]
    RegistryNotInitialized,
    #[error("{0}: 没有下一个插件")]
    NoNextPlugin(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("写入响应失败: {0}")]
    Write(#[from] std::io::Error),
}

/// 向客户端写回响应
#[async_trait]
pub trait ResponseWriter: Send {
    /// 写入一个已编码的DNS消息
    async fn write(&mut self, response: &[u8]) -> std::io::Result<()>;

    async fn write_msg(&mut self, message: &Message) -> std::io::Result<()> {
        let bytes = message.to_vec().map_err(std::io::Error::other)?;
        self.write(&bytes).await
    }

    /// 本次请求是否已经写过响应
    fn written(&self) -> bool;
}

/// 插件链中的处理器
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve_dns(
        &self,
        ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        query: &Message,
    ) -> Result<ResponseCode, PluginError>;

    fn name(&self) -> &str;
}

pub type NextHandler = Option<Arc<dyn Handler>>;

/// 交给下一个插件处理；没有下一个插件时返回错误，由服务器回复SERVFAIL
pub async fn next_or_failure(
    name: &str,
    next: Option<&Arc<dyn Handler>>,
    ctx: &RequestContext,
    writer: &mut dyn ResponseWriter,
    query: &Message,
) -> Result<ResponseCode, PluginError> {
    match next {
        Some(next) => {
            debug!("{} 交给下一个插件: {}", name, next.name());
            next.serve_dns(ctx, writer, query).await
        }
        None => Err(PluginError::NoNextPlugin(name.to_string())),
    }
}

/// 把 next 包装成最终的处理器
pub type PluginFactory = Box<dyn FnOnce(NextHandler) -> Arc<dyn Handler> + Send>;

/// 解析插件参数，失败即为配置错误
pub type SetupFn = fn(&[String]) -> Result<PluginFactory, PluginError>;

/// 插件注册表 - 插件名到 setup 函数的映射
pub struct PluginRegistry {
    setups: HashMap<&'static str, SetupFn>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            setups: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.setups.insert(log::NAME, log::setup);
        registry.setups.insert(forwarder::NAME, forwarder::setup);
        registry.setups.insert(anytun::NAME, anytun::setup);
        registry.setups.insert(upstream::NAME, upstream::setup);
        registry
    }

    #[cfg(test)]
    pub fn register(&mut self, name: &'static str, setup: SetupFn) -> Result<(), PluginError> {
        if self.setups.contains_key(name) {
            return Err(PluginError::AlreadyRegistered(name));
        }
        self.setups.insert(name, setup);
        Ok(())
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.setups.contains_key(name)
    }

    /// 按配置顺序构建插件链，返回链头。
    ///
    /// 先完成所有插件的 setup，任何一个配置错误都不会安装插件；
    /// 然后从后往前连接，每个插件的 next 是它后面的那个。
    pub fn build_chain(&self, directives: &[PluginConfig]) -> Result<Arc<dyn Handler>, PluginError> {
        let mut factories = Vec::with_capacity(directives.len());
        for directive in directives {
            let setup = self
                .setups
                .get(directive.name.as_str())
                .ok_or_else(|| PluginError::UnknownPlugin(directive.name.clone()))?;
            factories.push(setup(&directive.args)?);
        }

        let mut next: NextHandler = None;
        for factory in factories.into_iter().rev() {
            next = Some(factory(next));
        }

        let head = next.ok_or(PluginError::EmptyChain)?;
        info!("插件链构建完成，共 {} 个插件", directives.len());
        Ok(head)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: OnceLock<PluginRegistry> = OnceLock::new();

/// 注册内置插件。进程内只初始化一次，重复调用返回同一个注册表。
pub fn init_registry() -> &'static PluginRegistry {
    REGISTRY.get_or_init(|| {
        let registry = PluginRegistry::with_builtins();
        info!("已注册 {} 个内置插件", registry.setups.len());
        registry
    })
}

/// 获取全局注册表，必须先调用 [`init_registry`]
pub fn registry() -> Result<&'static PluginRegistry, PluginError> {
    REGISTRY.get().ok_or(PluginError::RegistryNotInitialized)
}

/// 取出第 `index` 个参数，缺失时返回命名该参数的配置错误
pub fn required_arg<'a>(
    plugin: &'static str,
    args: &'a [String],
    index: usize,
    argument: &'static str,
) -> Result<&'a str, PluginError> {
    args.get(index)
        .map(String::as_str)
        .ok_or(PluginError::MissingArgument { plugin, argument })
}
