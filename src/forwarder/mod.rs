//! 双路转发插件 `dualforwardsocks`。
//!
//! 每个查询先发一份副本给主上游（结果只记日志，不影响后续流程），
//! 然后经 SOCKS5 UDP 关联把原始查询发给次上游的53端口。
//! 代理、拨号、交换任何一步失败都交给插件链中的下一个处理器。

use crate::plugin::{
    Handler, NextHandler, PluginError, PluginFactory, RequestContext, ResponseWriter,
    next_or_failure, required_arg,
};
use crate::socks5::{ProxyEndpoint, Socks5Error, TargetAddr, UdpAssociation};
use crate::upstream::{self, DNS_PORT, UpstreamError, validate_response};
use crate::utils::split_host_port;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

pub const NAME: &str = "dualforwardsocks";

/// 经隧道交换的等待上限
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// 连接代理并完成握手的上限
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// 主上游沿用普通UDP客户端的默认超时
pub const PRIMARY_TIMEOUT: Duration = Duration::from_secs(2);

/// 启动时确定、之后只读的转发配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    /// `None` 表示关闭主上游探测。域名在每次探测时解析。
    pub primary: Option<TargetAddr>,
    /// 次上游主机，IP或域名，端口固定为53
    pub secondary: String,
    pub proxy: ProxyEndpoint,
    pub primary_timeout: Duration,
    pub dial_timeout: Duration,
    pub exchange_timeout: Duration,
}

impl ForwardConfig {
    pub fn new(primary: Option<TargetAddr>, secondary: impl Into<String>, proxy: ProxyEndpoint) -> Self {
        Self {
            primary,
            secondary: secondary.into(),
            proxy,
            primary_timeout: PRIMARY_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            exchange_timeout: EXCHANGE_TIMEOUT,
        }
    }

    /// 解析 `PRIMARY SECONDARY PROXY_ADDR PROXY_PORT`
    pub fn from_args(args: &[String]) -> Result<Self, PluginError> {
        let primary = required_arg(NAME, args, 0, "primary")?;
        let secondary = required_arg(NAME, args, 1, "secondary")?;
        let proxy_addr = required_arg(NAME, args, 2, "proxy-addr")?;
        let proxy_port = required_arg(NAME, args, 3, "proxy-port")?;
        if args.len() > 4 {
            return Err(invalid("args", args[4..].join(" "), "多余的参数".to_string()));
        }

        let primary = match primary {
            "off" => None,
            value => Some(
                TargetAddr::parse(value, DNS_PORT)
                    .map_err(|reason| invalid("primary", value.to_string(), reason))?,
            ),
        };

        let (secondary_host, secondary_port) = split_host_port(secondary);
        if secondary_host.is_empty() {
            return Err(invalid("secondary", secondary.to_string(), "主机为空".to_string()));
        }
        if let Some(port) = secondary_port {
            warn!("{}: 次上游 {} 的端口 {} 被忽略，始终使用 {}", NAME, secondary, port, DNS_PORT);
        }

        let proxy_port = proxy_port
            .parse::<u16>()
            .map_err(|e| invalid("proxy-port", proxy_port.to_string(), e.to_string()))?;
        if proxy_port == 0 {
            return Err(invalid("proxy-port", "0".to_string(), "端口不能为0".to_string()));
        }
        // PROXY_ADDR 自带端口时以它为准
        let proxy = ProxyEndpoint::parse(proxy_addr, proxy_port)
            .map_err(|reason| invalid("proxy-addr", proxy_addr.to_string(), reason))?;
        if proxy.port != proxy_port {
            warn!("{}: 代理地址 {} 自带端口，忽略 proxy-port {}", NAME, proxy_addr, proxy_port);
        }

        Ok(Self::new(primary, secondary_host, proxy))
    }

    pub fn secondary_target(&self) -> TargetAddr {
        TargetAddr::from_host(&self.secondary, DNS_PORT)
    }
}

fn invalid(argument: &'static str, value: String, reason: String) -> PluginError {
    PluginError::InvalidArgument {
        plugin: NAME,
        argument,
        value,
        reason,
    }
}

/// 次上游路径上的失败，全部触发回退
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("建立代理隧道失败: {0}")]
    Tunnel(Socks5Error),
    #[error("经代理连接次上游失败: {0}")]
    Dial(Socks5Error),
    #[error("经代理交换失败: {0}")]
    Exchange(Socks5Error),
    #[error("次上游响应无效: {0}")]
    Response(UpstreamError),
    #[error("等待次上游响应超时")]
    Timeout,
}

/// 经代理把查询发给 `target`，返回中继给出的原样响应字节。
///
/// ID不匹配的数据报被丢弃，继续等待直到 `exchange_timeout`。
/// 隧道在返回时随 [`crate::socks5::TunneledConn`] 一起释放。
pub async fn exchange_via_proxy(
    proxy: &ProxyEndpoint,
    target: TargetAddr,
    query: &Message,
    dial_timeout: Duration,
    exchange_timeout: Duration,
) -> Result<Vec<u8>, ForwardError> {
    let request = query
        .to_vec()
        .map_err(|e| ForwardError::Response(e.into()))?;

    let association = UdpAssociation::establish(proxy, dial_timeout)
        .await
        .map_err(ForwardError::Tunnel)?;

    debug!(relay = %association.relay_addr(), target = %target, "经代理连接上游");
    let conn = association.dial(target).await.map_err(ForwardError::Dial)?;

    let exchange = async {
        conn.send(&request).await.map_err(ForwardError::Exchange)?;
        loop {
            let response = conn.recv().await.map_err(ForwardError::Exchange)?;
            match validate_response(&response, query.id()) {
                Ok(_) => return Ok(response),
                Err(UpstreamError::IdMismatch { expected, actual }) => {
                    debug!(expected, actual, "丢弃ID不匹配的响应");
                }
                Err(e) => return Err(ForwardError::Response(e)),
            }
        }
    };
    timeout(exchange_timeout, exchange)
        .await
        .map_err(|_| ForwardError::Timeout)?
}

pub struct DualForward {
    config: ForwardConfig,
    next: NextHandler,
}

impl DualForward {
    pub fn new(config: ForwardConfig, next: NextHandler) -> Self {
        Self { config, next }
    }

    async fn resolve_primary(&self, primary: &TargetAddr) -> Result<SocketAddr, UpstreamError> {
        match primary {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(host, port) => {
                timeout(self.config.primary_timeout, lookup_host((host.as_str(), *port)))
                    .await
                    .map_err(|_| UpstreamError::Timeout)??
                    .next()
                    .ok_or_else(|| {
                        UpstreamError::Network(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("无法解析 {}:{}", host, port),
                        ))
                    })
            }
        }
    }

    /// 把查询副本发给主上游。结果只用于观测，调用方不得据此改变流程。
    async fn probe_primary(&self, query: &Message) {
        let Some(primary) = &self.config.primary else {
            return;
        };

        let copy = query.clone();
        let outcome = async {
            let addr = self.resolve_primary(primary).await?;
            let bytes = copy.to_vec()?;
            let response = upstream::exchange_udp(addr, &bytes, self.config.primary_timeout).await?;
            Ok::<_, UpstreamError>(response.len())
        }
        .await;

        match outcome {
            Ok(len) => debug!(primary = %primary, id = query.id(), bytes = len, "主上游已响应"),
            Err(e) => debug!(primary = %primary, id = query.id(), error = %e, "主上游查询失败"),
        }
    }

    /// 经代理向次上游发送原始查询，返回原样的响应字节
    async fn exchange_secondary(&self, query: &Message) -> Result<Vec<u8>, ForwardError> {
        exchange_via_proxy(
            &self.config.proxy,
            self.config.secondary_target(),
            query,
            self.config.dial_timeout,
            self.config.exchange_timeout,
        )
        .await
    }
}

pub fn setup(args: &[String]) -> Result<PluginFactory, PluginError> {
    let config = ForwardConfig::from_args(args)?;
    info!(
        "{}: 主上游 {}, 次上游 {}:{} 经代理 {}",
        NAME,
        config
            .primary
            .as_ref()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "off".to_string()),
        config.secondary,
        DNS_PORT,
        config.proxy
    );
    Ok(Box::new(move |next: NextHandler| Arc::new(DualForward::new(config, next)) as Arc<dyn Handler>))
}

#[async_trait]
impl Handler for DualForward {
    async fn serve_dns(
        &self,
        ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        query: &Message,
    ) -> Result<ResponseCode, PluginError> {
        self.probe_primary(query).await;

        match self.exchange_secondary(query).await {
            Ok(response) => {
                writer.write(&response).await?;
                Ok(ResponseCode::NoError)
            }
            Err(e) => {
                warn!(
                    client = %ctx.client_addr,
                    id = query.id(),
                    proxy = %self.config.proxy,
                    error = %e,
                    "次上游不可用，交给下一个插件"
                );
                next_or_failure(NAME, self.next.as_ref(), ctx, writer, query).await
            }
        }
    }

    fn name(&self) -> &str {
        NAME
    }
}
