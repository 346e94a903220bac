//! `anytun PROXY_ADDR DNS_SERVER...`
//!
//! 所有查询经同一个SOCKS5代理发往列出的DNS服务器，按顺序切换，
//! 记住上一次成功的服务器。全部失败时交给下一个插件。

use crate::forwarder::{DIAL_TIMEOUT, EXCHANGE_TIMEOUT, exchange_via_proxy};
use crate::plugin::{
    Handler, NextHandler, PluginError, PluginFactory, RequestContext, ResponseWriter,
    next_or_failure,
};
use crate::socks5::{ProxyEndpoint, TargetAddr};
use crate::upstream::{DNS_PORT, UpstreamError};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Duration;
use tracing::{debug, info, warn};

pub const NAME: &str = "anytun";

/// PROXY_ADDR 不带端口时使用的SOCKS默认端口
pub const SOCKS_PORT: u16 = 1080;

pub struct AnyTun {
    proxy: ProxyEndpoint,
    servers: Vec<TargetAddr>,
    current: AtomicUsize,
    dial_timeout: Duration,
    exchange_timeout: Duration,
    next: NextHandler,
}

impl AnyTun {
    pub fn new(proxy: ProxyEndpoint, servers: Vec<TargetAddr>, next: NextHandler) -> Self {
        Self {
            proxy,
            servers,
            current: AtomicUsize::new(0),
            dial_timeout: DIAL_TIMEOUT,
            exchange_timeout: EXCHANGE_TIMEOUT,
            next,
        }
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, dial_timeout: Duration, exchange_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self.exchange_timeout = exchange_timeout;
        self
    }

    /// 从上次成功的服务器开始依次尝试，返回第一个合法响应的原始字节
    pub async fn resolve(&self, query: &Message) -> Result<Vec<u8>, UpstreamError> {
        let start = self.current.load(Ordering::Relaxed);

        for attempt in 0..self.servers.len() {
            let index = (start + attempt) % self.servers.len();
            let server = &self.servers[index];
            debug!("{} 经代理 {} 尝试 {}", NAME, self.proxy, server);

            match exchange_via_proxy(
                &self.proxy,
                server.clone(),
                query,
                self.dial_timeout,
                self.exchange_timeout,
            )
            .await
            {
                Ok(response) => {
                    self.current.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => warn!(server = %server, proxy = %self.proxy, error = %e, "经代理查询失败"),
            }
        }

        Err(UpstreamError::AllUpstreamsUnavailable)
    }
}

pub fn setup(args: &[String]) -> Result<PluginFactory, PluginError> {
    if args.len() < 2 {
        return Err(PluginError::TooFewArguments {
            plugin: NAME,
            required: 2,
            usage: "<proxy-addr> <dns-server>...",
        });
    }

    let proxy = ProxyEndpoint::parse(&args[0], SOCKS_PORT).map_err(|reason| PluginError::InvalidArgument {
        plugin: NAME,
        argument: "proxy-addr",
        value: args[0].clone(),
        reason,
    })?;

    let servers = args[1..]
        .iter()
        .map(|value| {
            TargetAddr::parse(value, DNS_PORT).map_err(|reason| PluginError::InvalidArgument {
                plugin: NAME,
                argument: "dns-server",
                value: value.clone(),
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!("{}: 代理 {}, DNS服务器数量: {}", NAME, proxy, servers.len());
    Ok(Box::new(move |next: NextHandler| {
        Arc::new(AnyTun::new(proxy, servers, next)) as Arc<dyn Handler>
    }))
}

#[async_trait]
impl Handler for AnyTun {
    async fn serve_dns(
        &self,
        ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        query: &Message,
    ) -> Result<ResponseCode, PluginError> {
        match self.resolve(query).await {
            Ok(response) => {
                writer.write(&response).await?;
                Ok(ResponseCode::NoError)
            }
            Err(e) => {
                warn!(client = %ctx.client_addr, id = query.id(), error = %e, "{} 交给下一个插件", NAME);
                next_or_failure(NAME, self.next.as_ref(), ctx, writer, query).await
            }
        }
    }

    fn name(&self) -> &str {
        NAME
    }
}
