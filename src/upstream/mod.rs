use crate::plugin::{
    Handler, NextHandler, PluginError, PluginFactory, RequestContext, ResponseWriter,
};
use crate::utils::parse_socket_addr;

use async_trait::async_trait;
use hickory_proto::ProtoError;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

pub const NAME: &str = "forward";

/// DNS默认端口
pub const DNS_PORT: u16 = 53;

/// 未显式指定时单个上游的超时时间
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// EDNS下常见的UDP响应上限
const UDP_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("所有上游服务器不可用")]
    AllUpstreamsUnavailable,
    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),
    #[error("请求超时")]
    Timeout,
    #[error("响应格式错误: {0}")]
    Malformed(#[from] ProtoError),
    #[error("响应ID不匹配: 期望 {expected}, 收到 {actual}")]
    IdMismatch { expected: u16, actual: u16 },
    #[error("收到的不是响应消息")]
    NotAResponse,
}

/// 检查上游返回的字节是否是对应查询的合法响应
pub fn validate_response(response: &[u8], expected_id: u16) -> Result<Message, UpstreamError> {
    let message = Message::from_vec(response)?;
    if message.id() != expected_id {
        return Err(UpstreamError::IdMismatch {
            expected: expected_id,
            actual: message.id(),
        });
    }
    if message.message_type() != MessageType::Response {
        return Err(UpstreamError::NotAResponse);
    }
    Ok(message)
}

/// UDP查询，返回原始响应字节
pub async fn exchange_udp(
    addr: SocketAddr,
    query: &[u8],
    wait: Duration,
) -> Result<Vec<u8>, UpstreamError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    socket.send(query).await?;

    let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
    let len = timeout(wait, socket.recv(&mut buffer))
        .await
        .map_err(|_| UpstreamError::Timeout)??;
    buffer.truncate(len);
    Ok(buffer)
}

/// TCP查询，消息带两字节长度前缀
pub async fn exchange_tcp(
    addr: SocketAddr,
    query: &[u8],
    wait: Duration,
) -> Result<Vec<u8>, UpstreamError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;

        let mut message = Vec::with_capacity(query.len() + 2);
        message.extend_from_slice(&(query.len() as u16).to_be_bytes());
        message.extend_from_slice(query);
        stream.write_all(&message).await?;

        let mut len_bytes = [0u8; 2];
        stream.read_exact(&mut len_bytes).await?;
        let mut response = vec![0u8; u16::from_be_bytes(len_bytes) as usize];
        stream.read_exact(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    };

    Ok(timeout(wait, exchange)
        .await
        .map_err(|_| UpstreamError::Timeout)??)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub protocol: Protocol,
}

impl Upstream {
    /// 解析 `udp://1.1.1.1:53`、`tcp://[2606:4700::1111]` 或裸地址，默认UDP和53端口
    pub fn parse(value: &str) -> Result<Self, String> {
        let (protocol, rest) = if let Some(rest) = value.strip_prefix("tcp://") {
            (Protocol::Tcp, rest)
        } else if let Some(rest) = value.strip_prefix("udp://") {
            (Protocol::Udp, rest)
        } else if value.contains("://") {
            return Err("只支持 udp:// 和 tcp://".to_string());
        } else {
            (Protocol::Udp, value)
        };
        let addr = parse_socket_addr(rest, DNS_PORT)?;
        Ok(Self { addr, protocol })
    }

    pub async fn exchange(&self, query: &[u8], wait: Duration) -> Result<Vec<u8>, UpstreamError> {
        match self.protocol {
            Protocol::Udp => exchange_udp(self.addr, query, wait).await,
            Protocol::Tcp => exchange_tcp(self.addr, query, wait).await,
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Udp => write!(f, "udp://{}", self.addr),
            Protocol::Tcp => write!(f, "tcp://{}", self.addr),
        }
    }
}

/// 普通转发插件 - 按顺序尝试上游服务器，失败时切换到下一个
pub struct ForwardPlugin {
    upstreams: Vec<Upstream>,
    current: AtomicUsize,
    timeout: Duration,
}

impl ForwardPlugin {
    pub fn new(upstreams: Vec<Upstream>, timeout: Duration) -> Self {
        Self {
            upstreams,
            current: AtomicUsize::new(0),
            timeout,
        }
    }

    /// 解析DNS查询，返回第一个成功的上游响应
    pub async fn resolve(&self, query: &Message) -> Result<Vec<u8>, UpstreamError> {
        let request = query.to_vec()?;
        let start = self.current.load(Ordering::Relaxed);

        for attempt in 0..self.upstreams.len() {
            let index = (start + attempt) % self.upstreams.len();
            let upstream = &self.upstreams[index];
            debug!("尝试使用上游服务器: {}", upstream);

            let result = upstream
                .exchange(&request, self.timeout)
                .await
                .and_then(|response| validate_response(&response, query.id()).map(|_| response));

            match result {
                Ok(response) => {
                    debug!("从上游服务器 {} 获得响应", upstream);
                    self.current.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => warn!("上游服务器 {} 查询失败: {}", upstream, e),
            }
        }

        error!("所有上游服务器都不可用");
        Err(UpstreamError::AllUpstreamsUnavailable)
    }
}

pub fn setup(args: &[String]) -> Result<PluginFactory, PluginError> {
    if args.is_empty() {
        return Err(PluginError::MissingArgument {
            plugin: NAME,
            argument: "upstream",
        });
    }

    let upstreams = args
        .iter()
        .map(|value| {
            Upstream::parse(value).map_err(|reason| PluginError::InvalidArgument {
                plugin: NAME,
                argument: "upstream",
                value: value.clone(),
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!("forward 上游服务器数量: {}", upstreams.len());
    Ok(Box::new(move |_next: NextHandler| {
        Arc::new(ForwardPlugin::new(upstreams, DEFAULT_TIMEOUT)) as Arc<dyn Handler>
    }))
}

#[async_trait]
impl Handler for ForwardPlugin {
    async fn serve_dns(
        &self,
        _ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        query: &Message,
    ) -> Result<ResponseCode, PluginError> {
        let response = self.resolve(query).await?;
        writer.write(&response).await?;
        Ok(ResponseCode::NoError)
    }

    fn name(&self) -> &str {
        NAME
    }
}
