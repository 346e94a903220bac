use crate::config::Config;
use crate::plugin::{self, Handler, PluginError, RequestContext, ResponseWriter};
use crate::utils::{create_dns_error_response, dns_rcode, extract_query_id};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

const RECV_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum DnsServerError {
    #[error("初始化错误: {0}")]
    InitializationError(#[from] PluginError),
    #[error("网络错误: {0}")]
    NetworkError(#[from] std::io::Error),
}

/// 把响应发回UDP客户端
pub struct UdpResponseWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    written: bool,
}

impl UdpResponseWriter {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            written: false,
        }
    }
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    async fn write(&mut self, response: &[u8]) -> std::io::Result<()> {
        if self.written {
            warn!("忽略发往 {} 的重复响应", self.peer);
            return Ok(());
        }
        self.socket.send_to(response, self.peer).await?;
        self.written = true;
        Ok(())
    }

    fn written(&self) -> bool {
        self.written
    }
}

/// 这些响应码表示插件没有给客户端写任何东西，需要由服务器回复
fn needs_error_reply(rcode: ResponseCode) -> bool {
    matches!(
        rcode,
        ResponseCode::ServFail | ResponseCode::Refused | ResponseCode::FormErr | ResponseCode::NotImp
    )
}

fn error_reply(query: &Message, rcode: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode);
    reply.add_queries(query.queries().to_vec());
    reply
}

/// 让插件链处理一个查询，并保证客户端最多收到一个响应
pub async fn dispatch(
    chain: &dyn Handler,
    ctx: &RequestContext,
    writer: &mut dyn ResponseWriter,
    query: &Message,
) -> std::io::Result<()> {
    let rcode = match chain.serve_dns(ctx, writer, query).await {
        Ok(rcode) => rcode,
        Err(e) => {
            warn!("处理来自 {} 的查询失败: {}", ctx.client_addr, e);
            ResponseCode::ServFail
        }
    };

    if !writer.written() && needs_error_reply(rcode) {
        writer.write_msg(&error_reply(query, rcode)).await?;
    }
    Ok(())
}

/// DNS转发服务器
pub struct DnsServer {
    listen_addr: SocketAddr,
    chain: Arc<dyn Handler>,
}

impl DnsServer {
    /// 从配置构建插件链，任何插件配置错误都会阻止服务器创建
    pub fn new(config: &Config) -> Result<Self, DnsServerError> {
        let chain = plugin::registry()?.build_chain(&config.plugins)?;

        info!("DNS服务器初始化完成");
        info!("监听地址: {}", config.server.listen_addr);

        Ok(Self {
            listen_addr: config.server.listen_addr,
            chain,
        })
    }

    pub fn listen_address(&self) -> SocketAddr {
        self.listen_addr
    }

    /// 在已绑定的套接字上处理查询，每个查询一个任务
    pub async fn serve(&self, socket: Arc<UdpSocket>) -> Result<(), DnsServerError> {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let (len, client_addr) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    error!("UDP接收错误: {}", e);
                    continue;
                }
            };
            debug!("收到来自 {} 的DNS查询，长度: {} bytes", client_addr, len);

            let packet = buffer[..len].to_vec();
            let socket = socket.clone();
            let chain = self.chain.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_packet(chain, socket, client_addr, packet).await {
                    error!("发送响应失败: {}", e);
                }
            });
        }
    }

    /// 启动DNS服务器，直到收到 Ctrl-C
    pub async fn run(&self) -> Result<(), DnsServerError> {
        let socket = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        info!("启动UDP服务器在地址: {}", socket.local_addr()?);

        tokio::select! {
            result = self.serve(socket) => result,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("收到停止信号，正在关闭DNS服务器...");
                Ok(())
            }
        }
    }
}

async fn handle_packet(
    chain: Arc<dyn Handler>,
    socket: Arc<UdpSocket>,
    client_addr: SocketAddr,
    packet: Vec<u8>,
) -> std::io::Result<()> {
    let query = match Message::from_vec(&packet) {
        Ok(query) => query,
        Err(e) => {
            debug!("无法解析来自 {} 的查询: {}", client_addr, e);
            if let Some(query_id) = extract_query_id(&packet) {
                let response = create_dns_error_response(query_id, dns_rcode::FORMAT_ERROR);
                socket.send_to(&response, client_addr).await?;
            }
            return Ok(());
        }
    };

    let ctx = RequestContext::new(client_addr);
    let mut writer = UdpResponseWriter::new(socket, client_addr);
    dispatch(chain.as_ref(), &ctx, &mut writer, &query).await
}
