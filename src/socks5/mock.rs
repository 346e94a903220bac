//! 测试用的本地SOCKS5代理，只支持 UDP ASSOCIATE

use super::{
    METHOD_NO_AUTH, METHOD_NOT_ACCEPTABLE, ProxyEndpoint, SOCKS_VERSION, TargetAddr,
    decode_udp_packet, encode_udp_packet,
};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::serialize::binary::BinEncodable;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

/// 中继收到数据报后的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// 原样回显负载
    Echo,
    /// 把负载当作DNS查询，回复一条A记录
    Answer,
    /// 先回复一个ID错位的旧响应，再回复正确的A记录
    StaleThenAnswer,
    /// 只回答发往该端口的查询，其余不回复
    AnswerPort(u16),
    /// 收下数据报但从不回复
    Silent,
    /// 握手阶段拒绝无认证方式
    RequireAuth,
}

const ANSWER_ADDR: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

pub struct MockProxy {
    addr: SocketAddr,
    targets: Arc<Mutex<Vec<TargetAddr>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closed_rx: mpsc::UnboundedReceiver<()>,
}

impl MockProxy {
    pub async fn spawn(mode: RelayMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let targets = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let log = RelayLog {
            targets: targets.clone(),
            sent: sent.clone(),
        };
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = log.clone();
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    serve_control(stream, mode, log).await;
                    let _ = closed_tx.send(());
                });
            }
        });

        Self {
            addr,
            targets,
            sent,
            closed_rx,
        }
    }

    /// 一个没有监听者的地址，连接会被拒绝
    pub async fn refused_endpoint() -> ProxyEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        ProxyEndpoint {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }

    /// 中继收到的数据报目标地址
    pub fn targets(&self) -> Vec<TargetAddr> {
        self.targets.lock().unwrap().clone()
    }

    /// 中继发回客户端的负载，不含SOCKS5头
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// 等待一个控制连接被客户端关闭
    pub async fn wait_closed(&mut self, limit: Duration) -> bool {
        matches!(timeout(limit, self.closed_rx.recv()).await, Ok(Some(())))
    }
}

#[derive(Clone)]
struct RelayLog {
    targets: Arc<Mutex<Vec<TargetAddr>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

async fn serve_control(mut stream: TcpStream, mode: RelayMode, log: RelayLog) {
    let mut greeting = [0u8; 3];
    if stream.read_exact(&mut greeting).await.is_err() {
        return;
    }
    if mode == RelayMode::RequireAuth {
        let _ = stream.write_all(&[SOCKS_VERSION, METHOD_NOT_ACCEPTABLE]).await;
        return;
    }
    if stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await.is_err() {
        return;
    }

    // VER CMD RSV + IPv4全零地址
    let mut request = [0u8; 10];
    if stream.read_exact(&mut request).await.is_err() {
        return;
    }

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut reply = vec![SOCKS_VERSION, 0x00, 0x00];
    TargetAddr::Ip(relay.local_addr().unwrap())
        .write_to(&mut reply)
        .unwrap();
    if stream.write_all(&reply).await.is_err() {
        return;
    }

    let relay_task = tokio::spawn(run_relay(relay, mode, log));

    // 控制连接保持到客户端关闭为止
    let mut sink = [0u8; 64];
    while let Ok(n) = stream.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
    relay_task.abort();
}

async fn run_relay(relay: UdpSocket, mode: RelayMode, log: RelayLog) {
    let mut buffer = vec![0u8; 65_535];
    loop {
        let Ok((len, peer)) = relay.recv_from(&mut buffer).await else {
            return;
        };
        let Ok((target, payload)) = decode_udp_packet(&buffer[..len]) else {
            continue;
        };
        log.targets.lock().unwrap().push(target.clone());

        let responses = match mode {
            RelayMode::Echo => vec![payload.to_vec()],
            RelayMode::Answer => vec![answer(payload)],
            RelayMode::StaleThenAnswer => {
                let mut stale = answer(payload);
                let id = u16::from_be_bytes([stale[0], stale[1]]).wrapping_add(1);
                stale[..2].copy_from_slice(&id.to_be_bytes());
                vec![stale, answer(payload)]
            }
            RelayMode::AnswerPort(port) if target.port() == port => vec![answer(payload)],
            RelayMode::AnswerPort(_) | RelayMode::Silent | RelayMode::RequireAuth => continue,
        };
        for response in responses {
            let packet = encode_udp_packet(&target, &response).unwrap();
            log.sent.lock().unwrap().push(response);
            let _ = relay.send_to(&packet, peer).await;
        }
    }
}

/// 回复一条A记录。答案的owner name不压缩，重新编码会得到不同的字节。
fn answer(query: &[u8]) -> Vec<u8> {
    let mut message = Message::from_vec(query).unwrap();
    let name = message.queries()[0].name().clone();
    message.set_message_type(MessageType::Response);
    message.set_recursion_available(true);

    let mut bytes = message.to_vec().unwrap();
    bytes[6..8].copy_from_slice(&1u16.to_be_bytes()); // ANCOUNT
    bytes.extend_from_slice(&name.to_bytes().unwrap());
    bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
    bytes.extend_from_slice(&300u32.to_be_bytes());
    bytes.extend_from_slice(&4u16.to_be_bytes());
    bytes.extend_from_slice(&ANSWER_ADDR.octets());
    bytes
}
