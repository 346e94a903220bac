#[cfg(test)]
pub(crate) mod mock;

use crate::utils::split_host_port;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::time::{Duration, timeout};
use tracing::debug;

pub const SOCKS_VERSION: u8 = 0x05;

pub(crate) const METHOD_NO_AUTH: u8 = 0x00;
pub(crate) const METHOD_NOT_ACCEPTABLE: u8 = 0xFF;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const REPLY_SUCCEEDED: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// UDP 数据报的最大长度
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("网络错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("连接代理超时")]
    Timeout,
    #[error("不支持的SOCKS版本: {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("代理不接受无认证方式")]
    NoAcceptableMethod,
    #[error("代理拒绝请求: {}", reply_message(*.0))]
    Rejected(u8),
    #[error("未知的地址类型: {0:#04x}")]
    AddressType(u8),
    #[error("域名过长: {0} bytes")]
    DomainTooLong(usize),
    #[error("UDP数据报格式错误: {0}")]
    MalformedPacket(&'static str),
    #[error("不支持分片的UDP数据报: frag={0}")]
    Fragmented(u8),
    #[error("无法解析地址: {0}")]
    Resolve(String),
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// SOCKS5 目标地址 (ATYP + DST.ADDR + DST.PORT)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// 由主机名和端口构造，IP字面量优先
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    /// 解析 `host`、`host:port` 或 `[v6]:port`，没有端口时使用 `default_port`
    pub fn parse(value: &str, default_port: u16) -> Result<Self, String> {
        let (host, port) = split_host_port(value);
        if host.is_empty() {
            return Err("主机为空".to_string());
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|e| format!("无效的端口 {}: {}", port, e))?,
            None => default_port,
        };
        Ok(Self::from_host(host, port))
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), Socks5Error> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(host, _) => {
                if host.len() > u8::MAX as usize {
                    return Err(Socks5Error::DomainTooLong(host.len()));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(host.len() as u8);
                buf.extend_from_slice(host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }

    /// 从缓冲区解析地址，返回地址和消耗的字节数
    pub fn read_from(buf: &[u8]) -> Result<(Self, usize), Socks5Error> {
        let atyp = *buf
            .first()
            .ok_or(Socks5Error::MalformedPacket("缺少地址类型"))?;
        let (addr_len, offset) = match atyp {
            ATYP_IPV4 => (4, 1),
            ATYP_IPV6 => (16, 1),
            ATYP_DOMAIN => {
                let len = *buf
                    .get(1)
                    .ok_or(Socks5Error::MalformedPacket("缺少域名长度"))?;
                (len as usize, 2)
            }
            other => return Err(Socks5Error::AddressType(other)),
        };

        let end = offset + addr_len + 2;
        if buf.len() < end {
            return Err(Socks5Error::MalformedPacket("地址被截断"));
        }
        let raw = &buf[offset..offset + addr_len];
        let port = u16::from_be_bytes([buf[end - 2], buf[end - 1]]);

        let addr = match atyp {
            ATYP_IPV4 => {
                let octets: [u8; 4] = raw.try_into().map_err(|_| Socks5Error::MalformedPacket("IPv4地址"))?;
                TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
            }
            ATYP_IPV6 => {
                let octets: [u8; 16] = raw.try_into().map_err(|_| Socks5Error::MalformedPacket("IPv6地址"))?;
                TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
            }
            _ => {
                let host = std::str::from_utf8(raw)
                    .map_err(|_| Socks5Error::MalformedPacket("域名不是UTF-8"))?;
                TargetAddr::Domain(host.to_string(), port)
            }
        };
        Ok((addr, end))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// 代理服务器地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// 解析 `host`、`host:port` 或 `[v6]:port`，没有端口时使用 `default_port`
    pub fn parse(value: &str, default_port: u16) -> Result<Self, String> {
        let (host, port) = split_host_port(value);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err("主机为空".to_string());
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|e| format!("无效的端口 {}: {}", port, e))?,
            None => default_port,
        };
        if port == 0 {
            return Err("端口不能为0".to_string());
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 封装一个SOCKS5 UDP请求头 + 负载
pub fn encode_udp_packet(target: &TargetAddr, payload: &[u8]) -> Result<Vec<u8>, Socks5Error> {
    let mut packet = Vec::with_capacity(payload.len() + 22);
    packet.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV RSV FRAG
    target.write_to(&mut packet)?;
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// 解析SOCKS5 UDP数据报，返回来源地址和负载
pub fn decode_udp_packet(packet: &[u8]) -> Result<(TargetAddr, &[u8]), Socks5Error> {
    if packet.len() < 4 {
        return Err(Socks5Error::MalformedPacket("数据报过短"));
    }
    if packet[0] != 0 || packet[1] != 0 {
        return Err(Socks5Error::MalformedPacket("保留字段非零"));
    }
    if packet[2] != 0 {
        return Err(Socks5Error::Fragmented(packet[2]));
    }
    let (addr, used) = TargetAddr::read_from(&packet[3..])?;
    Ok((addr, &packet[3 + used..]))
}

/// SOCKS5 UDP关联。控制连接关闭时代理会释放中继端口。
#[derive(Debug)]
pub struct UdpAssociation {
    control: TcpStream,
    relay: SocketAddr,
}

impl UdpAssociation {
    /// 连接代理并完成 UDP ASSOCIATE 握手，整个过程受 `dial_timeout` 约束
    pub async fn establish(proxy: &ProxyEndpoint, dial_timeout: Duration) -> Result<Self, Socks5Error> {
        timeout(dial_timeout, Self::handshake(proxy))
            .await
            .map_err(|_| Socks5Error::Timeout)?
    }

    async fn handshake(proxy: &ProxyEndpoint) -> Result<Self, Socks5Error> {
        let mut control = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

        // 只提供无认证方式
        control
            .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
            .await?;

        let mut choice = [0u8; 2];
        control.read_exact(&mut choice).await?;
        if choice[0] != SOCKS_VERSION {
            return Err(Socks5Error::UnsupportedVersion(choice[0]));
        }
        if choice[1] != METHOD_NO_AUTH {
            return Err(Socks5Error::NoAcceptableMethod);
        }

        // 客户端的UDP源地址此时未知，按RFC 1928填全零
        let mut request = vec![SOCKS_VERSION, CMD_UDP_ASSOCIATE, 0x00];
        TargetAddr::Ip(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).write_to(&mut request)?;
        control.write_all(&request).await?;

        let bound = read_reply(&mut control).await?;
        let relay = match bound {
            TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
                SocketAddr::new(control.peer_addr()?.ip(), addr.port())
            }
            TargetAddr::Ip(addr) => addr,
            TargetAddr::Domain(host, port) => lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| Socks5Error::Resolve(format!("{}:{}", host, port)))?,
        };

        debug!(proxy = %proxy, relay = %relay, "SOCKS5 UDP关联已建立");
        Ok(Self { control, relay })
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    /// 通过中继打开到目标的数据报连接，关联的所有权转移给返回的连接
    pub async fn dial(self, target: TargetAddr) -> Result<TunneledConn, Socks5Error> {
        let local = if self.relay.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.relay).await?;

        Ok(TunneledConn {
            socket,
            target,
            _control: self.control,
        })
    }
}

async fn read_reply(control: &mut TcpStream) -> Result<TargetAddr, Socks5Error> {
    let mut header = [0u8; 4];
    control.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(Socks5Error::Rejected(header[1]));
    }

    let mut raw = vec![header[3]];
    match header[3] {
        ATYP_IPV4 => raw.resize(1 + 4 + 2, 0),
        ATYP_IPV6 => raw.resize(1 + 16 + 2, 0),
        ATYP_DOMAIN => {
            let len = control.read_u8().await?;
            raw.push(len);
            raw.resize(2 + len as usize + 2, 0);
        }
        other => return Err(Socks5Error::AddressType(other)),
    }
    let start = if header[3] == ATYP_DOMAIN { 2 } else { 1 };
    control.read_exact(&mut raw[start..]).await?;

    let (addr, _) = TargetAddr::read_from(&raw)?;
    Ok(addr)
}

/// 经代理中继的数据报连接。Drop 时同时关闭UDP套接字和控制连接。
#[derive(Debug)]
pub struct TunneledConn {
    socket: UdpSocket,
    target: TargetAddr,
    _control: TcpStream,
}

impl TunneledConn {
    pub async fn send(&self, payload: &[u8]) -> Result<(), Socks5Error> {
        let packet = encode_udp_packet(&self.target, payload)?;
        self.socket.send(&packet).await?;
        Ok(())
    }

    /// 接收一个数据报并去掉SOCKS5 UDP头
    pub async fn recv(&self) -> Result<Vec<u8>, Socks5Error> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let len = self.socket.recv(&mut buffer).await?;
        let (_, payload) = decode_udp_packet(&buffer[..len])?;
        Ok(payload.to_vec())
    }
}
