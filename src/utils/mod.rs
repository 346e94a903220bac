/// 实用工具函数模块
use std::net::{IpAddr, SocketAddr};

/// 解析 `ip:port`、`[v6]:port` 或裸IP，缺少端口时使用 `default_port`
pub fn parse_socket_addr(value: &str, default_port: u16) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let host = value.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|e| format!("无效的地址 {}: {}", value, e))
}

/// 把 `host:port` 拆开，没有端口时返回 None。IPv6 需要带方括号才能带端口。
pub fn split_host_port(value: &str) -> (&str, Option<&str>) {
    if let Some(rest) = value.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':')),
            None => (value, None),
        };
    }
    match value.rsplit_once(':') {
        // 多个冒号说明是不带方括号的IPv6
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (value, None),
    }
}

/// 格式化持续时间
pub fn format_duration(duration: std::time::Duration) -> String {
    let total_secs = duration.as_secs();
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{}ms", millis)
    }
}

/// 从DNS消息中提取查询ID
pub fn extract_query_id(data: &[u8]) -> Option<u16> {
    if data.len() >= 2 {
        Some(u16::from_be_bytes([data[0], data[1]]))
    } else {
        None
    }
}

/// 生成只有头部的DNS错误响应，用于无法解析的查询
pub fn create_dns_error_response(query_id: u16, error_code: u8) -> Vec<u8> {
    let mut response = vec![0u8; 12];

    response[0..2].copy_from_slice(&query_id.to_be_bytes());

    // QR=1(响应), RA=1(递归可用), RCODE=error_code
    let flags = 0x8080 | (error_code as u16 & 0x0F);
    response[2..4].copy_from_slice(&flags.to_be_bytes());

    response
}

/// DNS响应代码常量
pub mod dns_rcode {
    pub const FORMAT_ERROR: u8 = 1;
}
