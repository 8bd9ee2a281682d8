//! 发现广播报文
//!
//! 报文是一个 UTF-8 JSON 对象：
//!
//! ```json
//! {"protocolVersion":1,"instanceId":"…","displayName":"…","serviceAddress":"0.0.0.0:8000"}
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// 当前协议版本
pub const PROTOCOL_VERSION: u32 = 1;

/// 接收缓冲区大小，超出的报文被截断后解析失败
pub const MAX_PACKET_SIZE: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("malformed announcement: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid service address {0:?}")]
    InvalidAddress(String),
}

/// 实例广播
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub protocol_version: u32,
    pub instance_id: String,
    pub display_name: String,
    /// 文件服务地址，主机部分为 0.0.0.0 时由接收方替换为报文来源 IP
    pub service_address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionHeader {
    protocol_version: u32,
}

impl Announcement {
    pub fn new(instance_id: &str, display_name: &str, service_address: SocketAddr) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            instance_id: instance_id.to_string(),
            display_name: display_name.to_string(),
            service_address: service_address.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // 纯字符串和整数字段，序列化不会失败
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// 解析报文
    ///
    /// 先只读版本号，未知版本的报文即使字段布局不同也能被识别并忽略。
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let header: VersionHeader = serde_json::from_slice(bytes)?;
        if header.protocol_version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(header.protocol_version));
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// 结合报文来源解析出可连接的服务地址
    pub fn resolve_service_addr(&self, source: SocketAddr) -> Result<SocketAddr, PacketError> {
        let mut addr: SocketAddr = self
            .service_address
            .parse()
            .map_err(|_| PacketError::InvalidAddress(self.service_address.clone()))?;
        if addr.ip().is_unspecified() {
            addr.set_ip(source.ip());
        }
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_camel_case() {
        let a = Announcement::new("abc", "Laptop", "0.0.0.0:8000".parse().unwrap());
        let json = String::from_utf8(a.encode()).unwrap();
        assert_eq!(
            json,
            r#"{"protocolVersion":1,"instanceId":"abc","displayName":"Laptop","serviceAddress":"0.0.0.0:8000"}"#
        );
    }

    #[test]
    fn test_unknown_version_ignored() {
        let raw = br#"{"protocolVersion":2,"id":"other-layout"}"#;
        assert!(matches!(
            Announcement::decode(raw),
            Err(PacketError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(matches!(
            Announcement::decode(b"hello"),
            Err(PacketError::Malformed(_))
        ));
        assert!(matches!(
            Announcement::decode(br#"{"protocolVersion":1}"#),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn test_unspecified_host_replaced_by_source() {
        let a = Announcement::new("abc", "Laptop", "0.0.0.0:8000".parse().unwrap());
        let source: SocketAddr = "192.168.1.42:8001".parse().unwrap();
        assert_eq!(
            a.resolve_service_addr(source).unwrap(),
            "192.168.1.42:8000".parse::<SocketAddr>().unwrap()
        );

        let explicit = Announcement::new("abc", "Laptop", "10.0.0.5:9000".parse().unwrap());
        assert_eq!(
            explicit.resolve_service_addr(source).unwrap(),
            "10.0.0.5:9000".parse::<SocketAddr>().unwrap()
        );
    }
}
