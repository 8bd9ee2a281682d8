//! IPC Client - 与守护进程通信

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("lanshare.sock")
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "peers")]
    Peers,
    #[serde(rename = "share")]
    Share { path: String },
    #[serde(rename = "unshare")]
    Unshare { id: String },
    #[serde(rename = "shares")]
    Shares,
    #[serde(rename = "connections")]
    Connections,
    #[serde(rename = "add_peer")]
    AddPeer { address: String },
    #[serde(rename = "remove_peer")]
    RemovePeer { key: String },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status(StatusInfo),
    #[serde(rename = "peers")]
    Peers { peers: Vec<PeerInfo> },
    #[serde(rename = "shares")]
    Shares { files: Vec<ShareInfo> },
    #[serde(rename = "connections")]
    Connections { connections: Vec<ConnectionInfo> },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusInfo {
    pub device_name: String,
    pub instance_id: String,
    pub server_addr: String,
    pub discovery_addr: Option<String>,
    pub shared_files: usize,
    pub shared_size: String,
    pub active_connections: usize,
    pub peers: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub manual: bool,
    pub last_seen: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShareInfo {
    pub id: String,
    pub name: String,
    pub size: String,
    pub folder: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionInfo {
    pub address: String,
    pub first_seen: u64,
    pub last_seen: u64,
    pub requests: usize,
    pub last_action: Option<String>,
}

pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let path = socket_path();

    let stream = match UnixStream::connect(&path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ 无法连接到守护进程: {}", e);
            eprintln!("   请确保 lanshare-daemon 正在运行");
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送请求
    let json = serde_json::to_string(&request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    // 读取响应
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: IpcResponse = serde_json::from_str(&line)?;

    match &response {
        IpcResponse::Ok { message } => println!("✅ {}", message),
        IpcResponse::Error { message } => eprintln!("❌ {}", message),
        _ => {}
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_daemon_responses() {
        let resp: IpcResponse = serde_json::from_str(
            r#"{"type":"peers","peers":[{"id":"manual:10.0.0.2:8000","name":"10.0.0.2:8000","address":"10.0.0.2:8000","manual":true,"last_seen":1700000000}]}"#,
        )
        .unwrap();
        let IpcResponse::Peers { peers } = resp else {
            panic!("expected peers");
        };
        assert!(peers[0].manual);

        let resp: IpcResponse = serde_json::from_str(
            r#"{"type":"status","device_name":"box","instance_id":"x","server_addr":"0.0.0.0:8000","discovery_addr":null,"shared_files":0,"shared_size":"0 B","active_connections":0,"peers":0}"#,
        )
        .unwrap();
        assert!(matches!(resp, IpcResponse::Status(StatusInfo { shared_files: 0, .. })));
    }

    #[test]
    fn test_remove_peer_wire_format() {
        let json = serde_json::to_string(&IpcRequest::RemovePeer {
            key: "manual:10.0.0.2:8000".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"remove_peer","key":"manual:10.0.0.2:8000"}"#);
    }
}
