//! Voice signaling payloads and the UDP IP discovery packet.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, VoiceError};

pub mod op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

/// Any message received on the signaling session.
#[derive(Deserialize, Debug)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Serialize)]
struct Outgoing<T> {
    op: u8,
    d: T,
}

#[derive(Serialize, Debug)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Serialize, Debug)]
pub struct SelectProtocol {
    pub protocol: &'static str,
    pub data: SelectProtocolData,
}

#[derive(Serialize, Debug)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Serialize, Debug)]
pub struct Speaking {
    pub speaking: u8,
    pub delay: u32,
}

#[derive(Deserialize, Debug)]
pub struct Hello {
    /// Milliseconds.
    pub heartbeat_interval: f64,
}

#[derive(Deserialize, Debug)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct SessionDescriptionPayload {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

pub fn encode<T: Serialize>(op: u8, d: T) -> Result<String> {
    Ok(serde_json::to_string(&Outgoing { op, d })?)
}

pub fn heartbeat(unix_millis: u64) -> Result<String> {
    encode(op::HEARTBEAT, unix_millis)
}

pub const DISCOVERY_PACKET_LEN: usize = 74;
const DISCOVERY_REQUEST: u16 = 1;
const DISCOVERY_BODY_LEN: u16 = 70;
const DISCOVERY_IP_OFFSET: usize = 8;

/// 74 bytes: BE u16 type, BE u16 length, BE u32 ssrc, zero padding.
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&DISCOVERY_REQUEST.to_be_bytes());
    packet[2..4].copy_from_slice(&DISCOVERY_BODY_LEN.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Our external address as seen by the media relay: NUL-terminated ASCII ip
/// from byte 8, BE u16 port in the last two bytes.
pub fn parse_discovery_response(buf: &[u8]) -> Result<(String, u16)> {
    if buf.len() < DISCOVERY_IP_OFFSET + 2 {
        return Err(VoiceError::Protocol(format!(
            "discovery response too short: {} bytes",
            buf.len()
        )));
    }
    let ip_region = &buf[DISCOVERY_IP_OFFSET..buf.len() - 2];
    let ip_end = ip_region
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| VoiceError::Protocol("discovery response ip is not terminated".into()))?;
    let ip = std::str::from_utf8(&ip_region[..ip_end])
        .map_err(|e| VoiceError::Protocol(e.to_string()))?
        .to_string();
    let port = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
    Ok((ip, port))
}
