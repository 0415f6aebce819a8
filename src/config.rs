use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VoiceConfig {
    // 语音信令通道配置
    pub gateway_scheme: String,
    pub gateway_version: u8,
    pub handshake_attempts: u32,
    pub poll_timeout: Duration,
    pub max_heartbeat_interval: Duration,
    pub discovery_timeout: Duration,

    // Opus 编码参数
    pub opus_bitrate: i32,
    pub opus_packet_loss_percent: i32,
    pub opus_fec: bool,
    pub silence_frames: u32,
}

impl VoiceConfig {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            gateway_scheme: env!("VOICE_GATEWAY_SCHEME").to_string(),
            gateway_version: env!("VOICE_GATEWAY_VERSION").parse()
                .map_err(|_| "Failed to parse VOICE_GATEWAY_VERSION")?,
            handshake_attempts: env!("VOICE_HANDSHAKE_ATTEMPTS").parse()
                .map_err(|_| "Failed to parse VOICE_HANDSHAKE_ATTEMPTS")?,
            poll_timeout: Duration::from_secs(
                env!("VOICE_POLL_TIMEOUT_SECS").parse()
                    .map_err(|_| "Failed to parse VOICE_POLL_TIMEOUT_SECS")?,
            ),
            max_heartbeat_interval: Duration::from_millis(
                env!("VOICE_MAX_HEARTBEAT_INTERVAL_MS").parse()
                    .map_err(|_| "Failed to parse VOICE_MAX_HEARTBEAT_INTERVAL_MS")?,
            ),
            discovery_timeout: Duration::from_secs(
                env!("VOICE_DISCOVERY_TIMEOUT_SECS").parse()
                    .map_err(|_| "Failed to parse VOICE_DISCOVERY_TIMEOUT_SECS")?,
            ),

            opus_bitrate: env!("OPUS_BITRATE").parse()
                .map_err(|_| "Failed to parse OPUS_BITRATE")?,
            opus_packet_loss_percent: env!("OPUS_PACKET_LOSS_PERCENT").parse()
                .map_err(|_| "Failed to parse OPUS_PACKET_LOSS_PERCENT")?,
            opus_fec: env!("OPUS_FEC").parse()
                .map_err(|_| "Failed to parse OPUS_FEC")?,
            silence_frames: env!("OPUS_SILENCE_FRAMES").parse()
                .map_err(|_| "Failed to parse OPUS_SILENCE_FRAMES")?,
        })
    }

    /// Base URL of the voice signaling session for `endpoint` (host[:port], no scheme).
    pub fn gateway_url(&self, endpoint: &str) -> String {
        format!("{}://{}/?v={}", self.gateway_scheme, endpoint, self.gateway_version)
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create default VoiceConfig from build-time environment variables")
    }
}
