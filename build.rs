use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    gateway: Gateway,
    opus: Opus,
}

#[derive(Deserialize)]
struct Gateway {
    scheme: String,
    version: u8,
    handshake_attempts: u32,
    poll_timeout_secs: u64,
    max_heartbeat_interval_ms: u64,
    discovery_timeout_secs: u64,
}

#[derive(Deserialize)]
struct Opus {
    bitrate: i32,
    packet_loss_percent: i32,
    fec: bool,
    silence_frames: u32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 语音网关配置
    println!("cargo:rustc-env=VOICE_GATEWAY_SCHEME={}", config.gateway.scheme);
    println!("cargo:rustc-env=VOICE_GATEWAY_VERSION={}", config.gateway.version);
    println!("cargo:rustc-env=VOICE_HANDSHAKE_ATTEMPTS={}", config.gateway.handshake_attempts);
    println!("cargo:rustc-env=VOICE_POLL_TIMEOUT_SECS={}", config.gateway.poll_timeout_secs);
    println!(
        "cargo:rustc-env=VOICE_MAX_HEARTBEAT_INTERVAL_MS={}",
        config.gateway.max_heartbeat_interval_ms
    );
    println!(
        "cargo:rustc-env=VOICE_DISCOVERY_TIMEOUT_SECS={}",
        config.gateway.discovery_timeout_secs
    );

    // Opus 编码配置
    println!("cargo:rustc-env=OPUS_BITRATE={}", config.opus.bitrate);
    println!("cargo:rustc-env=OPUS_PACKET_LOSS_PERCENT={}", config.opus.packet_loss_percent);
    println!("cargo:rustc-env=OPUS_FEC={}", config.opus.fec);
    println!("cargo:rustc-env=OPUS_SILENCE_FRAMES={}", config.opus.silence_frames);
}
