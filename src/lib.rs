//! Voice connection core for a chat platform's voice protocol.
//!
//! [`VoiceClient`] joins a voice channel through the owning application's
//! [`VoiceGateway`], runs the voice signaling handshake and streams encrypted
//! Opus audio over UDP.

pub mod audio;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod latch;
pub mod protocol;
pub mod signaling;
pub mod tasks;
pub mod transport;

pub use audio::{AudioSource, OpusFrames, PcmAudio};
pub use client::{ConnectionInfo, VoiceClient};
pub use config::VoiceConfig;
pub use error::{Result, VoiceError};
pub use protocol::{VoiceGateway, VoiceProtocol, VoiceServerUpdate, VoiceStateUpdate};
pub use tasks::{Loop, Schedule, SleepHandle};
