//! Error types for the voice connection.

use thiserror::Error;

/// Close code sent by a voice server on a clean shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent by the client itself when the voice endpoint changes mid-session.
pub const CLOSE_ENDPOINT_CHANGED: u16 = 4000;
/// The voice channel was deleted or the connection was moved by force.
pub const CLOSE_FORCED_MOVE: u16 = 4014;
/// The voice server crashed.
pub const CLOSE_SERVER_CRASHED: u16 = 4015;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("voice connection closed with code {code}: {reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("not connected to voice")]
    NotConnected,

    #[error("already playing audio")]
    AlreadyPlaying,

    #[error("not playing anything")]
    NotPlaying,

    #[error("gateway request failed: {0}")]
    Gateway(String),

    #[error("encryption failed: {0}")]
    Crypto(String),

    #[error("audio codec error: {0}")]
    Codec(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed voice payload: {0}")]
    Protocol(String),

    #[error("task failure: {0}")]
    Task(String),
}

impl VoiceError {
    /// Transient failures that a reconnect may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoiceError::Timeout(_) | VoiceError::ConnectionClosed { .. })
    }

    /// The close code, if this error is a closed signaling session.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            VoiceError::ConnectionClosed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(e: serde_json::Error) -> Self {
        VoiceError::Protocol(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for VoiceError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        VoiceError::Timeout(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
