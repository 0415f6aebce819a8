//! RTP packetization and UDP transmission of voice frames.
//!
//! The transport exclusively owns the sequence, timestamp and nonce counters.
//! Callers share it behind a `Mutex`; the player thread and direct
//! `send_audio_packet` calls both go through it.

pub mod crypto;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::audio::opus_codec::{OpusEncoder, SAMPLES_PER_FRAME};
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use crypto::{Cipher, NonceCounter};

pub const RTP_HEADER_LEN: usize = 12;
/// Version 2, no padding, no extension, no CSRCs.
pub const RTP_VERSION: u8 = 0x80;
/// Dynamic payload type 120 carries Opus.
pub const RTP_PAYLOAD_TYPE_OPUS: u8 = 0x78;

/// Three-byte Opus silence frame sent after a stream ends.
pub const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// `current + delta`, or 0 if that would exceed `limit`.
pub fn checked_add(current: u64, delta: u64, limit: u64) -> u64 {
    let next = current.saturating_add(delta);
    if next > limit { 0 } else { next }
}

pub fn rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = RTP_VERSION;
    header[1] = RTP_PAYLOAD_TYPE_OPUS;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Negotiated parameters of one signaling session.
#[derive(Debug)]
pub struct TransportSession {
    pub ssrc: u32,
    pub remote: SocketAddr,
    pub cipher: Cipher,
}

pub struct PacketTransport {
    socket: Option<Arc<UdpSocket>>,
    session: Option<TransportSession>,
    sequence: u16,
    timestamp: u32,
    nonce: NonceCounter,
    encoder: Option<OpusEncoder>,
    opus_bitrate: i32,
    opus_fec: bool,
    opus_packet_loss_percent: i32,
}

impl PacketTransport {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            socket: None,
            session: None,
            sequence: 0,
            timestamp: 0,
            nonce: NonceCounter::default(),
            encoder: None,
            opus_bitrate: config.opus_bitrate,
            opus_fec: config.opus_fec,
            opus_packet_loss_percent: config.opus_packet_loss_percent,
        }
    }

    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.clone()
    }

    /// Swaps in a new socket and forgets the media relay address. The caller
    /// holds the transport lock, so a send in progress on the old socket has
    /// already completed; the old socket is returned to be dropped.
    pub fn replace_socket(&mut self, socket: Option<Arc<UdpSocket>>) -> Option<Arc<UdpSocket>> {
        self.session = None;
        std::mem::replace(&mut self.socket, socket)
    }

    pub fn set_session(&mut self, session: TransportSession) {
        log::debug!(
            "Transport ready: ssrc={}, remote={}, mode={}",
            session.ssrc,
            session.remote,
            session.cipher.mode().name()
        );
        self.session = Some(session);
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn nonce(&self) -> u32 {
        self.nonce.value()
    }

    /// Builds the encrypted packet for `payload` at the current counters.
    pub fn build_packet(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.seal_packet(self.sequence, payload)
    }

    fn seal_packet(&mut self, sequence: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let session = self.session.as_ref().ok_or(VoiceError::NotConnected)?;
        let header = rtp_header(sequence, self.timestamp, session.ssrc);
        session.cipher.seal(&header, payload, &mut self.nonce)
    }

    /// Sends one frame. `data` is PCM when `encode` is set, Opus otherwise.
    ///
    /// The counters only move once a packet is built. A packet the socket
    /// refuses is logged and dropped; the timestamp still advances so pacing
    /// is preserved.
    pub fn send_audio_packet(&mut self, data: &[u8], encode: bool) -> Result<()> {
        if self.socket.is_none() || self.session.is_none() {
            return Err(VoiceError::NotConnected);
        }

        let encoded;
        let payload = if encode {
            encoded = self.encoder()?.encode(data)?;
            &encoded[..]
        } else {
            data
        };

        let sequence = checked_add(self.sequence.into(), 1, u16::MAX.into()) as u16;
        let packet = self.seal_packet(sequence, payload)?;
        self.sequence = sequence;

        let (socket, remote) = match (&self.socket, &self.session) {
            (Some(socket), Some(session)) => (socket, session.remote),
            _ => return Err(VoiceError::NotConnected),
        };
        if let Err(e) = socket.try_send_to(&packet, remote) {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                log::warn!(
                    "A packet has been dropped (seq: {}, timestamp: {})",
                    self.sequence,
                    self.timestamp
                );
            } else {
                log::warn!(
                    "Failed to send packet (seq: {}, timestamp: {}): {}",
                    self.sequence,
                    self.timestamp,
                    e
                );
            }
        }

        self.timestamp =
            checked_add(self.timestamp.into(), SAMPLES_PER_FRAME.into(), u32::MAX.into()) as u32;
        Ok(())
    }

    fn encoder(&mut self) -> Result<&mut OpusEncoder> {
        if self.encoder.is_none() {
            self.encoder = Some(OpusEncoder::new(
                self.opus_bitrate,
                self.opus_fec,
                self.opus_packet_loss_percent,
            )?);
        }
        self.encoder
            .as_mut()
            .ok_or_else(|| VoiceError::Config("opus encoder unavailable".into()))
    }
}
