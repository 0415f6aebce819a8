//! Opus encoder for the voice transport.
//!
//! The voice protocol carries 48 kHz stereo Opus in 20 ms frames, so the
//! encoder takes one frame of interleaved little-endian 16-bit PCM
//! (3840 bytes) and returns one Opus packet.

use anyhow::{Result, bail};

pub const SAMPLING_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
pub const FRAME_LENGTH_MS: u32 = 20;
pub const SAMPLE_SIZE: usize = 2 * CHANNELS;
pub const SAMPLES_PER_FRAME: u32 = SAMPLING_RATE / 1000 * FRAME_LENGTH_MS;
pub const FRAME_SIZE: usize = SAMPLES_PER_FRAME as usize * SAMPLE_SIZE;

const MAX_PACKET_SIZE: usize = 4000;

pub struct OpusEncoder {
    encoder: opus::Encoder,
    pcm: Vec<i16>,
}

impl OpusEncoder {
    /// Create a new Opus encoder.
    ///
    /// * `bitrate`             - Bitrate in bits/s (e.g. 128000)
    /// * `fec`                 - Enable in-band forward error correction
    /// * `packet_loss_percent` - Expected packet loss, tunes the FEC overhead
    pub fn new(bitrate: i32, fec: bool, packet_loss_percent: i32) -> Result<Self> {
        let mut encoder =
            opus::Encoder::new(SAMPLING_RATE, opus::Channels::Stereo, opus::Application::Audio)?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate))?;
        encoder.set_inband_fec(fec)?;
        encoder.set_packet_loss_perc(packet_loss_percent.clamp(0, 100))?;

        log::debug!(
            "Opus encoder ready: {}Hz/{}ch, bitrate={}, fec={}, loss={}%",
            SAMPLING_RATE,
            CHANNELS,
            bitrate,
            fec,
            packet_loss_percent
        );

        Ok(Self {
            encoder,
            pcm: Vec::with_capacity(SAMPLES_PER_FRAME as usize * CHANNELS),
        })
    }

    /// Encode one frame of interleaved s16le PCM bytes to an Opus packet.
    ///
    /// Input length must equal `FRAME_SIZE`.
    pub fn encode(&mut self, pcm_bytes: &[u8]) -> Result<Vec<u8>> {
        if pcm_bytes.len() != FRAME_SIZE {
            bail!(
                "expected {} bytes of PCM per frame, got {}",
                FRAME_SIZE,
                pcm_bytes.len()
            );
        }

        self.pcm.clear();
        self.pcm.extend(
            pcm_bytes
                .chunks_exact(2)
                .map(|s| i16::from_le_bytes([s[0], s[1]])),
        );

        let mut opus_buf = vec![0u8; MAX_PACKET_SIZE];
        let encoded_len = self.encoder.encode(&self.pcm, &mut opus_buf)?;
        opus_buf.truncate(encoded_len);
        Ok(opus_buf)
    }
}
