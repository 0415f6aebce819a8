//! Payload encryption for outgoing voice packets.
//!
//! Each negotiated mode string maps to one [`EncryptionMode`] through the
//! [`SUPPORTED_MODES`] table; [`Cipher`] dispatches on the mode.
//!
//! ## Wire layout
//! ```text
//! [rtp header(12)] [ciphertext + tag(16)] [nonce counter(4, BE)]
//! ```
//! The cipher nonce is the 4-byte counter followed by zero padding.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use super::checked_add;
use crate::error::{Result, VoiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    AeadXChaCha20Poly1305RtpSize,
}

/// Modes this client can negotiate, in order of preference.
pub const SUPPORTED_MODES: &[(&str, EncryptionMode)] = &[(
    "aead_xchacha20_poly1305_rtpsize",
    EncryptionMode::AeadXChaCha20Poly1305RtpSize,
)];

pub const SECRET_KEY_LEN: usize = 32;

impl EncryptionMode {
    pub fn from_name(name: &str) -> Option<Self> {
        SUPPORTED_MODES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, mode)| *mode)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => "aead_xchacha20_poly1305_rtpsize",
        }
    }

    pub fn nonce_size(&self) -> usize {
        match self {
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => 24,
        }
    }

    /// First mode offered by the server that we also support.
    pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> Option<Self> {
        offered.iter().find_map(|m| Self::from_name(m.as_ref()))
    }
}

/// Big-endian 32-bit nonce counter, wrapping to zero after `u32::MAX`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NonceCounter {
    value: u32,
}

impl NonceCounter {
    pub fn new(start: u32) -> Self {
        Self { value: start }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Returns the 4 wire bytes and the nonce zero-padded to `pad` bytes,
    /// then advances the counter.
    pub fn next(&mut self, pad: usize) -> ([u8; 4], Vec<u8>) {
        let wire = self.value.to_be_bytes();
        let mut padded = vec![0u8; pad.max(wire.len())];
        padded[..wire.len()].copy_from_slice(&wire);

        self.value = checked_add(u64::from(self.value), 1, u64::from(u32::MAX)) as u32;
        (wire, padded)
    }
}

pub enum Cipher {
    XChaCha20(XChaCha20Poly1305),
}

impl Cipher {
    pub fn new(mode: EncryptionMode, secret_key: &[u8]) -> Result<Self> {
        if secret_key.len() != SECRET_KEY_LEN {
            return Err(VoiceError::Crypto(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LEN,
                secret_key.len()
            )));
        }
        match mode {
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => {
                let cipher = XChaCha20Poly1305::new_from_slice(secret_key)
                    .map_err(|e| VoiceError::Crypto(e.to_string()))?;
                Ok(Cipher::XChaCha20(cipher))
            }
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        match self {
            Cipher::XChaCha20(_) => EncryptionMode::AeadXChaCha20Poly1305RtpSize,
        }
    }

    /// Appends `ciphertext || nonce` to `header` using `header` as associated data.
    pub fn seal(&self, header: &[u8], payload: &[u8], nonce: &mut NonceCounter) -> Result<Vec<u8>> {
        let (wire, padded) = nonce.next(self.mode().nonce_size());
        let ciphertext = match self {
            Cipher::XChaCha20(cipher) => cipher
                .encrypt(
                    XNonce::from_slice(&padded),
                    Payload { msg: payload, aad: header },
                )
                .map_err(|e| VoiceError::Crypto(e.to_string()))?,
        };

        let mut packet = Vec::with_capacity(header.len() + ciphertext.len() + wire.len());
        packet.extend_from_slice(header);
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(&wire);
        Ok(packet)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_tuple("Cipher").field(&self.mode().name()).finish()
    }
}
