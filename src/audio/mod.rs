//! audio - Audio sources, the Opus encoder and the real-time player thread.

pub mod opus_codec;
pub mod player;

use std::collections::VecDeque;
use std::io::Read;

use anyhow::Result;

pub use opus_codec::{FRAME_SIZE, OpusEncoder, SAMPLES_PER_FRAME};
pub use player::{AfterCallback, AudioPlayer, SpeakingHook};

/// A stream of 20 ms audio frames consumed by the player thread.
pub trait AudioSource: Send {
    /// Next frame: `FRAME_SIZE` bytes of s16le stereo PCM, or one Opus
    /// packet if [`is_opus`](AudioSource::is_opus). `None` ends the stream.
    fn read(&mut self) -> Result<Option<Vec<u8>>>;

    fn is_opus(&self) -> bool {
        false
    }

    /// Called once when the player is done with the source.
    fn cleanup(&mut self) {}
}

/// Raw 48 kHz stereo s16le PCM from any reader.
pub struct PcmAudio<R> {
    stream: R,
}

impl<R: Read + Send> PcmAudio<R> {
    pub fn new(stream: R) -> Self {
        Self { stream }
    }
}

impl<R: Read + Send> AudioSource for PcmAudio<R> {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        let mut frame = vec![0u8; FRAME_SIZE];
        let mut filled = 0;
        while filled < FRAME_SIZE {
            match self.stream.read(&mut frame[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // a trailing partial frame is discarded
        if filled == FRAME_SIZE { Ok(Some(frame)) } else { Ok(None) }
    }
}

/// Pre-encoded Opus packets, sent as-is.
pub struct OpusFrames {
    frames: VecDeque<Vec<u8>>,
}

impl OpusFrames {
    pub fn new<I: IntoIterator<Item = Vec<u8>>>(frames: I) -> Self {
        Self { frames: frames.into_iter().collect() }
    }
}

impl AudioSource for OpusFrames {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.frames.pop_front())
    }

    fn is_opus(&self) -> bool {
        true
    }

    fn cleanup(&mut self) {
        self.frames.clear();
    }
}
