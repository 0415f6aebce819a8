//! The audio player pumps an [`AudioSource`] into the transport.
//!
//! Uses std::thread (NOT tokio tasks) so frame pacing is not subject to
//! scheduling jitter from the async side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::AudioSource;
use super::opus_codec::FRAME_LENGTH_MS;
use crate::error::{Result, VoiceError};
use crate::latch::ThreadFlag;
use crate::transport::{OPUS_SILENCE, PacketTransport};

/// Called once when the stream ends, with the error that stopped it, if any.
pub type AfterCallback = Box<dyn FnOnce(Option<VoiceError>) + Send>;

/// Reports speaking state changes to the signaling session.
pub type SpeakingHook = Arc<dyn Fn(bool) + Send + Sync>;

const DELAY: Duration = Duration::from_millis(FRAME_LENGTH_MS as u64);
/// Upper bound on how long a blocked player goes without checking for stop.
const WAIT_SLICE: Duration = Duration::from_millis(100);

struct PlayerShared {
    source: Mutex<Box<dyn AudioSource>>,
    end: AtomicBool,
    resumed: ThreadFlag,
    connected: Arc<ThreadFlag>,
    speaking: SpeakingHook,
}

pub struct AudioPlayer {
    shared: Arc<PlayerShared>,
    handle: Option<JoinHandle<()>>,
}

impl AudioPlayer {
    /// Start pumping `source` on a dedicated thread.
    ///
    /// * `transport`      - Shared packet transport
    /// * `connected`      - Set while the voice connection is usable
    /// * `speaking`       - Speaking state notifier
    /// * `silence_frames` - Opus silence frames sent after the stream ends
    pub fn start(
        source: Box<dyn AudioSource>,
        transport: Arc<Mutex<PacketTransport>>,
        connected: Arc<ThreadFlag>,
        speaking: SpeakingHook,
        silence_frames: u32,
        after: Option<AfterCallback>,
    ) -> Result<Self> {
        let shared = Arc::new(PlayerShared {
            source: Mutex::new(source),
            end: AtomicBool::new(false),
            resumed: ThreadFlag::new(),
            connected,
            speaking,
        });
        shared.resumed.set();

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("voice-player".into())
                .spawn(move || {
                    let result = run(&shared, &transport, silence_frames);
                    shared.end.store(true, Ordering::SeqCst);
                    lock(&shared.source).cleanup();

                    let error = result.err();
                    match after {
                        Some(after) => after(error),
                        None => {
                            if let Some(e) = error {
                                log::error!("Audio player stopped with error: {}", e);
                            }
                        }
                    }
                })?
        };

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Signal the thread to stop. The thread is detached, not joined, so
    /// this never blocks the caller.
    pub fn stop(&mut self) {
        self.shared.end.store(true, Ordering::SeqCst);
        self.shared.resumed.set();
        self.handle.take();
    }

    pub fn pause(&self) {
        self.shared.resumed.clear();
        (self.shared.speaking)(false);
    }

    pub fn resume(&self) {
        self.shared.resumed.set();
        (self.shared.speaking)(true);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.resumed.is_set() && !self.is_done()
    }

    pub fn is_paused(&self) -> bool {
        !self.is_done() && !self.shared.resumed.is_set()
    }

    pub fn is_done(&self) -> bool {
        self.shared.end.load(Ordering::SeqCst)
    }

    /// Swap the source being played without restarting the thread.
    pub fn set_source(&self, source: Box<dyn AudioSource>) {
        let mut current = lock(&self.shared.source);
        *current = source;
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn run(
    shared: &PlayerShared,
    transport: &Mutex<PacketTransport>,
    silence_frames: u32,
) -> Result<()> {
    let mut loops: u32 = 0;
    let mut start = Instant::now();

    (shared.speaking)(true);
    log::debug!("Audio player started");

    while !shared.end.load(Ordering::SeqCst) {
        if !shared.resumed.is_set() {
            if shared.resumed.wait_timeout(WAIT_SLICE) {
                loops = 0;
                start = Instant::now();
            }
            continue;
        }

        // 未连接时不发送任何音频
        if !shared.connected.is_set() {
            if shared.connected.wait_timeout(WAIT_SLICE) {
                loops = 0;
                start = Instant::now();
            }
            continue;
        }

        loops += 1;
        let (frame, is_opus) = {
            let mut source = lock(&shared.source);
            (source.read()?, source.is_opus())
        };
        let Some(frame) = frame else {
            break;
        };

        match lock(transport).send_audio_packet(&frame, !is_opus) {
            Ok(()) => {}
            Err(VoiceError::NotConnected) => {
                log::debug!("Transport not ready, dropping frame {}", loops);
            }
            Err(e) => return Err(e),
        }

        let next_time = start + DELAY * (loops + 1);
        thread::sleep(next_time.saturating_duration_since(Instant::now()));
    }

    if shared.connected.is_set() {
        for _ in 0..silence_frames {
            if let Err(e) = lock(transport).send_audio_packet(&OPUS_SILENCE, false) {
                log::debug!("Failed to send silence frame: {}", e);
                break;
            }
        }
    }

    (shared.speaking)(false);
    log::debug!("Audio player finished after {} frames", loops);
    Ok(())
}
