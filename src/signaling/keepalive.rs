//! Heartbeat task for the signaling session and the latency it measures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::SinkExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{WsWriter, payload};

const RECENT_ACKS: usize = 20;

#[derive(Debug, Default)]
pub struct LatencyStats {
    last_send: Option<Instant>,
    recent: VecDeque<Duration>,
}

impl LatencyStats {
    pub fn record_send(&mut self, at: Instant) {
        self.last_send = Some(at);
    }

    pub fn record_ack(&mut self, at: Instant) {
        let Some(sent) = self.last_send else {
            return;
        };
        self.recent.push_back(at.saturating_duration_since(sent));
        while self.recent.len() > RECENT_ACKS {
            self.recent.pop_front();
        }
    }

    /// Seconds between the last heartbeat and its ack; infinite before the first ack.
    pub fn latency(&self) -> f64 {
        self.recent
            .back()
            .map_or(f64::INFINITY, |d| d.as_secs_f64())
    }

    /// Mean of the last 20 heartbeat latencies in seconds.
    pub fn average_latency(&self) -> f64 {
        if self.recent.is_empty() {
            return f64::INFINITY;
        }
        let total: f64 = self.recent.iter().map(Duration::as_secs_f64).sum();
        total / self.recent.len() as f64
    }
}

pub struct KeepAlive {
    handle: JoinHandle<()>,
}

impl KeepAlive {
    /// Sends a heartbeat every `interval`, first one after a full interval.
    pub fn start(
        writer: Arc<tokio::sync::Mutex<WsWriter>>,
        stats: Arc<Mutex<LatencyStats>>,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                let text = match payload::heartbeat(now_ms) {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode heartbeat: {}", e);
                        break;
                    }
                };

                log::debug!("Keeping voice websocket alive with timestamp {}", now_ms);
                stats
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_send(Instant::now());
                if let Err(e) = writer.lock().await.send(Message::Text(text.into())).await {
                    log::warn!("Heartbeat send failed, stopping keep alive: {}", e);
                    break;
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
