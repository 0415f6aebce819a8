//! The voice signaling session.
//!
//! - Open the websocket at the voice endpoint and send IDENTIFY.
//! - HELLO starts the heartbeat.
//! - READY carries ssrc, media relay address and modes; we run UDP IP
//!   discovery against the relay and answer with SELECT_PROTOCOL.
//! - SESSION_DESCRIPTION carries the secret key; the session is then usable.

pub mod keepalive;
pub mod payload;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::VoiceConfig;
use crate::error::{CLOSE_NORMAL, Result, VoiceError};
use crate::protocol::{ServerId, UserId};
use crate::transport::crypto::EncryptionMode;
use keepalive::{KeepAlive, LatencyStats};
use payload::{
    GatewayMessage, Hello, Identify, Ready, SelectProtocol, SelectProtocolData,
    SessionDescriptionPayload, Speaking, op,
};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Close code reported when the stream ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// What the session needs from the voice handshake.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub endpoint: String,
    pub server_id: ServerId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
}

/// Everything negotiated by one signaling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub ssrc: u32,
    pub remote: SocketAddr,
    pub local_ip: String,
    pub local_port: u16,
    pub mode: EncryptionMode,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Default)]
struct Negotiation {
    ssrc: u32,
    remote: Option<SocketAddr>,
    local: Option<(String, u16)>,
    mode: Option<EncryptionMode>,
    secret_key: Option<Vec<u8>>,
}

pub struct SignalingSession {
    reader: tokio::sync::Mutex<WsReader>,
    writer: Arc<tokio::sync::Mutex<WsWriter>>,
    keep_alive: Mutex<Option<KeepAlive>>,
    latency: Arc<Mutex<LatencyStats>>,
    close_code: Mutex<Option<u16>>,
    negotiation: Mutex<Negotiation>,
    socket: Arc<UdpSocket>,
    poll_timeout: Duration,
    max_heartbeat_interval: Duration,
    discovery_timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SignalingSession {
    /// Connects to `params.endpoint` and identifies. `socket` is the UDP
    /// socket used for IP discovery once READY arrives.
    pub async fn connect(
        config: &VoiceConfig,
        params: &SessionParams,
        socket: Arc<UdpSocket>,
    ) -> Result<Self> {
        let url = Url::parse(&config.gateway_url(&params.endpoint))
            .map_err(|e| VoiceError::Config(format!("bad voice endpoint {:?}: {}", params.endpoint, e)))?;

        log::info!("Connecting to voice websocket {}", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (write, read) = ws_stream.split();

        let session = Self {
            reader: tokio::sync::Mutex::new(read),
            writer: Arc::new(tokio::sync::Mutex::new(write)),
            keep_alive: Mutex::new(None),
            latency: Arc::new(Mutex::new(LatencyStats::default())),
            close_code: Mutex::new(None),
            negotiation: Mutex::new(Negotiation::default()),
            socket,
            poll_timeout: config.poll_timeout,
            max_heartbeat_interval: config.max_heartbeat_interval,
            discovery_timeout: config.discovery_timeout,
        };
        session.identify(params).await?;
        Ok(session)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.writer.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn identify(&self, params: &SessionParams) -> Result<()> {
        let text = payload::encode(
            op::IDENTIFY,
            Identify {
                server_id: params.server_id.to_string(),
                user_id: params.user_id.to_string(),
                session_id: params.session_id.clone(),
                token: params.token.clone(),
            },
        )?;
        self.send_text(text).await
    }

    async fn select_protocol(&self, ip: &str, port: u16, mode: EncryptionMode) -> Result<()> {
        let text = payload::encode(
            op::SELECT_PROTOCOL,
            SelectProtocol {
                protocol: "udp",
                data: SelectProtocolData {
                    address: ip.to_string(),
                    port,
                    mode: mode.name().to_string(),
                },
            },
        )?;
        self.send_text(text).await
    }

    pub async fn speak(&self, speaking: bool) -> Result<()> {
        let text = payload::encode(
            op::SPEAKING,
            Speaking {
                speaking: u8::from(speaking),
                delay: 0,
            },
        )?;
        self.send_text(text).await
    }

    /// Waits for one message and handles it. A close or a silent
    /// `poll_timeout` ends the session.
    pub async fn poll_event(&self) -> Result<()> {
        let next = {
            let mut reader = self.reader.lock().await;
            tokio::time::timeout(self.poll_timeout, reader.next()).await
        };

        match next {
            Err(_) => Err(VoiceError::Timeout(format!(
                "no voice websocket message within {:?}",
                self.poll_timeout
            ))),
            Ok(Some(Ok(Message::Text(text)))) => self.received_message(text.as_str()).await,
            Ok(Some(Ok(Message::Close(frame)))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                };
                Err(self.closed(code, reason))
            }
            Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(e))) => Err(self.closed(None, e.to_string())),
            Ok(None) => Err(self.closed(None, "stream ended".into())),
        }
    }

    /// Our own close code wins over whatever the server reports.
    fn closed(&self, code: Option<u16>, reason: String) -> VoiceError {
        let code = lock(&self.close_code).or(code).unwrap_or(CLOSE_ABNORMAL);
        VoiceError::ConnectionClosed { code, reason }
    }

    async fn received_message(&self, text: &str) -> Result<()> {
        log::debug!("Voice websocket frame received: {}", text);
        let msg: GatewayMessage = serde_json::from_str(text)?;

        match msg.op {
            op::READY => {
                let ready: Ready = serde_json::from_value(msg.d)?;
                self.initial_connection(ready).await?;
            }
            op::HEARTBEAT_ACK => {
                lock(&self.latency).record_ack(Instant::now());
            }
            op::RESUMED => {
                log::info!("Voice RESUME succeeded.");
            }
            op::SESSION_DESCRIPTION => {
                let description: SessionDescriptionPayload = serde_json::from_value(msg.d)?;
                self.load_secret_key(description).await?;
            }
            op::HELLO => {
                let hello: Hello = serde_json::from_value(msg.d)?;
                let interval = Duration::from_secs_f64(hello.heartbeat_interval.max(0.0) / 1000.0)
                    .min(self.max_heartbeat_interval);
                let keep_alive =
                    KeepAlive::start(self.writer.clone(), self.latency.clone(), interval);
                if let Some(old) = lock(&self.keep_alive).replace(keep_alive) {
                    old.stop();
                }
            }
            op::CLIENT_DISCONNECT => {
                log::debug!("Voice client disconnect: {}", msg.d);
            }
            other => {
                log::debug!("Unhandled voice op {}", other);
            }
        }
        Ok(())
    }

    async fn initial_connection(&self, ready: Ready) -> Result<()> {
        let remote = tokio::net::lookup_host((ready.ip.as_str(), ready.port))
            .await?
            .next()
            .ok_or_else(|| VoiceError::Protocol(format!("cannot resolve voice relay {}", ready.ip)))?;
        {
            let mut negotiation = lock(&self.negotiation);
            negotiation.ssrc = ready.ssrc;
            negotiation.remote = Some(remote);
        }

        let (ip, port) = self.discover_ip(ready.ssrc, remote).await?;
        log::info!("Detected external address {}:{}", ip, port);

        let mode = EncryptionMode::negotiate(&ready.modes).ok_or_else(|| {
            VoiceError::Config(format!("no supported encryption mode in {:?}", ready.modes))
        })?;
        log::debug!("Received supported encryption modes: {:?}, using {}", ready.modes, mode.name());

        lock(&self.negotiation).local = Some((ip.clone(), port));
        self.select_protocol(&ip, port, mode).await
    }

    async fn discover_ip(&self, ssrc: u32, remote: SocketAddr) -> Result<(String, u16)> {
        let packet = payload::discovery_request(ssrc);
        self.socket.send_to(&packet, remote).await?;

        let mut buf = [0u8; payload::DISCOVERY_PACKET_LEN];
        let (len, _) = tokio::time::timeout(self.discovery_timeout, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| VoiceError::Timeout("udp ip discovery".into()))??;
        payload::parse_discovery_response(&buf[..len])
    }

    async fn load_secret_key(&self, description: SessionDescriptionPayload) -> Result<()> {
        let mode = EncryptionMode::from_name(&description.mode).ok_or_else(|| {
            VoiceError::Config(format!("server selected unsupported mode {}", description.mode))
        })?;
        log::info!("Received secret key for voice connection");
        {
            let mut negotiation = lock(&self.negotiation);
            negotiation.mode = Some(mode);
            negotiation.secret_key = Some(description.secret_key);
        }
        self.speak(false).await
    }

    pub fn has_secret_key(&self) -> bool {
        lock(&self.negotiation).secret_key.is_some()
    }

    /// Available once SESSION_DESCRIPTION has been received.
    pub fn description(&self) -> Option<SessionDescription> {
        let negotiation = lock(&self.negotiation);
        let (local_ip, local_port) = negotiation.local.clone()?;
        Some(SessionDescription {
            ssrc: negotiation.ssrc,
            remote: negotiation.remote?,
            local_ip,
            local_port,
            mode: negotiation.mode?,
            secret_key: negotiation.secret_key.clone()?,
        })
    }

    pub fn stop_keep_alive(&self) {
        if let Some(keep_alive) = lock(&self.keep_alive).take() {
            keep_alive.stop();
        }
    }

    /// Stops the heartbeat and sends a close frame with `code`. Closing an
    /// already closed session is not an error.
    pub async fn close(&self, code: u16) -> Result<()> {
        self.stop_keep_alive();
        *lock(&self.close_code) = Some(code);

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = self.writer.lock().await.send(Message::Close(Some(frame))).await {
            log::debug!("Voice websocket already closed: {}", e);
        }
        Ok(())
    }

    pub async fn close_normal(&self) -> Result<()> {
        self.close(CLOSE_NORMAL).await
    }

    pub fn latency(&self) -> f64 {
        lock(&self.latency).latency()
    }

    pub fn average_latency(&self) -> f64 {
        lock(&self.latency).average_latency()
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}
