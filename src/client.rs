//! The voice client: handshake, gateway event handling, reconnects and playback.
//!
//! Connect flow:
//! - Ask the main gateway to join the channel.
//! - The gateway forwards a voice state update (session id) and a voice
//!   server update (token, endpoint), in either order.
//! - Once both arrived, open the signaling session and wait for the secret key.
//! - A background task then polls the signaling session and handles closes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::audio::{AfterCallback, AudioPlayer, AudioSource, SpeakingHook};
use crate::backoff::ExponentialBackoff;
use crate::config::VoiceConfig;
use crate::error::{
    CLOSE_ENDPOINT_CHANGED, CLOSE_FORCED_MOVE, CLOSE_NORMAL, CLOSE_SERVER_CRASHED, Result,
    VoiceError,
};
use crate::latch::{Latch, ThreadFlag};
use crate::protocol::{
    ChannelId, ServerId, VoiceGateway, VoiceProtocol, VoiceServerUpdate, VoiceStateUpdate,
};
use crate::signaling::{SessionParams, SignalingSession};
use crate::transport::crypto::Cipher;
use crate::transport::{PacketTransport, TransportSession};

/// Identifies one voice attempt. Filled in as the gateway events arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug)]
struct ClientState {
    info: ConnectionInfo,
    handshaking: bool,
    potentially_reconnecting: bool,
    connections: u32,
    timeout: Duration,
}

pub struct VoiceClient {
    this: Weak<VoiceClient>,
    gateway: Arc<dyn VoiceGateway>,
    config: VoiceConfig,
    state: Mutex<ClientState>,
    state_complete: Latch,
    server_complete: Latch,
    // read by the player thread
    connected: Arc<ThreadFlag>,
    transport: Arc<Mutex<PacketTransport>>,
    ws: Mutex<Option<Arc<SignalingSession>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    player: Mutex<Option<AudioPlayer>>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl VoiceClient {
    pub fn new(
        gateway: Arc<dyn VoiceGateway>,
        server_id: ServerId,
        channel_id: ChannelId,
        config: VoiceConfig,
    ) -> Result<Arc<Self>> {
        if config.handshake_attempts == 0 {
            return Err(VoiceError::Config("handshake_attempts must be at least 1".into()));
        }

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            gateway,
            transport: Arc::new(Mutex::new(PacketTransport::new(&config))),
            config,
            state: Mutex::new(ClientState {
                info: ConnectionInfo {
                    server_id,
                    channel_id,
                    session_id: None,
                    token: None,
                    endpoint: None,
                },
                handshaking: false,
                potentially_reconnecting: false,
                connections: 0,
                timeout: Duration::ZERO,
            }),
            state_complete: Latch::new(),
            server_complete: Latch::new(),
            connected: Arc::new(ThreadFlag::new()),
            ws: Mutex::new(None),
            runner: Mutex::new(None),
            player: Mutex::new(None),
        }))
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.state().info.clone()
    }

    /// Number of handshakes started so far.
    pub fn connection_attempts(&self) -> u32 {
        self.state().connections
    }

    pub fn is_handshaking(&self) -> bool {
        self.state().handshaking
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_set()
    }

    /// Whether the background poll task is alive.
    pub fn is_polling(&self) -> bool {
        lock(&self.runner).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Local address of the UDP socket, if one is open.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        lock(&self.transport).socket()?.local_addr().ok()
    }

    fn current_ws(&self) -> Option<Arc<SignalingSession>> {
        lock(&self.ws).clone()
    }

    async fn voice_connect(&self) -> Result<()> {
        let (server_id, channel_id) = {
            let state = self.state();
            (state.info.server_id, state.info.channel_id)
        };
        self.gateway.change_voice_state(server_id, Some(channel_id)).await
    }

    async fn voice_disconnect(&self) -> Result<()> {
        let (server_id, channel_id) = {
            let state = self.state();
            (state.info.server_id, state.info.channel_id)
        };
        log::info!(
            "The voice handshake is being terminated for Channel ID {} (Server ID {})",
            channel_id,
            server_id
        );
        self.gateway.change_voice_state(server_id, None).await
    }

    fn prepare_handshake(&self) {
        self.state_complete.clear();
        self.server_complete.clear();
        let mut state = self.state();
        state.handshaking = true;
        state.connections += 1;
        log::info!("Starting voice handshake... (connection attempt {})", state.connections);
    }

    fn abandon_handshake(&self) {
        {
            let mut state = self.state();
            state.handshaking = false;
            state.potentially_reconnecting = false;
        }
        self.state_complete.clear();
        self.server_complete.clear();
    }

    fn finish_handshake(&self) {
        {
            let mut state = self.state();
            log::info!("Voice handshake complete. Endpoint found {:?}", state.info.endpoint);
            state.handshaking = false;
        }
        self.server_complete.clear();
        self.state_complete.clear();
    }

    fn session_params(&self) -> Result<SessionParams> {
        let state = self.state();
        let info = &state.info;
        match (&info.session_id, &info.token, &info.endpoint) {
            (Some(session_id), Some(token), Some(endpoint)) => Ok(SessionParams {
                endpoint: endpoint.clone(),
                server_id: info.server_id,
                user_id: self.gateway.user_id(),
                session_id: session_id.clone(),
                token: token.clone(),
            }),
            _ => Err(VoiceError::Protocol(
                "voice handshake finished without session id, token and endpoint".into(),
            )),
        }
    }

    /// Opens the signaling session and waits for the secret key, then hands
    /// the negotiated parameters to the transport.
    async fn connect_websocket(&self) -> Result<Arc<SignalingSession>> {
        let params = self.session_params()?;
        let socket = lock(&self.transport).socket().ok_or(VoiceError::NotConnected)?;

        let ws = SignalingSession::connect(&self.config, &params, socket).await?;
        self.connected.clear();
        while !ws.has_secret_key() {
            ws.poll_event().await?;
        }

        let description = ws
            .description()
            .ok_or_else(|| VoiceError::Protocol("secret key received before READY".into()))?;
        let session = TransportSession {
            ssrc: description.ssrc,
            remote: description.remote,
            cipher: Cipher::new(description.mode, &description.secret_key)?,
        };
        lock(&self.transport).set_session(session);
        self.connected.set();
        Ok(Arc::new(ws))
    }

    fn ensure_runner(&self, reconnect: bool) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut runner = lock(&self.runner);
        if runner.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *runner = Some(tokio::spawn(async move {
            if let Err(e) = this.poll_voice_ws(reconnect).await {
                log::error!("Voice poll task ended with error: {}", e);
            }
            let mut runner = lock(&this.runner);
            if runner.as_ref().map(|h| h.id()) == tokio::task::try_id() {
                runner.take();
            }
        }));
    }

    /// Aborts the poll task unless we are running on it.
    fn abort_runner(&self) {
        let mut runner = lock(&self.runner);
        let on_runner = matches!(
            (runner.as_ref(), tokio::task::try_id()),
            (Some(handle), Some(id)) if handle.id() == id
        );
        if !on_runner {
            if let Some(handle) = runner.take() {
                handle.abort();
            }
        }
    }

    async fn poll_voice_ws(&self, reconnect: bool) -> Result<()> {
        let mut backoff = ExponentialBackoff::default();
        loop {
            let Some(ws) = self.current_ws() else {
                return Ok(());
            };

            let err = match ws.poll_event().await {
                Ok(()) => continue,
                Err(e) if e.is_retryable() => e,
                Err(e) => {
                    log::error!("Unrecoverable voice websocket error: {}", e);
                    self.disconnect(false).await?;
                    return Err(e);
                }
            };

            // the keep alive belongs to the dead session
            ws.stop_keep_alive();

            match err.close_code() {
                Some(code @ (CLOSE_NORMAL | CLOSE_SERVER_CRASHED)) => {
                    log::info!("Disconnecting from voice normally, close code {}.", code);
                    self.disconnect(false).await?;
                    return Ok(());
                }
                Some(CLOSE_FORCED_MOVE) => {
                    log::info!("Disconnected from voice by force... potentially reconnecting.");
                    if !self.potential_reconnect().await {
                        return Ok(());
                    }
                    continue;
                }
                _ => {}
            }

            if !reconnect {
                self.disconnect(false).await?;
                return Err(err);
            }

            let retry = backoff.delay();
            log::error!(
                "Disconnected from voice ({})... Reconnecting in {:.2}s.",
                err,
                retry.as_secs_f64()
            );
            self.connected.clear();
            tokio::time::sleep(retry).await;
            if let Err(e) = self.voice_disconnect().await {
                log::warn!("Failed to leave voice before reconnecting: {}", e);
            }

            let timeout = self.state().timeout;
            match self.connect(timeout, true).await {
                Ok(()) => {}
                Err(VoiceError::Timeout(_)) => {
                    log::warn!("Could not connect to voice... Retrying...");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Used after a forced move: only a new voice server update is awaited,
    /// since the state update may already have arrived. On failure the client
    /// is fully disconnected.
    async fn potential_reconnect(&self) -> bool {
        self.connected.clear();
        self.prepare_handshake();
        let timeout = {
            let mut state = self.state();
            state.potentially_reconnecting = true;
            state.timeout
        };

        let result = if self.server_complete.wait_timeout(timeout).await {
            self.finish_handshake();
            self.state().potentially_reconnecting = false;
            self.connect_websocket().await
        } else {
            Err(VoiceError::Timeout(format!(
                "no voice server update within {:?}",
                timeout
            )))
        };

        match result {
            Ok(ws) => {
                *lock(&self.ws) = Some(ws);
                true
            }
            Err(e) => {
                log::info!("Reconnect was unsuccessful ({}), disconnecting from voice...", e);
                // connected is already clear, so only a forced disconnect cleans up
                if let Err(e) = self.disconnect(true).await {
                    log::warn!("Forced disconnect after failed reconnect errored: {}", e);
                }
                false
            }
        }
    }

    /// Moves to another voice channel of the same server.
    pub async fn move_to(&self, channel_id: ChannelId) -> Result<()> {
        let server_id = self.state().info.server_id;
        self.gateway.change_voice_state(server_id, Some(channel_id)).await
    }

    pub fn latency(&self) -> f64 {
        self.current_ws().map_or(f64::INFINITY, |ws| ws.latency())
    }

    pub fn average_latency(&self) -> f64 {
        self.current_ws().map_or(f64::INFINITY, |ws| ws.average_latency())
    }

    fn speaking_hook(&self) -> Result<SpeakingHook> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| VoiceError::Config("audio playback needs a tokio runtime".into()))?;
        let this = self.this.clone();
        Ok(Arc::new(move |speaking| {
            let Some(ws) = this.upgrade().and_then(|client| client.current_ws()) else {
                return;
            };
            handle.spawn(async move {
                if let Err(e) = ws.speak(speaking).await {
                    log::warn!("Failed to update speaking state: {}", e);
                }
            });
        }))
    }

    /// Plays `source`; `after` is called once the stream ends or fails.
    pub fn play(&self, source: Box<dyn AudioSource>, after: Option<AfterCallback>) -> Result<()> {
        if !self.is_connected() {
            return Err(VoiceError::NotConnected);
        }

        let mut player = lock(&self.player);
        if player.as_ref().is_some_and(|p| p.is_playing()) {
            return Err(VoiceError::AlreadyPlaying);
        }

        *player = Some(AudioPlayer::start(
            source,
            self.transport.clone(),
            self.connected.clone(),
            self.speaking_hook()?,
            self.config.silence_frames,
            after,
        )?);
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.player).as_ref().is_some_and(|p| p.is_playing())
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.player).as_ref().is_some_and(|p| p.is_paused())
    }

    pub fn stop(&self) {
        if let Some(mut player) = lock(&self.player).take() {
            player.stop();
        }
    }

    pub fn pause(&self) {
        if let Some(player) = lock(&self.player).as_ref() {
            player.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(player) = lock(&self.player).as_ref() {
            player.resume();
        }
    }

    /// Replaces the source of the active player.
    pub fn set_source(&self, source: Box<dyn AudioSource>) -> Result<()> {
        match lock(&self.player).as_ref() {
            Some(player) => {
                player.set_source(source);
                Ok(())
            }
            None => Err(VoiceError::NotPlaying),
        }
    }

    /// Sends one frame. `data` is PCM to be Opus encoded when `encode` is
    /// set, an Opus packet otherwise.
    pub fn send_audio_packet(&self, data: &[u8], encode: bool) -> Result<()> {
        lock(&self.transport).send_audio_packet(data, encode)
    }
}

#[async_trait]
impl VoiceProtocol for VoiceClient {
    async fn on_voice_state_update(&self, data: VoiceStateUpdate) -> Result<()> {
        let steady_state = {
            let mut state = self.state();
            state.info.session_id = Some(data.session_id);
            // during a potential reconnect this tells a channel move apart
            // from a real forced disconnect
            !state.handshaking || state.potentially_reconnecting
        };

        if !steady_state {
            self.state_complete.set();
            return Ok(());
        }

        match data.channel_id {
            None => self.disconnect(false).await,
            Some(channel_id) => {
                self.state().info.channel_id = channel_id;
                Ok(())
            }
        }
    }

    async fn on_voice_server_update(&self, data: VoiceServerUpdate) -> Result<()> {
        if self.server_complete.is_set() {
            log::info!("Ignoring extraneous voice server update.");
            return Ok(());
        }

        let endpoint = match data.endpoint {
            Some(endpoint) if !data.token.is_empty() => endpoint,
            _ => {
                log::warn!(
                    "Awaiting endpoint... This requires waiting. \
                     If timeout occurred considering raising the timeout and reconnecting."
                );
                return Ok(());
            }
        };
        let endpoint = endpoint
            .strip_prefix("wss://")
            .map(str::to_string)
            .unwrap_or(endpoint);

        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;

        let handshaking = {
            let mut state = self.state();
            state.info.token = Some(data.token);
            state.info.server_id = data.server_id;
            state.info.endpoint = Some(endpoint);
            state.handshaking
        };

        // hard cutover: the old socket goes once any in-flight send is done
        let old = lock(&self.transport).replace_socket(Some(Arc::new(socket)));
        drop(old);

        if !handshaking {
            // the current signaling session points at the old endpoint
            if let Some(ws) = self.current_ws() {
                ws.close(CLOSE_ENDPOINT_CHANGED).await?;
            }
            return Ok(());
        }

        self.server_complete.set();
        Ok(())
    }

    async fn connect(&self, timeout: Duration, reconnect: bool) -> Result<()> {
        log::info!("Connecting to voice...");
        self.state().timeout = timeout;

        let mut last_error = None;
        for attempt in 0..self.config.handshake_attempts {
            self.prepare_handshake();
            if let Err(e) = self.voice_connect().await {
                self.abandon_handshake();
                return Err(e);
            }

            let both = async {
                tokio::join!(self.state_complete.wait(), self.server_complete.wait());
            };
            if tokio::time::timeout(timeout, both).await.is_err() {
                if let Err(e) = self.disconnect(true).await {
                    log::warn!("Disconnect after handshake timeout failed: {}", e);
                }
                return Err(VoiceError::Timeout(format!(
                    "voice handshake did not complete within {:?}",
                    timeout
                )));
            }

            self.finish_handshake();

            match self.connect_websocket().await {
                Ok(ws) => {
                    *lock(&self.ws) = Some(ws);
                    last_error = None;
                    break;
                }
                Err(e) if e.is_retryable() && reconnect => {
                    log::error!("Failed to connect to voice ({})... Retrying...", e);
                    tokio::time::sleep(Duration::from_secs(1 + u64::from(attempt) * 2)).await;
                    self.voice_disconnect().await?;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }

        self.ensure_runner(reconnect);
        Ok(())
    }

    async fn disconnect(&self, force: bool) -> Result<()> {
        if !force && !self.is_connected() {
            return Ok(());
        }

        self.stop();
        self.connected.clear();
        self.abandon_handshake();
        self.abort_runner();

        let result = async {
            if let Some(ws) = self.current_ws() {
                ws.close_normal().await?;
            }
            self.voice_disconnect().await
        }
        .await;

        // runs on every path
        self.cleanup();
        let old = lock(&self.transport).replace_socket(None);
        drop(old);

        result
    }

    fn cleanup(&self) {
        let server_id = self.state().info.server_id;
        self.gateway.remove_voice_client(server_id);
    }
}
