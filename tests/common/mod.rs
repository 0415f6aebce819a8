#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{WebSocketStream, accept_async};

use voice_link_rs::protocol::{ChannelId, ServerId, UserId};
use voice_link_rs::{
    VoiceClient, VoiceConfig, VoiceError, VoiceGateway, VoiceProtocol, VoiceServerUpdate,
    VoiceStateUpdate,
};

pub const SERVER_ID: ServerId = 41771983423143937;
pub const CHANNEL_ID: ChannelId = 127121515262115840;
pub const OTHER_CHANNEL_ID: ChannelId = 127121515262115841;
pub const USER_ID: UserId = 80351110224678912;
pub const SSRC: u32 = 4242;
pub const SECRET_KEY: [u8; 32] = [7; 32];
pub const MODE: &str = "aead_xchacha20_poly1305_rtpsize";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> VoiceConfig {
    VoiceConfig {
        gateway_scheme: "ws".into(),
        ..VoiceConfig::default()
    }
}

pub fn state_update(channel_id: Option<ChannelId>) -> VoiceStateUpdate {
    VoiceStateUpdate {
        session_id: "f8a7e3c1d2b4".into(),
        channel_id,
    }
}

pub fn server_update(token: &str, endpoint: Option<&str>) -> VoiceServerUpdate {
    VoiceServerUpdate {
        token: token.into(),
        server_id: SERVER_ID,
        endpoint: endpoint.map(str::to_string),
    }
}

/// Stands in for the main gateway connection and its voice client registry.
pub struct MockGateway {
    client: Mutex<Weak<VoiceClient>>,
    /// When set, joining a channel is answered with both voice events
    /// pointing at this endpoint.
    respond_with: Option<String>,
    refuse_joins: AtomicBool,
    voice_states: Mutex<Vec<Option<ChannelId>>>,
    registry: Mutex<HashSet<ServerId>>,
}

impl MockGateway {
    pub fn new(respond_with: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            client: Mutex::new(Weak::new()),
            respond_with,
            refuse_joins: AtomicBool::new(false),
            voice_states: Mutex::new(Vec::new()),
            registry: Mutex::new(HashSet::new()),
        })
    }

    pub fn client(self: &Arc<Self>) -> Arc<VoiceClient> {
        self.client_with(test_config())
    }

    pub fn client_with(self: &Arc<Self>, config: VoiceConfig) -> Arc<VoiceClient> {
        let client =
            VoiceClient::new(self.clone(), SERVER_ID, CHANNEL_ID, config).expect("valid config");
        *self.client.lock().unwrap() = Arc::downgrade(&client);
        self.registry.lock().unwrap().insert(SERVER_ID);
        client
    }

    /// Makes every join request fail at the gateway.
    pub fn refuse_joins(&self, refuse: bool) {
        self.refuse_joins.store(refuse, Ordering::SeqCst);
    }

    pub fn voice_states(&self) -> Vec<Option<ChannelId>> {
        self.voice_states.lock().unwrap().clone()
    }

    pub fn is_registered(&self, server_id: ServerId) -> bool {
        self.registry.lock().unwrap().contains(&server_id)
    }
}

#[async_trait]
impl VoiceGateway for MockGateway {
    fn user_id(&self) -> UserId {
        USER_ID
    }

    async fn change_voice_state(
        &self,
        _server_id: ServerId,
        channel_id: Option<ChannelId>,
    ) -> voice_link_rs::Result<()> {
        if channel_id.is_some() && self.refuse_joins.load(Ordering::SeqCst) {
            return Err(VoiceError::Gateway("gateway connection is closed".into()));
        }
        self.voice_states.lock().unwrap().push(channel_id);

        let (Some(channel_id), Some(endpoint)) = (channel_id, self.respond_with.clone()) else {
            return Ok(());
        };
        let Some(client) = self.client.lock().unwrap().upgrade() else {
            return Ok(());
        };
        tokio::spawn(async move {
            client
                .on_voice_state_update(state_update(Some(channel_id)))
                .await
                .unwrap();
            client
                .on_voice_server_update(server_update("voice-token", Some(&format!("wss://{endpoint}"))))
                .await
                .unwrap();
        });
        Ok(())
    }

    fn remove_voice_client(&self, server_id: ServerId) {
        self.registry.lock().unwrap().remove(&server_id);
    }
}

/// A local voice server: websocket signaling plus a UDP media relay that
/// answers IP discovery and hands every other datagram to the test.
pub struct FakeVoiceServer {
    pub endpoint: String,
    pub packets: mpsc::UnboundedReceiver<Vec<u8>>,
    pub ops: mpsc::UnboundedReceiver<u64>,
    identifies: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<u16>>>>,
}

impl FakeVoiceServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(true).await
    }

    /// A server that accepts connections and never answers.
    pub async fn spawn_silent() -> Self {
        Self::spawn_with(false).await
    }

    async fn spawn_with(answer: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = udp.local_addr().unwrap().port();

        let (packets_tx, packets) = mpsc::unbounded_channel();
        tokio::spawn(relay(udp, packets_tx));

        let (ops_tx, ops) = mpsc::unbounded_channel();
        let identifies = Arc::new(AtomicUsize::new(0));
        let current: Arc<Mutex<Option<mpsc::UnboundedSender<u16>>>> = Arc::new(Mutex::new(None));

        {
            let identifies = identifies.clone();
            let current = current.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let Ok(ws) = accept_async(stream).await else {
                        continue;
                    };
                    let (close_tx, close_rx) = mpsc::unbounded_channel();
                    *current.lock().unwrap() = Some(close_tx);
                    tokio::spawn(serve(
                        ws,
                        answer,
                        udp_port,
                        ops_tx.clone(),
                        identifies.clone(),
                        close_rx,
                    ));
                }
            });
        }

        Self {
            endpoint,
            packets,
            ops,
            identifies,
            current,
        }
    }

    /// Closes the most recent signaling connection with `code`.
    pub fn close(&self, code: u16) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(code);
        }
    }

    pub fn identifies(&self) -> usize {
        self.identifies.load(Ordering::SeqCst)
    }

    pub async fn next_packet(&mut self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), self.packets.recv())
            .await
            .expect("no audio packet within 5s")
            .expect("relay stopped")
    }
}

async fn relay(udp: UdpSocket, packets: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; 2048];
    loop {
        let Ok((len, from)) = udp.recv_from(&mut buf).await else {
            return;
        };
        if len == 74 && buf[0..2] == [0, 1] {
            let reply = discovery_reply(&buf[4..8], from);
            let _ = udp.send_to(&reply, from).await;
        } else {
            let _ = packets.send(buf[..len].to_vec());
        }
    }
}

fn discovery_reply(ssrc: &[u8], from: SocketAddr) -> [u8; 74] {
    let mut reply = [0u8; 74];
    reply[0..2].copy_from_slice(&2u16.to_be_bytes());
    reply[2..4].copy_from_slice(&70u16.to_be_bytes());
    reply[4..8].copy_from_slice(ssrc);
    let ip = from.ip().to_string();
    reply[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
    reply[72..74].copy_from_slice(&from.port().to_be_bytes());
    reply
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    answer: bool,
    udp_port: u16,
    ops: mpsc::UnboundedSender<u64>,
    identifies: Arc<AtomicUsize>,
    mut close_rx: mpsc::UnboundedReceiver<u16>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(Ok(Message::Text(text))) = msg else {
                    return;
                };
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                let op = value["op"].as_u64().unwrap();
                let _ = ops.send(op);
                if !answer {
                    continue;
                }

                let replies = match op {
                    0 => {
                        identifies.fetch_add(1, Ordering::SeqCst);
                        vec![
                            json!({"op": 8, "d": {"heartbeat_interval": 41250.0}}),
                            json!({"op": 2, "d": {
                                "ssrc": SSRC,
                                "ip": "127.0.0.1",
                                "port": udp_port,
                                "modes": ["xsalsa20_poly1305", MODE],
                            }}),
                        ]
                    }
                    1 => vec![json!({"op": 4, "d": {"mode": MODE, "secret_key": SECRET_KEY.to_vec()}})],
                    3 => vec![json!({"op": 6, "d": value["d"].clone()})],
                    _ => Vec::new(),
                };
                for reply in replies {
                    if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
            Some(code) = close_rx.recv() => {
                let frame = CloseFrame { code: CloseCode::from(code), reason: "".into() };
                let _ = write.send(Message::Close(Some(frame))).await;
                while let Some(Ok(_)) = read.next().await {}
                return;
            }
        }
    }
}

/// An address with nothing listening on it.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Polls `check` every 10ms until it holds or `within` passes.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
