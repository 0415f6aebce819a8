mod common;

use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use common::*;
use voice_link_rs::transport::OPUS_SILENCE;
use voice_link_rs::{OpusFrames, VoiceError, VoiceProtocol};

fn open_packet(packet: &[u8]) -> Vec<u8> {
    let (header, rest) = packet.split_at(12);
    let (ciphertext, wire_nonce) = rest.split_at(rest.len() - 4);
    let mut nonce = [0u8; 24];
    nonce[..4].copy_from_slice(wire_nonce);

    let cipher = XChaCha20Poly1305::new_from_slice(&SECRET_KEY).unwrap();
    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: header,
            },
        )
        .expect("packet should open with the session key")
}

fn sequence(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[2], packet[3]])
}

#[tokio::test]
async fn handshake_streams_audio_and_normal_close_disconnects() {
    init_logging();
    let mut server = FakeVoiceServer::spawn().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();

    client.connect(Duration::from_secs(5), false).await.unwrap();
    assert!(client.is_connected());
    assert!(client.is_polling());
    assert_eq!(client.connection_attempts(), 1);
    assert_eq!(client.connection_info().endpoint.as_deref(), Some(server.endpoint.as_str()));

    client.send_audio_packet(&OPUS_SILENCE, false).unwrap();
    let packet = server.next_packet().await;
    assert_eq!(&packet[..2], &[0x80, 0x78]);
    assert_eq!(sequence(&packet), 1);
    assert_eq!(&packet[8..12], &SSRC.to_be_bytes());
    assert_eq!(open_packet(&packet), OPUS_SILENCE);

    // three frames, then the trailing silence
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    client
        .play(
            Box::new(OpusFrames::new(vec![vec![1, 2, 3]; 3])),
            Some(Box::new(move |err| {
                let _ = done_tx.send(err.map(|e| e.to_string()));
            })),
        )
        .unwrap();
    assert!(matches!(
        client.play(Box::new(OpusFrames::new(Vec::new())), None),
        Err(VoiceError::AlreadyPlaying)
    ));

    let mut previous = sequence(&packet);
    for i in 0..8 {
        let packet = server.next_packet().await;
        assert_eq!(sequence(&packet), previous + 1);
        previous = sequence(&packet);
        let expected: &[u8] = if i < 3 { &[1, 2, 3] } else { &OPUS_SILENCE };
        assert_eq!(open_packet(&packet), expected);
    }
    let finished = tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished, None);

    server.close(1000);
    assert!(eventually(Duration::from_secs(5), || !gateway.is_registered(SERVER_ID)).await);
    assert!(!client.is_connected());
    assert!(client.socket_addr().is_none());
    assert!(eventually(Duration::from_secs(1), || !client.is_polling()).await);
    assert_eq!(gateway.voice_states(), vec![Some(CHANNEL_ID), None]);

    // already disconnected: nothing to do
    client.disconnect(false).await.unwrap();
    assert_eq!(gateway.voice_states().len(), 2);
}

#[tokio::test]
async fn channel_move_then_forced_removal() {
    init_logging();
    let server = FakeVoiceServer::spawn().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();
    client.connect(Duration::from_secs(5), true).await.unwrap();

    client.on_voice_state_update(state_update(Some(OTHER_CHANNEL_ID))).await.unwrap();
    assert_eq!(client.connection_info().channel_id, OTHER_CHANNEL_ID);
    assert!(client.is_connected());

    client.on_voice_state_update(state_update(None)).await.unwrap();
    assert!(!client.is_connected());
    assert!(!client.is_polling());
    assert!(client.socket_addr().is_none());
    assert!(!gateway.is_registered(SERVER_ID));
    assert!(matches!(
        client.send_audio_packet(&OPUS_SILENCE, false),
        Err(VoiceError::NotConnected)
    ));
}

#[tokio::test]
async fn forced_move_waits_for_new_server_only() {
    init_logging();
    let server = FakeVoiceServer::spawn().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();
    client.connect(Duration::from_secs(5), false).await.unwrap();

    server.close(4014);
    assert!(eventually(Duration::from_secs(5), || client.is_handshaking()).await);
    assert!(!client.is_connected());

    // the state update during a potential reconnect is a channel move
    client.on_voice_state_update(state_update(Some(OTHER_CHANNEL_ID))).await.unwrap();
    assert!(client.is_handshaking());
    client
        .on_voice_server_update(server_update("moved-token", Some(&server.endpoint)))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(5), || client.is_connected()).await);
    assert_eq!(server.identifies(), 2);
    assert_eq!(client.connection_info().channel_id, OTHER_CHANNEL_ID);
    assert_eq!(client.connection_info().token.as_deref(), Some("moved-token"));
    // no second join request was made
    assert_eq!(gateway.voice_states(), vec![Some(CHANNEL_ID)]);
    assert!(client.is_polling());

    client.disconnect(false).await.unwrap();
    assert!(!gateway.is_registered(SERVER_ID));
}

#[tokio::test]
async fn failed_forced_move_reconnect_disconnects_fully() {
    init_logging();
    let server = FakeVoiceServer::spawn().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();
    client.connect(Duration::from_secs(5), true).await.unwrap();

    server.close(4014);
    assert!(eventually(Duration::from_secs(5), || client.is_handshaking()).await);

    // the new voice server refuses the signaling connection
    let dead = dead_endpoint().await;
    client
        .on_voice_server_update(server_update("moved-token", Some(&dead)))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(5), || !gateway.is_registered(SERVER_ID)).await);
    assert!(eventually(Duration::from_secs(1), || !client.is_polling()).await);
    assert!(!client.is_connected());
    assert!(!client.is_handshaking());
    assert!(client.socket_addr().is_none());
    assert_eq!(gateway.voice_states(), vec![Some(CHANNEL_ID), None]);
}

#[tokio::test]
async fn server_crash_close_disconnects() {
    init_logging();
    let server = FakeVoiceServer::spawn().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();
    client.connect(Duration::from_secs(5), true).await.unwrap();

    server.close(4015);
    assert!(eventually(Duration::from_secs(5), || !gateway.is_registered(SERVER_ID)).await);
    assert!(eventually(Duration::from_secs(1), || !client.is_polling()).await);
    assert!(!client.is_connected());
    assert!(client.socket_addr().is_none());
    // no reconnect was attempted
    assert_eq!(server.identifies(), 1);
    assert_eq!(gateway.voice_states(), vec![Some(CHANNEL_ID), None]);
}

#[tokio::test]
async fn unknown_close_without_reconnect_disconnects() {
    init_logging();
    let server = FakeVoiceServer::spawn().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();
    client.connect(Duration::from_secs(5), false).await.unwrap();

    // session no longer valid
    server.close(4006);
    assert!(eventually(Duration::from_secs(5), || !gateway.is_registered(SERVER_ID)).await);
    assert!(eventually(Duration::from_secs(1), || !client.is_polling()).await);
    assert!(!client.is_connected());
    assert!(client.socket_addr().is_none());
    assert_eq!(server.identifies(), 1);
    assert_eq!(gateway.voice_states(), vec![Some(CHANNEL_ID), None]);
}

#[tokio::test]
async fn refused_join_ends_the_handshake() {
    init_logging();
    let gateway = MockGateway::new(None);
    let client = gateway.client();
    gateway.refuse_joins(true);

    let err = client.connect(Duration::from_secs(5), false).await.unwrap_err();
    assert!(matches!(err, VoiceError::Gateway(_)));
    assert!(!client.is_handshaking());
    assert!(!client.is_polling());

    // read as a steady-state channel move, not a handshake signal
    client.on_voice_state_update(state_update(Some(OTHER_CHANNEL_ID))).await.unwrap();
    assert_eq!(client.connection_info().channel_id, OTHER_CHANNEL_ID);
    assert!(gateway.voice_states().is_empty());
}

#[tokio::test]
async fn endpoint_change_reconnects() {
    init_logging();
    let server = FakeVoiceServer::spawn().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();
    client.connect(Duration::from_secs(5), true).await.unwrap();
    let first_socket = client.socket_addr().unwrap();

    client
        .on_voice_server_update(server_update("new-token", Some(&server.endpoint)))
        .await
        .unwrap();
    assert_ne!(client.socket_addr(), Some(first_socket));

    assert!(
        eventually(Duration::from_secs(10), || {
            server.identifies() == 2 && client.is_connected()
        })
        .await
    );
    assert_eq!(
        gateway.voice_states(),
        vec![Some(CHANNEL_ID), None, Some(CHANNEL_ID)]
    );
    assert_eq!(client.connection_attempts(), 2);

    client.disconnect(false).await.unwrap();
}

#[tokio::test]
async fn redundant_server_update_is_ignored() {
    init_logging();
    let gateway = MockGateway::new(None);
    let client = gateway.client();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect(Duration::from_millis(500), false).await }
    });
    assert!(eventually(Duration::from_secs(2), || gateway.voice_states().len() == 1).await);

    client
        .on_voice_server_update(server_update("first", Some("wss://127.0.0.1:1111")))
        .await
        .unwrap();
    let before = client.connection_info();
    assert_eq!(before.endpoint.as_deref(), Some("127.0.0.1:1111"));
    let socket = client.socket_addr();
    assert!(socket.is_some());

    client
        .on_voice_server_update(server_update("second", Some("127.0.0.1:2222")))
        .await
        .unwrap();
    assert_eq!(client.connection_info(), before);
    assert_eq!(client.socket_addr(), socket);

    // the state update never came
    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, VoiceError::Timeout(_)));
    assert!(!client.is_connected());
    assert!(!client.is_polling());
    assert!(!client.is_handshaking());
    assert!(client.socket_addr().is_none());
    assert!(!gateway.is_registered(SERVER_ID));
    assert_eq!(gateway.voice_states(), vec![Some(CHANNEL_ID), None]);
}

#[tokio::test]
async fn server_update_without_endpoint_waits() {
    init_logging();
    let gateway = MockGateway::new(None);
    let client = gateway.client();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect(Duration::from_millis(300), false).await }
    });
    assert!(eventually(Duration::from_secs(2), || gateway.voice_states().len() == 1).await);

    client.on_voice_state_update(state_update(Some(CHANNEL_ID))).await.unwrap();
    client.on_voice_server_update(server_update("token", None)).await.unwrap();
    client.on_voice_server_update(server_update("", Some("127.0.0.1:1"))).await.unwrap();
    assert!(client.connection_info().endpoint.is_none());
    assert!(client.connection_info().token.is_none());
    assert!(client.socket_addr().is_none());

    assert!(matches!(
        connecting.await.unwrap(),
        Err(VoiceError::Timeout(_))
    ));
    assert!(!client.is_polling());
}

#[tokio::test(start_paused = true)]
async fn exhausted_signaling_attempts_propagate_timeout() {
    init_logging();
    let server = FakeVoiceServer::spawn_silent().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client();

    let err = client
        .connect(Duration::from_secs(10), true)
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::Timeout(_)), "got {err:?}");
    assert_eq!(client.connection_attempts(), 5);
    assert_eq!(gateway.voice_states().len(), 10);
    assert!(gateway.voice_states().chunks(2).all(|c| c == [Some(CHANNEL_ID), None]));
    assert!(!client.is_connected());
    assert!(!client.is_polling());
}

#[tokio::test]
async fn signaling_timeout_without_reconnect_fails_fast() {
    init_logging();
    let server = FakeVoiceServer::spawn_silent().await;
    let gateway = MockGateway::new(Some(server.endpoint.clone()));
    let client = gateway.client_with(voice_link_rs::VoiceConfig {
        poll_timeout: Duration::from_millis(200),
        ..test_config()
    });

    let err = client.connect(Duration::from_secs(2), false).await.unwrap_err();
    assert!(matches!(err, VoiceError::Timeout(_)));
    assert_eq!(client.connection_attempts(), 1);
    assert!(!client.is_polling());
}
