//! MQTT wire-level integration tests
//!
//! Runs the client against a scripted in-process TCP "broker" that speaks
//! just enough MQTT 3.1.1 to exercise the handshake, publish flows, and
//! subscription delivery byte-for-byte.

use bytes::Bytes;
use eventfan::mqtt::packet::{
    build_publish, decode_remaining_length, encode_remaining_length, PublishOptions,
};
use eventfan::mqtt::{ConnectionState, MqttClient, MqttClientConfig, MqttError, QoS};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// Read one complete MQTT packet from the socket, returning the first byte
/// and the variable header + payload.
async fn read_packet(stream: &mut TcpStream, buf: &mut Vec<u8>) -> (u8, Vec<u8>) {
    loop {
        if buf.len() >= 2 {
            if let Some((remaining, consumed)) = decode_remaining_length(&buf[1..]).unwrap() {
                let total = 1 + consumed + remaining;
                if buf.len() >= total {
                    let packet: Vec<u8> = buf.drain(..total).collect();
                    return (packet[0], packet[1 + consumed..].to_vec());
                }
            }
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed mid-packet");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn read_string(body: &[u8], at: usize) -> (String, usize) {
    let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
    let s = String::from_utf8(body[at + 2..at + 2 + len].to_vec()).unwrap();
    (s, at + 2 + len)
}

/// Accept one client and complete the CONNECT/CONNACK handshake, asserting
/// the CONNECT packet is well-formed. Returns the socket and its read buffer.
async fn accept_and_handshake(listener: TcpListener) -> (TcpStream, Vec<u8>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();

    let (first, body) = read_packet(&mut stream, &mut buf).await;
    assert_eq!(first >> 4, 1, "expected CONNECT");
    let (protocol_name, at) = read_string(&body, 0);
    assert_eq!(protocol_name, "MQTT");
    assert_eq!(body[at], 4, "protocol level must be 3.1.1");

    stream.write_all(&CONNACK_ACCEPTED).await.unwrap();
    (stream, buf)
}

fn client_for(addr: std::net::SocketAddr, client_id: &str) -> MqttClient {
    let mut config = MqttClientConfig::new(addr.ip().to_string(), addr.port(), client_id);
    config.connect_timeout = Duration::from_secs(2);
    MqttClient::new(config)
}

#[tokio::test]
async fn test_connect_handshake_reaches_connected_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_handshake(listener).await;
        // Hold the socket open until the client's clean DISCONNECT
        let (first, _) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first, 0xE0);
    });

    let client = client_for(addr, "wire-connect");
    client.connect().await.unwrap();
    assert!(client.is_connected());

    // Second connect is a no-op while connected
    client.connect().await.unwrap();

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    broker.await.unwrap();
}

#[tokio::test]
async fn test_connack_refusal_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let (first, _) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first >> 4, 1);
        // Return code 5: not authorized
        stream.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
    });

    let client = client_for(addr, "wire-refused");
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, MqttError::ConnectionRefused(5)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    broker.await.unwrap();
}

#[tokio::test]
async fn test_publish_qos0_bytes_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_handshake(listener).await;
        let (first, body) = read_packet(&mut stream, &mut buf).await;
        // Fixed header 0x30: PUBLISH, qos 0, no retain, no dup
        assert_eq!(first, 0x30);
        let (topic, at) = read_string(&body, 0);
        assert_eq!(topic, "synopticon/gaze");
        // QoS 0 carries no packet identifier; payload starts right after topic
        assert_eq!(&body[at..], br#"{"x":0.5}"#);
    });

    let client = client_for(addr, "wire-pub0");
    client
        .publish(
            "synopticon/gaze",
            Bytes::from_static(br#"{"x":0.5}"#),
            QoS::AtMostOnce,
            false,
        )
        .await
        .unwrap();
    broker.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_publish_qos1_carries_packet_id_and_accepts_puback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_handshake(listener).await;
        let (first, body) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first, 0x32, "PUBLISH with qos 1");
        let (topic, at) = read_string(&body, 0);
        assert_eq!(topic, "events");
        let packet_id = u16::from_be_bytes([body[at], body[at + 1]]);
        assert_ne!(packet_id, 0, "packet id 0 is reserved");
        assert_eq!(&body[at + 2..], b"hi");

        stream
            .write_all(&[0x40, 0x02, body[at], body[at + 1]])
            .await
            .unwrap();
        // Client must still be alive after the ack; a further read should
        // observe the clean DISCONNECT rather than a reset.
        let (first, _) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first, 0xE0, "expected DISCONNECT");
    });

    let client = client_for(addr, "wire-pub1");
    client
        .publish("events", Bytes::from_static(b"hi"), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    // Give the read loop a beat to process the PUBACK
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.is_connected());
    client.disconnect().await;
    broker.await.unwrap();
}

#[tokio::test]
async fn test_subscribe_and_receive_matching_publish() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_handshake(listener).await;

        let (first, body) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first, 0x82, "SUBSCRIBE carries mandated flags 0x02");
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        let (filter, at) = read_string(&body, 2);
        assert_eq!(filter, "sensors/+/gaze");
        assert_eq!(body[at], 0, "requested qos");

        // SUBACK granting qos 0
        let id = packet_id.to_be_bytes();
        stream.write_all(&[0x90, 0x03, id[0], id[1], 0x00]).await.unwrap();

        // One matching and one non-matching publish
        for topic in ["sensors/eye0/gaze", "sensors/eye0/blink"] {
            let publish = build_publish(&PublishOptions {
                topic: topic.to_string(),
                payload: Bytes::from_static(b"{}"),
                qos: QoS::AtMostOnce,
                retain: false,
                packet_id: 0,
            })
            .unwrap();
            stream.write_all(&publish).await.unwrap();
        }
        // Hold the socket open until the client disconnects
        let (first, _) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first, 0xE0);
    });

    let client = client_for(addr, "wire-sub");
    client.connect().await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .subscribe(
            vec!["sensors/+/gaze".to_string()],
            Arc::new(move |message| {
                let _ = tx.send(message);
            }),
            QoS::AtMostOnce,
        )
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message delivered")
        .unwrap();
    assert_eq!(message.topic, "sensors/eye0/gaze");
    assert_eq!(message.payload, Bytes::from_static(b"{}"));

    // The blink topic must not have matched the filter
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    client.disconnect().await;
    broker.await.unwrap();
}

fn parse_subscribe_entries(body: &[u8]) -> Vec<(String, u8)> {
    // Skip the packet identifier, then read (filter, requested qos) pairs
    let mut at = 2;
    let mut entries = Vec::new();
    while at < body.len() {
        let (filter, next) = read_string(body, at);
        entries.push((filter, body[next]));
        at = next + 1;
    }
    entries
}

#[tokio::test]
async fn test_resubscribe_replays_each_filter_at_its_requested_qos() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_handshake(listener).await;

        // Two SUBSCRIBEs from the subscribe() calls, then the replay
        for _ in 0..2 {
            let (first, _) = read_packet(&mut stream, &mut buf).await;
            assert_eq!(first, 0x82);
        }
        let (first, body) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first, 0x82);
        assert_eq!(
            parse_subscribe_entries(&body),
            vec![
                ("alerts".to_string(), 1),
                ("telemetry/#".to_string(), 0),
            ]
        );

        let (first, _) = read_packet(&mut stream, &mut buf).await;
        assert_eq!(first, 0xE0);
    });

    let client = client_for(addr, "wire-resub");
    client.connect().await.unwrap();

    client
        .subscribe(
            vec!["telemetry/#".to_string()],
            Arc::new(|_| {}),
            QoS::AtMostOnce,
        )
        .await
        .unwrap();
    client
        .subscribe(vec!["alerts".to_string()], Arc::new(|_| {}), QoS::AtLeastOnce)
        .await
        .unwrap();

    client.resubscribe_all().await.unwrap();

    client.disconnect().await;
    broker.await.unwrap();
}

#[tokio::test]
async fn test_broker_dropping_socket_resets_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = tokio::spawn(async move {
        let (stream, _) = accept_and_handshake(listener).await;
        drop(stream);
    });

    let client = client_for(addr, "wire-drop");
    client.connect().await.unwrap();
    broker.await.unwrap();

    // Read loop notices EOF and transitions to Disconnected
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "state never reset");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

proptest! {
    #[test]
    fn prop_remaining_length_round_trips(len in 0usize..=268_435_455) {
        let mut buf = bytes::BytesMut::new();
        encode_remaining_length(&mut buf, len).unwrap();
        prop_assert!(buf.len() <= 4);
        let (decoded, consumed) = decode_remaining_length(&buf).unwrap().unwrap();
        prop_assert_eq!(decoded, len);
        prop_assert_eq!(consumed, buf.len());
    }
}
