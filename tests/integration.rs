//! Integration tests
//!
//! Drive the broker over real sockets with a minimal MQTT client and
//! verify the protocol flows: handshake, subscribe/publish fan-out, QoS
//! acknowledgements, retained messages, wills, and connection teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use driftmq::broker::{Broker, BrokerConfig};
use driftmq::codec::{Decoder, Encoder};
use driftmq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Subscription, Unsubscribe, Will,
};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(18830);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        max_connections: 64,
        max_packet_size: 1024 * 1024,
        default_keep_alive: 60,
        max_keep_alive: 300,
        max_qos: QoS::ExactlyOnce,
        connect_timeout: Duration::from_secs(5),
        outbound_channel_capacity: 64,
    }
}

/// Start a broker on a fresh port and wait until it accepts sockets
async fn start_broker(config: BrokerConfig) -> (Arc<Broker>, SocketAddr) {
    let addr = config.bind_addr;
    let broker = Arc::new(Broker::new(config));

    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            return (broker, addr);
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("broker did not start on {}", addr);
}

/// Minimal MQTT client for driving the broker in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("failed to encode");
        self.stream.write_all(&buf).await.expect("failed to write");
    }

    /// Send raw bytes, bypassing the encoder
    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("failed to write");
    }

    /// Receive the next packet, reassembling split frames
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.read_buf) {
                use bytes::Buf;
                self.read_buf.advance(consumed);
                return Some(packet);
            }

            let read = timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.read_buf));
            match read.await {
                Ok(Ok(0)) => return None,
                Ok(Ok(_)) => {}
                _ => return None,
            }
        }
    }

    /// Wait for the peer to close the socket; true if it did
    async fn wait_for_close(&mut self) -> bool {
        loop {
            let mut buf = [0u8; 256];
            match timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => return true,
                Ok(Ok(_)) => {}
                _ => return false,
            }
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with(client_id, clean_session, None).await
    }

    async fn mqtt_connect_with(
        &mut self,
        client_id: &str,
        clean_session: bool,
        will: Option<Will>,
    ) -> ConnAck {
        self.send(&Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive: 60,
            will,
            ..Connect::default()
        })))
        .await;

        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let packet_id = (qos != QoS::AtMostOnce).then_some(1);
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }
}

#[tokio::test]
async fn connect_handshake() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("c1", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
    assert!(!ack.session_present);
}

#[tokio::test]
async fn empty_client_id_with_session_reuse_rejected() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("", false).await;
    assert_eq!(ack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(client.wait_for_close().await);
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.send(&Packet::PingReq).await;
    assert!(client.wait_for_close().await);
}

#[tokio::test]
async fn subscriber_receives_at_granted_qos_with_fresh_packet_id() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("c1", true).await;
    let ack = subscriber.subscribe(1, "a/b", QoS::AtLeastOnce).await;
    assert_eq!(ack.return_codes, vec![SubscribeReturnCode::GrantedQoS1]);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("c2", true).await;
    // Published at QoS 0; delivered at the subscriber's granted QoS 1
    publisher.publish("a/b", b"hello", QoS::AtMostOnce, false).await;

    match subscriber.recv().await {
        Some(Packet::Publish(p)) => {
            assert_eq!(p.topic.as_ref(), "a/b");
            assert_eq!(p.payload.as_ref(), b"hello");
            assert_eq!(p.qos, QoS::AtLeastOnce);
            let first_id = p.packet_id.expect("QoS 1 delivery carries a packet id");
            assert_ne!(first_id, 0);

            // A second publish gets a different identifier
            publisher.publish("a/b", b"again", QoS::AtMostOnce, false).await;
            match subscriber.recv().await {
                Some(Packet::Publish(p2)) => {
                    assert_ne!(p2.packet_id.expect("packet id"), first_id);
                }
                other => panic!("expected second PUBLISH, got {:?}", other),
            }
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn qos1_publish_is_acknowledged() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;
    client.publish("a/b", b"x", QoS::AtLeastOnce, false).await;

    match client.recv().await {
        Some(Packet::PubAck(PubAck { packet_id })) => assert_eq!(packet_id, 1),
        other => panic!("expected PUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn qos2_publish_completes_the_handshake() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("sub", true).await;
    subscriber.subscribe(1, "q2/t", QoS::AtMostOnce).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("pub", true).await;
    client.publish("q2/t", b"exactly", QoS::ExactlyOnce, false).await;

    match client.recv().await {
        Some(Packet::PubRec(rec)) => assert_eq!(rec.packet_id, 1),
        other => panic!("expected PUBREC, got {:?}", other),
    }

    // Nothing is routed until PUBREL
    client
        .send(&Packet::PubRel(driftmq::protocol::PubRel::new(1)))
        .await;
    match client.recv().await {
        Some(Packet::PubComp(comp)) => assert_eq!(comp.packet_id, 1),
        other => panic!("expected PUBCOMP, got {:?}", other),
    }

    match subscriber.recv().await {
        Some(Packet::Publish(p)) => {
            assert_eq!(p.payload.as_ref(), b"exactly");
            assert_eq!(p.qos, QoS::AtMostOnce);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn fan_out_survives_a_dead_subscriber() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    // Three subscribers; the first drops its socket without DISCONNECT but
    // keeps a persistent session, so its subscription stays on the books
    let mut dead = TestClient::connect(addr).await;
    dead.mqtt_connect("dead", false).await;
    dead.subscribe(1, "f/t", QoS::AtMostOnce).await;
    drop(dead);

    let mut alive_b = TestClient::connect(addr).await;
    alive_b.mqtt_connect("b", true).await;
    alive_b.subscribe(1, "f/t", QoS::AtMostOnce).await;

    let mut alive_c = TestClient::connect(addr).await;
    alive_c.mqtt_connect("c", true).await;
    alive_c.subscribe(1, "f/t", QoS::AtMostOnce).await;

    // Give the broker a moment to reap the dead socket
    sleep(Duration::from_millis(100)).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("f/t", b"payload", QoS::AtMostOnce, false).await;

    for subscriber in [&mut alive_b, &mut alive_c] {
        match subscriber.recv().await {
            Some(Packet::Publish(p)) => assert_eq!(p.payload.as_ref(), b"payload"),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn oversize_packet_closes_connection_without_body() {
    let mut config = test_config(next_port());
    config.max_packet_size = 1024;
    let (_broker, addr) = start_broker(config).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;

    // PUBLISH header declaring a one-megabyte body; no body bytes follow
    let mut frame = BytesMut::new();
    frame.extend_from_slice(&[0x30]);
    driftmq::codec::write_variable_int(&mut frame, 1024 * 1024).unwrap();
    client.send_raw(&frame).await;

    assert!(client.wait_for_close().await);
}

#[tokio::test]
async fn retained_message_delivered_on_subscribe() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("state/x", b"42", QoS::AtMostOnce, true).await;

    sleep(Duration::from_millis(50)).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("sub", true).await;
    subscriber.subscribe(1, "state/+", QoS::AtMostOnce).await;

    match subscriber.recv().await {
        Some(Packet::Publish(p)) => {
            assert_eq!(p.topic.as_ref(), "state/x");
            assert_eq!(p.payload.as_ref(), b"42");
            assert!(p.retain);
        }
        other => panic!("expected retained PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn will_published_on_unclean_disconnect() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "wills/c1", QoS::AtMostOnce).await;

    let mut doomed = TestClient::connect(addr).await;
    doomed
        .mqtt_connect_with(
            "c1",
            true,
            Some(Will {
                topic: "wills/c1".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
        )
        .await;

    // Drop the socket without DISCONNECT
    drop(doomed);

    match watcher.recv().await {
        Some(Packet::Publish(p)) => {
            assert_eq!(p.topic.as_ref(), "wills/c1");
            assert_eq!(p.payload.as_ref(), b"gone");
        }
        other => panic!("expected will PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn clean_disconnect_suppresses_will() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "wills/c1", QoS::AtMostOnce).await;

    let mut polite = TestClient::connect(addr).await;
    polite
        .mqtt_connect_with(
            "c1",
            true,
            Some(Will {
                topic: "wills/c1".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
        )
        .await;

    polite.send(&Packet::Disconnect).await;
    drop(polite);

    // No will should arrive
    let got = timeout(Duration::from_millis(500), watcher.recv()).await;
    assert!(got.is_err(), "will was published after clean DISCONNECT");
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("sub", true).await;
    subscriber.subscribe(1, "u/t", QoS::AtMostOnce).await;

    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["u/t".to_string()],
        }))
        .await;
    match subscriber.recv().await {
        Some(Packet::UnsubAck(ack)) => assert_eq!(ack.packet_id, 2),
        other => panic!("expected UNSUBACK, got {:?}", other),
    }

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("u/t", b"x", QoS::AtMostOnce, false).await;

    let got = timeout(Duration::from_millis(500), subscriber.recv()).await;
    assert!(got.is_err(), "received a publish after unsubscribing");
}

#[tokio::test]
async fn invalid_filter_refused_with_0x80() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;

    client
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 3,
            subscriptions: vec![
                Subscription {
                    filter: "ok/+".to_string(),
                    qos: QoS::AtMostOnce,
                },
                Subscription {
                    filter: "bad/#/tail".to_string(),
                    qos: QoS::AtMostOnce,
                },
            ],
        }))
        .await;

    match client.recv().await {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(
                ack.return_codes,
                vec![SubscribeReturnCode::GrantedQoS0, SubscribeReturnCode::Failure]
            );
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn granted_qos_capped_by_broker_maximum() {
    let mut config = test_config(next_port());
    config.max_qos = QoS::AtLeastOnce;
    let (_broker, addr) = start_broker(config).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;
    let ack = client.subscribe(1, "a/b", QoS::ExactlyOnce).await;
    assert_eq!(ack.return_codes, vec![SubscribeReturnCode::GrantedQoS1]);
}

#[tokio::test]
async fn session_takeover_disconnects_previous_connection() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("same-id", true).await;

    let mut second = TestClient::connect(addr).await;
    second.mqtt_connect("same-id", true).await;

    // The first connection is told to go away (DISCONNECT or close)
    match first.recv().await {
        Some(Packet::Disconnect) | None => {}
        other => panic!("expected takeover disconnect, got {:?}", other),
    }

    // The second connection keeps working
    second.subscribe(1, "a/b", QoS::AtMostOnce).await;
}

#[tokio::test]
async fn pingreq_answered_with_pingresp() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;
    client.send(&Packet::PingReq).await;

    match client.recv().await {
        Some(Packet::PingResp) => {}
        other => panic!("expected PINGRESP, got {:?}", other),
    }
}

#[tokio::test]
async fn idle_connection_closed_after_keep_alive_grace() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client
        .send(&Packet::Connect(Box::new(Connect {
            client_id: "sleepy".to_string(),
            clean_session: true,
            keep_alive: 1,
            ..Connect::default()
        })))
        .await;
    match client.recv().await {
        Some(Packet::ConnAck(_)) => {}
        other => panic!("expected CONNACK, got {:?}", other),
    }

    // Stay silent past 1.5x the keep alive; the broker hangs up
    assert!(client.wait_for_close().await);
}

#[tokio::test]
async fn persistent_session_reports_session_present() {
    let (_broker, addr) = start_broker(test_config(next_port())).await;

    let mut first = TestClient::connect(addr).await;
    let ack = first.mqtt_connect("keeper", false).await;
    assert!(!ack.session_present);
    first.subscribe(1, "a/b", QoS::AtMostOnce).await;
    drop(first);

    sleep(Duration::from_millis(100)).await;

    let mut second = TestClient::connect(addr).await;
    let ack = second.mqtt_connect("keeper", false).await;
    assert!(ack.session_present);
}
