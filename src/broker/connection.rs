//! MQTT Connection Handler
//!
//! Drives one client socket through the protocol state machine: CONNECT
//! handshake, framed packet reads with partial-frame reassembly, an
//! exhaustive per-packet dispatch, and teardown with will delivery.
//!
//! Frames arrive over a non-blocking stream in arbitrary slices; the read
//! buffer accumulates bytes and the incremental decoder yields a packet
//! only once the header, Remaining Length and full body are present, so a
//! read that lands mid-frame simply resumes on the next readable event.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::broker::{fanout, BrokerConfig, ConnectionTable, RetainedMessage};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::session::{Session, SessionStore};
use crate::topic::{
    topic_matches_filter, validate_topic_filter, validate_topic_name, Subscriber,
    SubscriptionStore,
};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(crate::protocol::DecodeError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<crate::protocol::DecodeError> for ConnectionError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

/// Connection state
enum State {
    /// Waiting for CONNECT packet
    Connecting,
    /// Connected and running
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    /// Correlation id assigned by the connection table while the socket
    /// is alive
    conn_id: Option<String>,
    state: State,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<DashMap<String, RetainedMessage>>,
    connections: Arc<ConnectionTable>,
    config: BrokerConfig,
    packet_tx: mpsc::Sender<Packet>,
    packet_rx: mpsc::Receiver<Packet>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        sessions: Arc<SessionStore>,
        subscriptions: Arc<SubscriptionStore>,
        retained: Arc<DashMap<String, RetainedMessage>>,
        connections: Arc<ConnectionTable>,
        config: BrokerConfig,
    ) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(config.outbound_channel_capacity);

        Self {
            stream,
            addr,
            conn_id: None,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            sessions,
            subscriptions,
            retained,
            connections,
            config,
            packet_tx,
            packet_rx,
        }
    }

    /// Run the connection handler
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let conn_id = self.connections.register(self.addr, self.packet_tx.clone());
        self.conn_id = Some(conn_id);

        let result = self.drive().await;

        if let Some(conn_id) = self.conn_id.take() {
            self.connections.remove(&conn_id);
        }
        result
    }

    async fn drive(&mut self) -> Result<(), ConnectionError> {
        // Wait for CONNECT packet with timeout
        match timeout(self.config.connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        self.run_connected().await
    }

    /// Read and process the CONNECT packet
    async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);

                return match packet {
                    Packet::Connect(connect) => self.handle_connect(*connect).await,
                    _ => {
                        debug!("first packet from {} was not CONNECT", self.addr);
                        Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                            "first packet must be CONNECT",
                        )))
                    }
                };
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// Handle the CONNECT packet
    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // Per MQTT-3.1.2-2: unsupported protocol levels are answered with
        // CONNACK 0x01 before closing
        if connect.protocol_level != 3 && connect.protocol_level != 4 {
            debug!(
                "rejecting protocol level {} from {}",
                connect.protocol_level, self.addr
            );
            self.write_packet(&Packet::ConnAck(ConnAck::refused(
                ConnectReturnCode::UnacceptableProtocolVersion,
            )))
            .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "unsupported protocol level",
            )));
        }

        // Per MQTT-3.1.3-8: a zero-byte client id requires clean_session=1
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "rejecting empty client id with clean_session=0 from {}",
                self.addr
            );
            self.write_packet(&Packet::ConnAck(ConnAck::refused(
                ConnectReturnCode::IdentifierRejected,
            )))
            .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "empty client id with clean_session=0",
            )));
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("driftmq-{:x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        // Session takeover: disconnect any connection already bound to
        // this client id
        if let Some(previous) = self.sessions.get(&client_id) {
            if let Some(tx) = previous.read().outbound() {
                let _ = tx.try_send(Packet::Disconnect);
            }
        }

        let (session, session_present) = self
            .sessions
            .get_or_create(&client_id, connect.clean_session);

        // A clean session starts with no subscriptions on the books
        if connect.clean_session {
            self.subscriptions.unsubscribe_all(&client_id);
        }

        {
            let mut s = session.write();
            s.clean_session = connect.clean_session;
            s.keep_alive = if connect.keep_alive == 0 {
                self.config.default_keep_alive
            } else {
                connect.keep_alive.min(self.config.max_keep_alive)
            };
            s.will = connect.will;
            s.bind(self.packet_tx.clone());
            s.touch();
        }

        if let Some(conn_id) = self.conn_id.as_deref() {
            self.connections.bind(conn_id, client_id.clone());
        }

        self.write_packet(&Packet::ConnAck(ConnAck::accepted(session_present)))
            .await?;

        self.state = State::Connected { client_id, session };
        Ok(())
    }

    /// Run the main connection loop
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            State::Connecting => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "not connected",
                )))
            }
        };

        // Per MQTT-3.1.2-24: disconnect after 1.5x the keep alive interval
        let keep_alive_check = {
            let s = session.read();
            if s.keep_alive == 0 {
                Duration::from_secs(3600)
            } else {
                Duration::from_secs((s.keep_alive as u64 * 3) / 2)
            }
        };

        loop {
            tokio::select! {
                // Bytes from the socket
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("connection closed by {}", self.addr);
                            self.teardown(&client_id, &session, true);
                            return Ok(());
                        }
                        Ok(_) => {
                            loop {
                                let decoded = match self.decoder.decode(&self.read_buf) {
                                    Ok(Some(frame)) => frame,
                                    // Partial frame: resume on the next read
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!("decode error from {}: {}", client_id, e);
                                        self.teardown(&client_id, &session, true);
                                        return Err(e.into());
                                    }
                                };
                                let (packet, consumed) = decoded;
                                self.read_buf.advance(consumed);

                                session.write().touch();

                                if let Err(e) = self.handle_packet(&client_id, &session, packet).await {
                                    match e {
                                        // Clean DISCONNECT, teardown already done
                                        ConnectionError::Shutdown => return Ok(()),
                                        _ => {
                                            debug!("error handling packet from {}: {}", client_id, e);
                                            self.teardown(&client_id, &session, true);
                                            return Err(e);
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!("read error from {}: {}", self.addr, e);
                            self.teardown(&client_id, &session, true);
                            return Err(e.into());
                        }
                    }
                }

                // Packets queued for this client (fan-out, takeover, shutdown)
                maybe_packet = self.packet_rx.recv() => {
                    match maybe_packet {
                        Some(Packet::Disconnect) => {
                            // Session taken over or broker shutting down; the
                            // session now belongs to someone else
                            let _ = self.write_packet(&Packet::Disconnect).await;
                            return Ok(());
                        }
                        Some(packet) => {
                            self.write_packet(&packet).await?;
                        }
                        None => {
                            return Ok(());
                        }
                    }
                }

                // Keep alive timeout
                _ = tokio::time::sleep(keep_alive_check) => {
                    if session.read().is_keep_alive_expired() {
                        debug!("keep alive timeout for {}", client_id);
                        self.teardown(&client_id, &session, true);
                        return Err(ConnectionError::Protocol(ProtocolError::KeepAliveTimeout));
                    }
                }
            }
        }
    }

    /// Handle an incoming packet
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(
                ProtocolError::ProtocolViolation("duplicate CONNECT"),
            )),
            Packet::Publish(publish) => self.handle_publish(client_id, session, publish).await,
            Packet::PubAck(PubAck { packet_id }) => {
                session.write().inflight_outgoing.remove(&packet_id);
                Ok(())
            }
            Packet::PubRec(PubRec { packet_id }) => {
                // Outbound QoS 2 step: stays inflight until PUBCOMP
                self.write_packet(&Packet::PubRel(PubRel::new(packet_id)))
                    .await
            }
            Packet::PubRel(PubRel { packet_id }) => {
                let stored = session.write().inflight_incoming.remove(&packet_id);
                self.write_packet(&Packet::PubComp(PubComp::new(packet_id)))
                    .await?;
                // Inbound QoS 2 delivery completes here
                if let Some(publish) = stored {
                    self.route(&publish);
                }
                Ok(())
            }
            Packet::PubComp(PubComp { packet_id }) => {
                session.write().inflight_outgoing.remove(&packet_id);
                Ok(())
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe)
                    .await
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client_id);
                // Clean shutdown suppresses the will message
                self.teardown(client_id, session, false);
                Err(ConnectionError::Shutdown)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ConnectionError::Protocol(
                    ProtocolError::ProtocolViolation("server-to-client packet from client"),
                ))
            }
        }
    }

    /// Handle a PUBLISH packet
    async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        if let Err(e) = validate_topic_name(&publish.topic) {
            warn!("invalid topic name from {}: {}", client_id, e);
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "invalid topic name",
            )));
        }

        trace!(
            "PUBLISH from {} to {} (QoS {:?})",
            client_id,
            publish.topic,
            publish.qos
        );

        // Simple last-value retention: empty payload clears the slot
        if publish.retain {
            if publish.payload.is_empty() {
                self.retained.remove(publish.topic.as_ref());
            } else {
                self.retained.insert(
                    publish.topic.to_string(),
                    RetainedMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                        qos: publish.qos,
                    },
                );
            }
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.route(&publish);
            }
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                        "QoS 1 PUBLISH without packet id",
                    )));
                };
                self.route(&publish);
                self.write_packet(&Packet::PubAck(PubAck::new(packet_id)))
                    .await?;
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                        "QoS 2 PUBLISH without packet id",
                    )));
                };
                // Hold the message until PUBREL, then route
                session
                    .write()
                    .inflight_incoming
                    .insert(packet_id, publish.clone());
                self.write_packet(&Packet::PubRec(PubRec::new(packet_id)))
                    .await?;
            }
        }

        Ok(())
    }

    /// Fan a message out to its subscribers
    fn route(&self, publish: &Publish) {
        let delivered = fanout::fan_out(&self.sessions, &self.subscriptions, publish);
        trace!("routed {} to {} subscribers", publish.topic, delivered);
    }

    /// Handle a SUBSCRIBE packet
    async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted_filters: Vec<(String, QoS)> = Vec::new();

        for sub in &subscribe.subscriptions {
            if validate_topic_filter(&sub.filter).is_err() {
                debug!("refusing filter {:?} from {}", sub.filter, client_id);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let granted = sub.qos.min(self.config.max_qos);

            self.subscriptions.subscribe(
                &sub.filter,
                Subscriber {
                    client_id: client_id.clone(),
                    qos: granted,
                },
            );
            session.write().add_subscription(sub.filter.clone(), granted);

            return_codes.push(SubscribeReturnCode::granted(granted));
            granted_filters.push((sub.filter.clone(), granted));

            debug!("SUBSCRIBE {} to {} (QoS {:?})", client_id, sub.filter, granted);
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        // Retained last values are delivered after the SUBACK
        for (filter, granted) in granted_filters {
            self.send_retained(&filter, granted, session).await?;
        }

        Ok(())
    }

    /// Send retained messages matching a newly granted filter
    async fn send_retained(
        &mut self,
        filter: &str,
        granted: QoS,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let matching: Vec<RetainedMessage> = self
            .retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect();

        for retained in matching {
            let qos = retained.qos.min(granted);
            let mut publish = Publish {
                dup: false,
                qos,
                retain: true,
                topic: retained.topic.clone(),
                packet_id: None,
                payload: retained.payload.clone(),
            };

            if qos != QoS::AtMostOnce {
                let mut s = session.write();
                let packet_id = s.next_packet_id();
                publish.packet_id = Some(packet_id);
                s.inflight_outgoing.insert(packet_id, publish.clone());
            }

            self.write_packet(&Packet::Publish(publish)).await?;
        }

        Ok(())
    }

    /// Handle an UNSUBSCRIBE packet
    async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            self.subscriptions.unsubscribe(filter, client_id);
            session.write().remove_subscription(filter);
            debug!("UNSUBSCRIBE {} from {}", client_id, filter);
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
            .await
    }

    /// Release everything this connection holds. Will delivery happens on
    /// unclean teardown only; a clean session is removed from the registry
    /// together with its subscriptions.
    fn teardown(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish_will: bool,
    ) {
        let (clean_session, will) = {
            let mut s = session.write();
            // The session may already be rebound to a newer socket
            let owns_session = s
                .outbound()
                .map(|tx| tx.same_channel(&self.packet_tx))
                .unwrap_or(false);
            if owns_session {
                s.unbind();
            }
            (s.clean_session, s.will.take())
        };

        if publish_will {
            if let Some(will) = will {
                debug!("publishing will for {} to {}", client_id, will.topic);
                let publish = Publish {
                    dup: false,
                    qos: will.qos,
                    retain: will.retain,
                    topic: will.topic.as_str().into(),
                    packet_id: None,
                    payload: will.payload,
                };

                if will.retain {
                    if publish.payload.is_empty() {
                        self.retained.remove(&will.topic);
                    } else {
                        self.retained.insert(
                            will.topic.clone(),
                            RetainedMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.clone(),
                                qos: publish.qos,
                            },
                        );
                    }
                }

                self.route(&publish);
            }
        }

        if clean_session {
            // Only reap registry state that still belongs to this socket's
            // session; a takeover may have replaced it already
            let still_current = self
                .sessions
                .get(client_id)
                .map(|current| Arc::ptr_eq(&current, session))
                .unwrap_or(false);
            if still_current {
                self.subscriptions.unsubscribe_all(client_id);
                self.sessions.remove(client_id);
            }
        }

        debug!("client {} disconnected", client_id);
    }

    /// Encode a packet into the write buffer and flush it to the socket
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}

/// Generate a random ID for clients that connect with an empty client id
fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
