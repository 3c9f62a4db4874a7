//! MQTT Broker Core
//!
//! Assembles the session registry, subscription store, retained-message
//! map and connection table, accepts sockets, and spawns one connection
//! handler per client.

mod connection;
pub mod fanout;

pub use connection::{Connection, ConnectionError};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::protocol::{Packet, Publish, QoS};
use crate::registry::Registry;
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum accepted remaining length; larger declared frames close
    /// the connection before any body byte is read
    pub max_packet_size: usize,
    /// Keep alive applied when a client asks for 0
    pub default_keep_alive: u16,
    /// Upper bound on the negotiated keep alive
    pub max_keep_alive: u16,
    /// Highest QoS granted to subscriptions
    pub max_qos: QoS,
    /// How long a fresh socket may sit without sending CONNECT
    pub connect_timeout: Duration,
    /// Per-connection outbound queue depth
    pub outbound_channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024, // 1 MB
            default_keep_alive: 60,
            max_keep_alive: 65535,
            max_qos: QoS::ExactlyOnce,
            connect_timeout: Duration::from_secs(30),
            outbound_channel_capacity: 1024,
        }
    }
}

/// Last retained value for a topic
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Live socket state tracked by the connection table
pub struct ConnectionEntry {
    pub addr: SocketAddr,
    /// Unset until the CONNECT handshake completes
    pub client_id: Option<Arc<str>>,
    sender: mpsc::Sender<Packet>,
}

/// Registry of live sockets keyed by a broker-assigned correlation id,
/// used to find a connection on teardown and to sweep every socket on
/// shutdown
pub struct ConnectionTable {
    inner: RwLock<Registry<ConnectionEntry>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Track a freshly accepted socket; returns its correlation id
    pub fn register(&self, addr: SocketAddr, sender: mpsc::Sender<Packet>) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("conn-{seq:08x}");
        self.inner.write().put(
            conn_id.clone(),
            ConnectionEntry {
                addr,
                client_id: None,
                sender,
            },
        );
        conn_id
    }

    /// Associate a connection with its client id after CONNECT
    pub fn bind(&self, conn_id: &str, client_id: Arc<str>) {
        if let Some(entry) = self.inner.write().get_mut(conn_id) {
            entry.client_id = Some(client_id);
        }
    }

    /// Stop tracking a socket
    pub fn remove(&self, conn_id: &str) -> Option<ConnectionEntry> {
        self.inner.write().delete(conn_id)
    }

    /// Number of live sockets
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Ask every live connection to disconnect
    pub fn disconnect_all(&self) {
        for (conn_id, entry) in self.inner.read().iter() {
            if entry.sender.try_send(Packet::Disconnect).is_err() {
                debug!("shutdown notice dropped for {}", conn_id);
            }
        }
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<DashMap<String, RetainedMessage>>,
    connections: Arc<ConnectionTable>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            subscriptions: Arc::new(SubscriptionStore::new()),
            retained: Arc::new(DashMap::new()),
            connections: Arc::new(ConnectionTable::new()),
            shutdown,
        }
    }

    /// Run the broker until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = bind_listener(self.config.bind_addr)?;
        info!("MQTT listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if self.connections.len() >= self.config.max_connections {
                                warn!("connection limit reached, refusing {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("set_nodelay failed for {}: {}", addr, e);
                            }
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("broker shutting down");
                    self.connections.disconnect_all();
                    return Ok(());
                }
            }
        }
    }

    /// Hand a socket to its own connection task
    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut conn = Connection::new(
                stream,
                addr,
                sessions,
                subscriptions,
                retained,
                connections,
                config,
            );

            let conn_fut = conn.run();
            tokio::pin!(conn_fut);

            loop {
                tokio::select! {
                    biased;

                    result = &mut conn_fut => {
                        if let Err(e) = result {
                            debug!("connection error from {}: {}", addr, e);
                        }
                        break;
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Publish a message originating from the server itself
    pub fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload: payload.clone(),
        };

        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(
                    topic.to_string(),
                    RetainedMessage {
                        topic: publish.topic.clone(),
                        payload,
                        qos,
                    },
                );
            }
        }

        fanout::fan_out(&self.sessions, &self.subscriptions, &publish);
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of live sockets
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of retained topics
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// Bind the listener with SO_REUSEADDR so restarts do not trip over
/// sockets lingering in TIME_WAIT
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, std::io::Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}
