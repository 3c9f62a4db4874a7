//! MQTT Session Management
//!
//! A `Session` is one logical client: identity, liveness metadata, the
//! optional will message, active subscriptions, and QoS bookkeeping. The
//! `SessionStore` owns every session through the bounded-probe registry,
//! keyed by client identifier; connection handlers hold sessions only by
//! reference.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{Packet, Publish, QoS, Will};
use crate::registry::Registry;

/// Client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Clean session flag from CONNECT
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Last activity timestamp
    pub last_activity: Instant,
    /// Will message, taken on unclean teardown
    pub will: Option<Will>,
    /// Active subscriptions (topic filter -> granted QoS)
    pub subscriptions: HashMap<String, QoS>,
    /// Inbound QoS 2 messages held until PUBREL
    pub inflight_incoming: HashMap<u16, Publish>,
    /// Outbound QoS 1/2 packet identifiers awaiting acknowledgement
    pub inflight_outgoing: HashMap<u16, Publish>,
    /// Outbound packet channel while a socket is bound to this session
    outbound: Option<mpsc::Sender<Packet>>,
    /// Next packet identifier
    next_packet_id: u16,
}

impl Session {
    pub fn new(client_id: Arc<str>) -> Self {
        Self {
            client_id,
            clean_session: true,
            keep_alive: 60,
            last_activity: Instant::now(),
            will: None,
            subscriptions: HashMap::new(),
            inflight_incoming: HashMap::new(),
            inflight_outgoing: HashMap::new(),
            outbound: None,
            next_packet_id: 1,
        }
    }

    /// Bind the outbound channel of a freshly connected socket
    pub fn bind(&mut self, sender: mpsc::Sender<Packet>) {
        self.outbound = Some(sender);
    }

    /// Drop the outbound channel on teardown
    pub fn unbind(&mut self) {
        self.outbound = None;
    }

    /// Sender for the bound socket, if any
    pub fn outbound(&self) -> Option<&mpsc::Sender<Packet>> {
        self.outbound.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }

    /// Allocate the next packet identifier, skipping 0 and any id still
    /// awaiting acknowledgement
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.inflight_outgoing.contains_key(&id)
                && !self.inflight_incoming.contains_key(&id)
            {
                return id;
            }
        }
    }

    /// Update the last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Server-side keep alive check at 1.5x the negotiated interval
    pub fn is_keep_alive_expired(&self) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_secs((self.keep_alive as u64 * 3) / 2);
        self.last_activity.elapsed() > timeout
    }

    /// Record a granted subscription
    pub fn add_subscription(&mut self, filter: String, granted: QoS) {
        self.subscriptions.insert(filter, granted);
    }

    /// Remove a subscription; true if one existed
    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// Registry-backed session store (client id -> session)
pub struct SessionStore {
    inner: RwLock<Registry<Arc<RwLock<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::new()),
        }
    }

    /// Find or create a session for a connecting client.
    /// Returns the session and whether prior state was resumed.
    pub fn get_or_create(&self, client_id: &str, clean_session: bool) -> (Arc<RwLock<Session>>, bool) {
        let id: Arc<str> = client_id.into();

        if !clean_session {
            if let Some(session) = self.inner.read().get(client_id) {
                return (session.clone(), true);
            }
        }

        // Fresh session; overwrites any previous state for this client
        let session = Arc::new(RwLock::new(Session::new(id)));
        self.inner.write().put(client_id, session.clone());
        (session, false)
    }

    /// Get a session by client ID
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.inner.read().get(client_id).cloned()
    }

    /// Remove a session, returning it for final cleanup
    pub fn remove(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.inner.write().delete(client_id)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_skip_zero_and_inflight() {
        let mut session = Session::new("c1".into());
        assert_eq!(session.next_packet_id(), 1);
        assert_eq!(session.next_packet_id(), 2);

        session.next_packet_id = u16::MAX;
        assert_eq!(session.next_packet_id(), u16::MAX);
        // Wraps past 0
        assert_eq!(session.next_packet_id(), 1);

        session.inflight_outgoing.insert(2, Publish::default());
        assert_eq!(session.next_packet_id(), 3);
    }

    #[test]
    fn clean_session_discards_previous_state() {
        let store = SessionStore::new();
        let (s1, resumed) = store.get_or_create("c1", false);
        assert!(!resumed);
        s1.write().add_subscription("a/b".into(), QoS::AtLeastOnce);

        let (s2, resumed) = store.get_or_create("c1", false);
        assert!(resumed);
        assert!(Arc::ptr_eq(&s1, &s2));

        let (s3, resumed) = store.get_or_create("c1", true);
        assert!(!resumed);
        assert!(!Arc::ptr_eq(&s1, &s3));
        assert!(s3.read().subscriptions.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn keep_alive_zero_never_expires() {
        let mut session = Session::new("c1".into());
        session.keep_alive = 0;
        session.last_activity = Instant::now() - Duration::from_secs(3600);
        assert!(!session.is_keep_alive_expired());

        session.keep_alive = 10;
        assert!(session.is_keep_alive_expired());
        session.touch();
        assert!(!session.is_keep_alive_expired());
    }
}
