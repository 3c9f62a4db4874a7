//! driftmq - Lightweight MQTT v3.1.1 message broker
//!
//! The protocol core of an MQTT broker: a wire codec for every v3.1.1
//! packet kind, a bounded-probe session registry, a per-connection
//! protocol state machine over non-blocking sockets, and a fan-out
//! engine that delivers each message at the subscriber's negotiated QoS.

pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use protocol::{Packet, QoS};
pub use registry::Registry;
pub use session::{Session, SessionStore};
pub use topic::{SubscriptionStore, TopicTrie};
