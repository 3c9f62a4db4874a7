//! Fan-out engine
//!
//! Resolves the subscriber set for a published topic and delivers one
//! independently built PUBLISH per subscriber. The outbound header carries
//! the subscriber's own negotiated QoS (QoS is per-subscription, not
//! per-publish), with a fresh packet identifier drawn from that
//! subscriber's session when the granted QoS is above 0.
//!
//! Delivery is at most once per subscriber per call and each subscriber's
//! send is independent: a full channel or a dead receiver is skipped
//! without touching the rest of the pass.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, trace};

use crate::protocol::{Packet, Publish, QoS};
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;

/// Fan a publish out to every matching subscriber.
/// Returns the number of subscribers the message was handed to.
pub fn fan_out(
    sessions: &SessionStore,
    subscriptions: &SubscriptionStore,
    publish: &Publish,
) -> usize {
    let matches = subscriptions.matches(&publish.topic);
    if matches.is_empty() {
        return 0;
    }

    // A client subscribed through several overlapping filters gets the
    // message once, at the highest QoS granted to it
    let mut targets: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(matches.len());
    for sub in matches {
        let granted = targets.entry(sub.client_id).or_insert(QoS::AtMostOnce);
        if sub.qos > *granted {
            *granted = sub.qos;
        }
    }

    let mut delivered = 0;

    for (client_id, granted) in targets {
        let Some(session) = sessions.get(&client_id) else {
            // Subscription outlived its session; nothing to deliver to
            continue;
        };

        let mut outgoing = publish.clone();
        outgoing.qos = granted;
        outgoing.dup = false;
        outgoing.retain = false;
        outgoing.packet_id = None;

        let sender = {
            let mut s = session.write();
            if granted != QoS::AtMostOnce {
                let packet_id = s.next_packet_id();
                outgoing.packet_id = Some(packet_id);
                s.inflight_outgoing.insert(packet_id, outgoing.clone());
            }
            s.outbound().cloned()
        };

        let Some(sender) = sender else {
            trace!("skipping {}: no socket bound", client_id);
            continue;
        };

        match sender.try_send(Packet::Publish(outgoing)) {
            Ok(()) => delivered += 1,
            Err(e) => {
                // One slow or dead subscriber must not affect the others
                debug!("dropping publish for {}: {}", client_id, e);
            }
        }
    }

    delivered
}
