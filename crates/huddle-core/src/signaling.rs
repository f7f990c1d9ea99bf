//! Signaling: relaying negotiation payloads between two named participants
//!
//! Signaling rides the shared value store. Each direction of a pair uses
//! its own compound key (`A|B` for A→B, `B|A` for B→A) under the `signals`
//! channel, so the two participants never race on a single key. The newest
//! write for a key is the current value; there is no history and no
//! sequence numbers. Delivery is at-least-once via the store's
//! replication, including replay of the current value on subscribe, so
//! consumers must be idempotent.
//!
//! Payloads are opaque blobs to this layer; their content belongs to the
//! peer transport's negotiation protocol.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::keyspace::{signal_key, SIGNALS_CHANNEL};
use crate::store::{RoomStore, Subscription};
use crate::types::ParticipantId;

/// An opaque negotiation payload as carried over the store
pub type SignalBlob = String;

/// One relayed negotiation payload, stored at key `sender|recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Emitting participant
    pub sender: ParticipantId,
    /// Addressed participant; only this participant may consume the key
    pub recipient: ParticipantId,
    /// Opaque negotiation blob, round-tripped untouched
    pub payload: SignalBlob,
}

/// Directional signal relay for the local participant.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct SignalingChannel {
    store: RoomStore,
    local: ParticipantId,
}

impl SignalingChannel {
    /// Create a signaling channel for the local participant
    pub fn new(store: RoomStore, local: ParticipantId) -> Self {
        Self { store, local }
    }

    /// Relay a payload to one recipient. Fire-and-forget.
    pub fn send(&self, recipient: &ParticipantId, payload: SignalBlob) {
        let envelope = SignalEnvelope {
            sender: self.local.clone(),
            recipient: recipient.clone(),
            payload,
        };
        let key = signal_key(&self.local, recipient);
        debug!(%key, "Relaying signal");
        self.store.set_entry(SIGNALS_CHANNEL, &key, &envelope);
    }

    /// Watch for payloads from one sender addressed to the local
    /// participant.
    ///
    /// Invoked on every write to the `sender|local` key, including the
    /// replayed current value if one exists. Envelopes whose recorded
    /// recipient is not the local participant are discarded with a warning
    /// (the directional key should make this impossible).
    pub fn watch<F>(&self, sender: &ParticipantId, mut on_signal: F) -> Subscription
    where
        F: FnMut(SignalBlob) + Send + 'static,
    {
        let key = signal_key(sender, &self.local);
        let local = self.local.clone();
        self.store
            .watch_entry::<SignalEnvelope, _>(SIGNALS_CHANNEL, &key, move |envelope| {
                if envelope.recipient != local {
                    warn!(
                        sender = %envelope.sender,
                        recipient = %envelope.recipient,
                        "Discarding misaddressed signal"
                    );
                    return;
                }
                on_signal(envelope.payload);
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryHub;
    use crate::types::RoomId;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn channels() -> (SignalingChannel, SignalingChannel) {
        let hub = MemoryHub::new();
        let room = RoomId::new("r1");
        let a = ParticipantId::new("p-alpha");
        let b = ParticipantId::new("p-beta");
        (
            SignalingChannel::new(RoomStore::new(Arc::new(hub.client(&room))), a),
            SignalingChannel::new(RoomStore::new(Arc::new(hub.client(&room))), b),
        )
    }

    #[tokio::test]
    async fn test_signal_reaches_recipient() {
        let (alpha, beta) = channels();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = beta.watch(&alpha.local, move |payload| {
            let _ = tx.send(payload);
        });

        alpha.send(&beta.local, "offer-blob".to_string());
        assert_eq!(rx.recv().await.unwrap(), "offer-blob");
    }

    #[tokio::test]
    async fn test_directions_do_not_cross() {
        let (alpha, beta) = channels();
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalBlob>();
        // Alpha listens for beta→alpha traffic only
        let _sub = alpha.watch(&beta.local, move |payload| {
            let _ = tx.send(payload);
        });

        // Alpha's own outbound write must not loop back into its watch
        alpha.send(&beta.local, "outbound".to_string());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replayed_signal_is_delivered_to_late_watcher() {
        let (alpha, beta) = channels();
        alpha.send(&beta.local, "early-offer".to_string());
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = beta.watch(&alpha.local, move |payload| {
            let _ = tx.send(payload);
        });
        assert_eq!(rx.recv().await.unwrap(), "early-offer");
    }
}
