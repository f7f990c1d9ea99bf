//! Presence: best-effort liveness advertisement and peer discovery
//!
//! Presence substitutes for a central "who is in this room" directory.
//! Each participant writes a single [`PresenceRecord`] keyed by its own id
//! under the `presence` channel when it joins the mesh; every node watches
//! the channel and treats a newly seen id as a peer to connect to.
//!
//! Known limitation: there is no heartbeat, expiry, or departure broadcast.
//! A participant who leaves without cleanup lingers in the channel
//! indefinitely, and discovery of such a record produces a connection
//! attempt whose failure or close is the cleanup signal. Rejoining
//! participants carry a fresh id, so they are discovered as new peers.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::keyspace::PRESENCE_CHANNEL;
use crate::store::{RoomStore, Subscription};
use crate::types::{Participant, ParticipantId, PresenceRecord};

/// Publishes local liveness and reports newly seen peers.
///
/// Cheap to clone; clones share the same seen-set, so discovery fires at
/// most once per peer id across all of them.
#[derive(Clone)]
pub struct PresenceTracker {
    store: RoomStore,
    local: Participant,
    seen: Arc<Mutex<HashSet<ParticipantId>>>,
}

impl PresenceTracker {
    /// Create a tracker for the local participant
    pub fn new(store: RoomStore, local: Participant) -> Self {
        Self {
            store,
            local,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Write the local participant's presence record.
    ///
    /// A single write; repeated calls overwrite the record with a fresh
    /// timestamp.
    pub fn announce(&self) {
        let record = PresenceRecord::announce(&self.local);
        self.store
            .set_entry(PRESENCE_CHANNEL, self.local.id.as_str(), &record);
        debug!(participant = %self.local.id, "Announced presence");
    }

    /// Watch for newly seen peers.
    ///
    /// The callback fires once per distinct participant id, excluding the
    /// local id, no matter how often the underlying watch re-delivers the
    /// same record (relay replay). A peer forgotten via
    /// [`PresenceTracker::forget`] fires again on its next observed record.
    pub fn watch_peers<F>(&self, mut on_discovered: F) -> Subscription
    where
        F: FnMut(ParticipantId) + Send + 'static,
    {
        let local_id = self.local.id.clone();
        let seen = self.seen.clone();
        self.store
            .watch_collection::<PresenceRecord, _>(PRESENCE_CHANNEL, move |snapshot| {
                for (_, record) in snapshot {
                    let peer = record.participant_id;
                    if peer == local_id {
                        continue;
                    }
                    if seen.lock().insert(peer.clone()) {
                        debug!(%peer, "Discovered peer");
                        on_discovered(peer);
                    }
                }
            })
    }

    /// Forget a peer so its next presence record triggers discovery again.
    ///
    /// Called when a peer's connection closes: a still-present (or
    /// re-announced) record then yields a fresh connection attempt.
    pub fn forget(&self, peer: &ParticipantId) {
        self.seen.lock().remove(peer);
    }

    /// Forget every peer, starting a fresh discovery session.
    ///
    /// After a reset, replayed presence records trigger discovery again.
    pub fn reset(&self) {
        self.seen.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryHub;
    use crate::types::RoomId;
    use tokio::sync::mpsc;

    fn pair() -> (PresenceTracker, PresenceTracker) {
        let hub = MemoryHub::new();
        let room = RoomId::new("r1");
        let alice = Participant::new("alice");
        let bob = Participant::new("bob");
        (
            PresenceTracker::new(RoomStore::new(Arc::new(hub.client(&room))), alice),
            PresenceTracker::new(RoomStore::new(Arc::new(hub.client(&room))), bob),
        )
    }

    #[tokio::test]
    async fn test_peer_discovered_once_despite_reannounce() {
        let (alice, bob) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bob.watch_peers(move |peer| {
            let _ = tx.send(peer);
        });

        alice.announce();
        alice.announce();
        alice.announce();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, alice.local.id);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_participant_is_not_discovered() {
        let (alice, _bob) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<ParticipantId>();
        let _sub = alice.watch_peers(move |peer| {
            let _ = tx.send(peer);
        });

        alice.announce();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forget_allows_rediscovery() {
        let (alice, bob) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bob.watch_peers(move |peer| {
            let _ = tx.send(peer);
        });

        alice.announce();
        assert_eq!(rx.recv().await.unwrap(), alice.local.id);

        bob.forget(&alice.local.id);
        alice.announce();
        assert_eq!(rx.recv().await.unwrap(), alice.local.id);
    }
}
