//! Local replica of a room's key/value graph, shared by the relay backends
//!
//! Holds the last observed write per key plus the channel watchers to
//! notify. Backends differ only in how updates arrive (local bus vs gossip
//! topic); the reduce-to-map step and replay behavior live here.

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::KeyUpdate;
use crate::keyspace::KeyPath;

/// How an incoming update is reconciled against the stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyPolicy {
    /// Apply unconditionally: the newest arrival wins. Used for live
    /// writes, matching last-write-wins as observed per node.
    Arrival,
    /// Apply only when the key is absent or the update is strictly newer by
    /// write timestamp. Used for anti-entropy snapshot replay so a replay
    /// never regresses a newer local value.
    IfNewer,
}

struct StoredEntry {
    value: Option<serde_json::Value>,
    written_at_ms: i64,
}

struct ChannelWatcher {
    channel: String,
    tx: mpsc::UnboundedSender<KeyUpdate>,
}

/// Replica state: entries in first-observed order plus live watchers.
#[derive(Default)]
pub(crate) struct Replica {
    entries: HashMap<KeyPath, StoredEntry>,
    /// Keys in first-observed order, for deterministic replay
    order: Vec<KeyPath>,
    watchers: Vec<ChannelWatcher>,
}

impl Replica {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply an update under the given policy and notify watchers.
    ///
    /// Returns `true` if the update was stored (watchers were notified).
    pub(crate) fn apply(&mut self, update: KeyUpdate, policy: ApplyPolicy) -> bool {
        if let Some(existing) = self.entries.get(&update.key) {
            if policy == ApplyPolicy::IfNewer && update.written_at_ms <= existing.written_at_ms {
                return false;
            }
        } else {
            self.order.push(update.key.clone());
        }
        self.entries.insert(
            update.key.clone(),
            StoredEntry {
                value: update.value.clone(),
                written_at_ms: update.written_at_ms,
            },
        );
        self.notify(&update);
        true
    }

    /// Register a watcher for one channel, replaying current values first.
    pub(crate) fn subscribe(&mut self, channel: &str) -> mpsc::UnboundedReceiver<KeyUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        for update in self.channel_snapshot(channel) {
            let _ = tx.send(update);
        }
        self.watchers.push(ChannelWatcher {
            channel: channel.to_string(),
            tx,
        });
        rx
    }

    /// Current non-tombstone state of one channel, in first-observed order
    fn channel_snapshot(&self, channel: &str) -> Vec<KeyUpdate> {
        self.order
            .iter()
            .filter(|key| key.channel == channel)
            .filter_map(|key| {
                let entry = self.entries.get(key)?;
                entry.value.as_ref()?;
                Some(KeyUpdate {
                    key: key.clone(),
                    value: entry.value.clone(),
                    written_at_ms: entry.written_at_ms,
                })
            })
            .collect()
    }

    /// Full current state including tombstones, for anti-entropy snapshots
    pub(crate) fn snapshot(&self) -> Vec<KeyUpdate> {
        self.order
            .iter()
            .filter_map(|key| {
                let entry = self.entries.get(key)?;
                Some(KeyUpdate {
                    key: key.clone(),
                    value: entry.value.clone(),
                    written_at_ms: entry.written_at_ms,
                })
            })
            .collect()
    }

    fn notify(&mut self, update: &KeyUpdate) {
        self.watchers.retain(|watcher| {
            if watcher.channel != update.key.channel {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(update.clone()).is_ok()
        });
    }

    /// Drop all watchers, ending their subscriptions
    pub(crate) fn clear_watchers(&mut self) {
        self.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(channel: &str, entry: &str, value: Option<i64>, at: i64) -> KeyUpdate {
        KeyUpdate {
            key: KeyPath::entry(channel, entry),
            value: value.map(|v| serde_json::json!(v)),
            written_at_ms: at,
        }
    }

    #[test]
    fn test_arrival_policy_always_applies() {
        let mut replica = Replica::new();
        assert!(replica.apply(update("c", "k", Some(1), 100), ApplyPolicy::Arrival));
        // Older timestamp still wins on arrival order
        assert!(replica.apply(update("c", "k", Some(2), 50), ApplyPolicy::Arrival));
        let snap = replica.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].value, Some(serde_json::json!(2)));
    }

    #[test]
    fn test_if_newer_policy_rejects_stale() {
        let mut replica = Replica::new();
        replica.apply(update("c", "k", Some(1), 100), ApplyPolicy::Arrival);
        assert!(!replica.apply(update("c", "k", Some(2), 100), ApplyPolicy::IfNewer));
        assert!(!replica.apply(update("c", "k", Some(2), 50), ApplyPolicy::IfNewer));
        assert!(replica.apply(update("c", "k", Some(2), 150), ApplyPolicy::IfNewer));
    }

    #[test]
    fn test_subscribe_replays_current_channel_state() {
        let mut replica = Replica::new();
        replica.apply(update("chat", "m1", Some(1), 1), ApplyPolicy::Arrival);
        replica.apply(update("chat", "m2", Some(2), 2), ApplyPolicy::Arrival);
        replica.apply(update("other", "x", Some(9), 3), ApplyPolicy::Arrival);
        // Tombstoned entries are not replayed
        replica.apply(update("chat", "m1", None, 4), ApplyPolicy::Arrival);

        let mut rx = replica.subscribe("chat");
        let first = rx.try_recv().unwrap();
        assert_eq!(first.key, KeyPath::entry("chat", "m2"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notify_filters_by_channel() {
        let mut replica = Replica::new();
        let mut chat_rx = replica.subscribe("chat");
        let mut code_rx = replica.subscribe("code");

        replica.apply(update("chat", "m1", Some(1), 1), ApplyPolicy::Arrival);
        assert!(chat_rx.try_recv().is_ok());
        assert!(code_rx.try_recv().is_err());
    }

    #[test]
    fn test_tombstone_reaches_watchers() {
        let mut replica = Replica::new();
        replica.apply(update("chat", "m1", Some(1), 1), ApplyPolicy::Arrival);
        let mut rx = replica.subscribe("chat");
        let _ = rx.try_recv();

        replica.apply(update("chat", "m1", None, 2), ApplyPolicy::Arrival);
        let tombstone = rx.try_recv().unwrap();
        assert!(tombstone.value.is_none());
    }
}
