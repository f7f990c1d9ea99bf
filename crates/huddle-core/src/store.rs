//! Typed shared-state primitives over a room's relay
//!
//! [`RoomStore`] turns the relay's raw key/value updates into typed,
//! callback-driven primitives: a single watched value per channel, named
//! child entries, and append-only collections. Watches deliver at least
//! once, including an immediate replay of current state on subscribe, so
//! callbacks must be idempotent. Entries that fail to deserialize are
//! skipped with a warning, never fatal.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;
use ulid::Ulid;

use crate::keyspace::KeyPath;
use crate::relay::Relay;

/// Guard for an active watch.
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// stops callback delivery immediately.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Stop callback delivery now
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Typed client for one room's shared key/value graph.
///
/// Cheap to clone; clones share the underlying relay connection.
#[derive(Clone)]
pub struct RoomStore {
    relay: Arc<dyn Relay>,
}

impl RoomStore {
    /// Create a store over a room's relay connection
    pub fn new(relay: Arc<dyn Relay>) -> Self {
        Self { relay }
    }

    /// Watch a channel's single value.
    ///
    /// The callback is invoked with every non-null update, starting with
    /// the current value if one exists.
    pub fn watch_value<T, F>(&self, channel: &str, mut on_update: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let mut rx = self.relay.subscribe(channel);
        let channel = channel.to_string();
        let task = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if update.key.entry.is_some() {
                    continue;
                }
                let Some(value) = update.value else { continue };
                if value.is_null() {
                    continue;
                }
                match serde_json::from_value::<T>(value) {
                    Ok(typed) => on_update(typed),
                    Err(e) => warn!(%channel, error = %e, "Skipping undecodable value"),
                }
            }
        });
        Subscription::new(task)
    }

    /// Write a channel's single value. Fire-and-forget.
    pub fn set_value<T: Serialize>(&self, channel: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self.relay.put(KeyPath::value(channel), Some(json)),
            Err(e) => warn!(%channel, error = %e, "Dropping unencodable value"),
        }
    }

    /// Watch one named child entry of a channel.
    ///
    /// Used for keys owned by a known writer, like presence records and
    /// directional signal envelopes. Replays the current value on
    /// subscribe if one exists.
    pub fn watch_entry<T, F>(&self, channel: &str, entry_id: &str, mut on_update: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let mut rx = self.relay.subscribe(channel);
        let channel = channel.to_string();
        let entry_id = entry_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if update.key.entry.as_deref() != Some(entry_id.as_str()) {
                    continue;
                }
                let Some(value) = update.value else { continue };
                if value.is_null() {
                    continue;
                }
                match serde_json::from_value::<T>(value) {
                    Ok(typed) => on_update(typed),
                    Err(e) => {
                        warn!(%channel, entry = %entry_id, error = %e, "Skipping undecodable entry")
                    }
                }
            }
        });
        Subscription::new(task)
    }

    /// Write one named child entry of a channel. Fire-and-forget.
    pub fn set_entry<T: Serialize>(&self, channel: &str, entry_id: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self.relay.put(KeyPath::entry(channel, entry_id), Some(json)),
            Err(e) => warn!(%channel, entry = %entry_id, error = %e, "Dropping unencodable entry"),
        }
    }

    /// Watch a channel's collection of child entries.
    ///
    /// Maintains a local id→value map; a null update for an id removes
    /// that entry. The callback receives the full current snapshot, in
    /// insertion order of local arrival, on every change.
    pub fn watch_collection<T, F>(&self, channel: &str, mut on_snapshot: F) -> Subscription
    where
        T: DeserializeOwned + Clone + Send + 'static,
        F: FnMut(Vec<(String, T)>) + Send + 'static,
    {
        let mut rx = self.relay.subscribe(channel);
        let channel = channel.to_string();
        let task = tokio::spawn(async move {
            let mut order: Vec<String> = Vec::new();
            let mut items: HashMap<String, T> = HashMap::new();
            while let Some(update) = rx.recv().await {
                let Some(id) = update.key.entry else { continue };
                // A null or absent update for an id removes that entry
                let value = update.value.filter(|v| !v.is_null());
                match value {
                    None => {
                        if items.remove(&id).is_none() {
                            continue;
                        }
                        order.retain(|existing| existing != &id);
                    }
                    Some(value) => match serde_json::from_value::<T>(value) {
                        Ok(typed) => {
                            if items.insert(id.clone(), typed).is_none() {
                                order.push(id);
                            }
                        }
                        Err(e) => {
                            warn!(%channel, entry = %id, error = %e, "Skipping undecodable entry");
                            continue;
                        }
                    },
                }
                let snapshot: Vec<(String, T)> = order
                    .iter()
                    .filter_map(|id| items.get(id).map(|v| (id.clone(), v.clone())))
                    .collect();
                on_snapshot(snapshot);
            }
        });
        Subscription::new(task)
    }

    /// Remove one named child entry. Fire-and-forget.
    pub fn remove_entry(&self, channel: &str, entry_id: &str) {
        self.relay.put(KeyPath::entry(channel, entry_id), None);
    }

    /// Append a new child entry under a fresh unique id.
    ///
    /// Returns the generated entry id. The collection is append-only by
    /// convention: this layer offers no update or delete of existing
    /// entries.
    pub fn append<T: Serialize>(&self, channel: &str, value: &T) -> String {
        let id = Ulid::new().to_string();
        self.set_entry(channel, &id, value);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryHub;
    use crate::types::RoomId;
    use tokio::sync::mpsc;

    fn store() -> (RoomStore, RoomStore) {
        let hub = MemoryHub::new();
        let room = RoomId::new("r1");
        (
            RoomStore::new(Arc::new(hub.client(&room))),
            RoomStore::new(Arc::new(hub.client(&room))),
        )
    }

    #[tokio::test]
    async fn test_watch_value_sees_peer_writes() {
        let (a, b) = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.watch_value::<String, _>("code", move |v| {
            let _ = tx.send(v);
        });

        a.set_value("code", &"hello".to_string());
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_watch_value_replays_current() {
        let (a, b) = store();
        a.set_value("code", &"seeded".to_string());
        // Give the hub fan-out a tick before subscribing
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.watch_value::<String, _>("code", move |v| {
            let _ = tx.send(v);
        });
        assert_eq!(rx.recv().await.unwrap(), "seeded");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (a, b) = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = b.watch_value::<String, _>("code", move |v| {
            let _ = tx.send(v);
        });
        sub.unsubscribe();
        // The task may take a moment to wind down
        tokio::task::yield_now().await;

        a.set_value("code", &"after".to_string());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_collection_snapshot_grows_and_shrinks() {
        let (a, b) = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.watch_collection::<String, _>("chat", move |snapshot| {
            let _ = tx.send(snapshot);
        });

        let id1 = a.append("chat", &"one".to_string());
        let _id2 = a.append("chat", &"two".to_string());

        let mut latest = rx.recv().await.unwrap();
        while latest.len() < 2 {
            latest = rx.recv().await.unwrap();
        }
        assert_eq!(latest.len(), 2);

        // A null write removes the entry from the snapshot
        a.set_entry("chat", &id1, &serde_json::Value::Null);
        let mut latest = rx.recv().await.unwrap();
        while latest.len() > 1 {
            latest = rx.recv().await.unwrap();
        }
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].1, "two");
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_skipped() {
        let (a, b) = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.watch_collection::<u64, _>("nums", move |snapshot| {
            let _ = tx.send(snapshot);
        });

        a.set_entry("nums", "bad", &"not-a-number".to_string());
        a.set_entry("nums", "good", &7u64);

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot, vec![("good".to_string(), 7u64)]);
    }

    #[tokio::test]
    async fn test_append_returns_fresh_ids() {
        let (a, _) = store();
        let id1 = a.append("chat", &"x".to_string());
        let id2 = a.append("chat", &"y".to_string());
        assert_ne!(id1, id2);
    }
}
