//! Session coordination: the shared document and the chat log
//!
//! Both ride the store directly and have no dependency on the peer mesh.
//!
//! The document is a single last-write-wins value: there is no merge
//! strategy, so two participants typing concurrently race and one edit can
//! be silently lost once both writes propagate. That is the documented
//! contract, not an accident.

use tokio::sync::watch;
use tracing::debug;

use crate::store::{RoomStore, Subscription};
use crate::types::{ChatEntry, Participant};

/// A live view of one shared document value.
///
/// `set` writes through to the store immediately; the local view updates
/// through the same watch path as remote edits, with no synthesized local
/// echo.
pub struct Document<T> {
    store: RoomStore,
    channel: String,
    rx: watch::Receiver<T>,
    _sub: Subscription,
}

impl<T> Document<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open a document on a channel, seeding the view with a default
    pub fn open(store: RoomStore, channel: impl Into<String>, default: T) -> Self {
        let channel = channel.into();
        let (tx, rx) = watch::channel(default);
        let sub = store.watch_value::<T, _>(&channel, move |value| {
            let _ = tx.send(value);
        });
        Self {
            store,
            channel,
            rx,
            _sub: sub,
        }
    }

    /// The current document value
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Watch the document value reactively
    pub fn watch(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }

    /// Write a new value. Fire-and-forget; last write wins.
    pub fn set(&self, value: &T) {
        self.store.set_value(&self.channel, value);
    }
}

/// A live view of one room's chat log.
///
/// The entry set is always the full current collection, ordered by send
/// time ascending (not arrival order), with the entry id as a stable
/// tiebreaker.
pub struct ChatLog {
    store: RoomStore,
    channel: String,
    local: Participant,
    rx: watch::Receiver<Vec<ChatEntry>>,
    _sub: Subscription,
}

impl ChatLog {
    /// Open the chat log on a channel for the local participant
    pub fn open(store: RoomStore, channel: impl Into<String>, local: Participant) -> Self {
        let channel = channel.into();
        let (tx, rx) = watch::channel(Vec::new());
        let sub = store.watch_collection::<ChatEntry, _>(&channel, move |snapshot| {
            let mut entries: Vec<ChatEntry> =
                snapshot.into_iter().map(|(_, entry)| entry).collect();
            entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            let _ = tx.send(entries);
        });
        Self {
            store,
            channel,
            local,
            rx,
            _sub: sub,
        }
    }

    /// The current entries, sorted by send time ascending
    pub fn entries(&self) -> Vec<ChatEntry> {
        self.rx.borrow().clone()
    }

    /// Watch the entry set reactively
    pub fn watch(&self) -> watch::Receiver<Vec<ChatEntry>> {
        self.rx.clone()
    }

    /// Append a message from the local participant.
    ///
    /// Assigns a fresh unique id and the current timestamp, then appends;
    /// entries are never mutated afterwards. Blank messages are dropped.
    pub fn send(&self, text: &str) -> Option<ChatEntry> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let entry = ChatEntry::new(&self.local, text);
        debug!(id = %entry.id, "Appending chat entry");
        self.store.append(&self.channel, &entry);
        Some(entry)
    }
}
