//! Room key space: where shared state lives in the key/value graph
//!
//! Every piece of shared state is addressed as room → channel → optional
//! child entry. A channel either holds a single mutable value (the document)
//! or a set of child entries (chat, presence, signals). The relay backends
//! only ever see [`KeyPath`]s; the conventions for well-known channels and
//! compound signal keys live here.

use serde::{Deserialize, Serialize};

use crate::types::{ParticipantId, RoomId};

/// Channel holding the shared document value
pub const DOCUMENT_CHANNEL: &str = "code";

/// Channel holding the append-only chat log
pub const CHAT_CHANNEL: &str = "chat";

/// Channel holding per-participant presence records
pub const PRESENCE_CHANNEL: &str = "presence";

/// Channel holding directional signaling envelopes
pub const SIGNALS_CHANNEL: &str = "signals";

/// Location of one value within a room's key/value graph.
///
/// `entry == None` addresses the channel's single value; `entry == Some(id)`
/// addresses one child of the channel's collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPath {
    /// Logical channel name within the room
    pub channel: String,
    /// Child entry id, for collection channels
    pub entry: Option<String>,
}

impl KeyPath {
    /// Address a channel's single value
    pub fn value(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            entry: None,
        }
    }

    /// Address one child entry of a collection channel
    pub fn entry(channel: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            entry: Some(entry.into()),
        }
    }
}

impl std::fmt::Display for KeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entry {
            Some(entry) => write!(f, "{}/{}", self.channel, entry),
            None => write!(f, "{}", self.channel),
        }
    }
}

/// Compound key for one direction of a signaling pair.
///
/// `A|B` carries A→B traffic and `B|A` carries B→A traffic, so the two
/// participants never read or write the same key.
pub fn signal_key(sender: &ParticipantId, recipient: &ParticipantId) -> String {
    format!("{}|{}", sender.as_str(), recipient.as_str())
}

/// Derive the gossip topic for a room.
///
/// Stable across nodes: every participant of the same room must land on the
/// same topic, so this is a keyed hash of the room id alone.
pub fn room_topic(room: &RoomId) -> [u8; 32] {
    blake3::derive_key("huddle room topic v1", room.as_str().as_bytes())
}
