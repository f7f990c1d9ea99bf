//! Core types for Huddle

use rand::RngCore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque identifier for a room.
///
/// A room scopes all shared state: the document, the chat log, presence
/// records, and signaling traffic. Rooms have no stored attributes beyond
/// the id and no explicit lifecycle; referencing a room is enough to use it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Create a RoomId from any string-like id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room_{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier for a participant within a room session.
///
/// Generated freshly for every join and not tied to any credential. The id
/// doubles as the tiebreaker for connection-initiator election, so ordering
/// between two ids must be total and identical on every node; `Ord` on the
/// inner string compares bytes, which satisfies that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Generate a fresh random participant id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bs58::encode(&bytes).into_string())
    }

    /// Create a ParticipantId from an existing id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix of the id, used as a display label for remote streams
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A participant: a fresh random id plus a self-asserted display name.
///
/// Exists only in local memory and in presence records; there is no
/// authentication and the display name is not verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Session-unique identifier
    pub id: ParticipantId,
    /// Self-asserted display name
    pub display_name: String,
}

impl Participant {
    /// Create a participant with a fresh id.
    ///
    /// A blank display name is replaced with a generated `guest-xxxx` name.
    pub fn new(display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let display_name = if display_name.trim().is_empty() {
            Self::guest_name()
        } else {
            display_name.trim().to_string()
        };
        Self {
            id: ParticipantId::generate(),
            display_name,
        }
    }

    fn guest_name() -> String {
        let mut bytes = [0u8; 3];
        rand::rng().fill_bytes(&mut bytes);
        format!("guest-{}", bs58::encode(&bytes).into_string().to_lowercase())
    }
}

/// Liveness advertisement written under the `presence` channel.
///
/// One per participant per room, keyed by the participant id. Written once
/// on join and overwritten on rejoin; never explicitly deleted, so records
/// for departed participants linger (see the `presence` module docs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// The announcing participant's id
    pub participant_id: ParticipantId,
    /// Unix milliseconds of the most recent announcement
    pub announced_at_ms: i64,
}

impl PresenceRecord {
    /// Create a record announcing the given participant now
    pub fn announce(participant: &Participant) -> Self {
        Self {
            participant_id: participant.id.clone(),
            announced_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A single chat message, appended to the `chat` channel and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// Unique message id (ULID)
    pub id: String,
    /// Message text
    pub text: String,
    /// Sender's participant id
    pub sender_id: ParticipantId,
    /// Sender's display name at send time
    pub sender_name: String,
    /// Unix milliseconds when the message was sent
    pub sent_at_ms: i64,
}

impl ChatEntry {
    /// Create a new entry from the local participant with the current time
    pub fn new(sender: &Participant, text: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            text: text.into(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Display ordering key: send time ascending, id as a stable tiebreaker
    pub fn sort_key(&self) -> (i64, &str) {
        (self.sent_at_ms, &self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_generate_unique() {
        let a = ParticipantId::generate();
        let b = ParticipantId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_participant_id_short() {
        let id = ParticipantId::new("abcdefghij");
        assert_eq!(id.short(), "abcdefgh");
    }

    #[test]
    fn test_participant_id_ordering_is_bytewise() {
        let a = ParticipantId::new("p-alpha");
        let b = ParticipantId::new("p-beta");
        assert!(b > a);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn test_participant_blank_name_becomes_guest() {
        let p = Participant::new("   ");
        assert!(p.display_name.starts_with("guest-"));
    }

    #[test]
    fn test_participant_name_is_trimmed() {
        let p = Participant::new("  alice  ");
        assert_eq!(p.display_name, "alice");
    }

    #[test]
    fn test_presence_record_carries_participant_id() {
        let p = Participant::new("alice");
        let rec = PresenceRecord::announce(&p);
        assert_eq!(rec.participant_id, p.id);
        assert!(rec.announced_at_ms > 0);
    }

    #[test]
    fn test_chat_entry_ids_unique() {
        let p = Participant::new("alice");
        let a = ChatEntry::new(&p, "hi");
        let b = ChatEntry::new(&p, "hi");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_room_id_display() {
        let room = RoomId::new("r9");
        assert_eq!(format!("{}", room), "room_r9");
        assert_eq!(room.as_str(), "r9");
    }
}
