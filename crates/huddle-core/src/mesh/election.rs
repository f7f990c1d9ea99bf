//! Deterministic connection-initiator election
//!
//! For every pair of participants exactly one side must open the
//! connection, and both sides must reach that decision independently from
//! the two ids alone. The side with the byte-wise greater id initiates;
//! byte comparison gives a total order that is identical on every node, so
//! no coordination message is needed and no duplicate connection can race
//! for a pair.

use crate::types::ParticipantId;

/// Which side of a connection this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the outbound offer
    Initiator,
    /// Waits for and answers the inbound offer
    Responder,
}

/// Whether the local participant initiates toward the remote one.
///
/// Pure function of the two ids: `initiates(a, b) == !initiates(b, a)` for
/// any distinct ids.
pub fn initiates(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local.as_str().as_bytes() > remote.as_str().as_bytes()
}

/// The local participant's role toward a remote peer
pub fn role_for(local: &ParticipantId, remote: &ParticipantId) -> Role {
    if initiates(local, remote) {
        Role::Initiator
    } else {
        Role::Responder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_initiates() {
        let a = ParticipantId::new("a1");
        let b = ParticipantId::new("b1");
        assert_ne!(initiates(&a, &b), initiates(&b, &a));
    }

    #[test]
    fn test_greater_id_initiates() {
        let alpha = ParticipantId::new("p-alpha");
        let beta = ParticipantId::new("p-beta");
        // "p-beta" > "p-alpha" byte-wise, so beta initiates
        assert!(initiates(&beta, &alpha));
        assert!(!initiates(&alpha, &beta));
        assert_eq!(role_for(&beta, &alpha), Role::Initiator);
        assert_eq!(role_for(&alpha, &beta), Role::Responder);
    }

    #[test]
    fn test_election_is_pure() {
        let a = ParticipantId::new("xyz");
        let b = ParticipantId::new("abc");
        let first = initiates(&a, &b);
        for _ in 0..10 {
            assert_eq!(initiates(&a, &b), first);
        }
    }
}
