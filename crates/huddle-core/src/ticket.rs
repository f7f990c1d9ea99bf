//! Room tickets for bootstrapping the gossip relay
//!
//! A ticket carries everything a node needs to reach a room's gossip topic:
//! the room id plus the issuing node's addresses as bootstrap peers.
//! Tickets are encoded as `huddle-room:{base58}` strings for copy-paste
//! sharing. Only the gossip backend needs them; the in-process relay has
//! nothing to bootstrap.

use std::net::SocketAddr;

use iroh::{EndpointAddr, PublicKey, RelayUrl};
use serde::{Deserialize, Serialize};

use crate::error::RoomError;
use crate::types::RoomId;

/// Prefix for encoded ticket strings
const TICKET_PREFIX: &str = "huddle-room:";

/// Current ticket format version
const TICKET_VERSION: u8 = 1;

/// Serializable representation of a peer's network address.
///
/// A portable format carrying all information needed to connect to a peer:
/// node id, optional relay URL for NAT traversal, and direct addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddrBytes {
    /// Node's public key (32 bytes)
    pub node_id: [u8; 32],
    /// Optional relay URL for NAT traversal
    pub relay_url: Option<String>,
    /// Direct socket addresses as strings (e.g., "192.168.1.1:4433")
    pub direct_addresses: Vec<String>,
}

impl NodeAddrBytes {
    /// Create a new NodeAddrBytes with just a node ID
    pub fn new(node_id: [u8; 32]) -> Self {
        Self {
            node_id,
            relay_url: None,
            direct_addresses: Vec::new(),
        }
    }

    /// Extract the node id, relay URL, and direct addresses from an iroh
    /// EndpointAddr into this serializable form.
    pub fn from_endpoint_addr(addr: &EndpointAddr) -> Self {
        let node_id = addr.id.as_bytes().to_owned();
        let relay_url = addr.relay_urls().next().map(|url| url.to_string());
        let direct_addresses = addr.ip_addrs().map(|addr| addr.to_string()).collect();
        Self {
            node_id,
            relay_url,
            direct_addresses,
        }
    }

    /// Convert back to an iroh EndpointAddr.
    ///
    /// # Errors
    ///
    /// Returns `RoomError::InvalidTicket` if the public key bytes, relay
    /// URL, or a socket address are malformed.
    pub fn to_endpoint_addr(&self) -> Result<EndpointAddr, RoomError> {
        let public_key = PublicKey::from_bytes(&self.node_id)
            .map_err(|e| RoomError::InvalidTicket(format!("Invalid public key: {}", e)))?;

        let mut addr = EndpointAddr::new(public_key);

        if let Some(ref relay_str) = self.relay_url {
            let relay_url: RelayUrl = relay_str
                .parse()
                .map_err(|e| RoomError::InvalidTicket(format!("Invalid relay URL: {}", e)))?;
            addr = addr.with_relay_url(relay_url);
        }

        for addr_str in &self.direct_addresses {
            let socket_addr: SocketAddr = addr_str
                .parse()
                .map_err(|e| RoomError::InvalidTicket(format!("Invalid socket address: {}", e)))?;
            addr = addr.with_ip_addr(socket_addr);
        }

        Ok(addr)
    }
}

/// A shareable ticket for joining a room over the gossip relay.
///
/// # Example
///
/// ```ignore
/// let ticket = net.ticket(&room)?;
/// let encoded = ticket.encode()?;
/// // -> "huddle-room:3xK7hNp..."
///
/// // On the receiving end
/// let decoded = RoomTicket::decode(&encoded)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTicket {
    /// Ticket format version
    pub version: u8,
    /// The room this ticket grants entry to
    pub room_id: String,
    /// Bootstrap peers to connect to when joining the room's topic
    pub bootstrap: Vec<NodeAddrBytes>,
}

impl RoomTicket {
    /// Create a ticket for a room with the given bootstrap peers
    pub fn new(room: &RoomId, bootstrap: Vec<NodeAddrBytes>) -> Self {
        Self {
            version: TICKET_VERSION,
            room_id: room.as_str().to_string(),
            bootstrap,
        }
    }

    /// The room this ticket refers to
    pub fn room(&self) -> RoomId {
        RoomId::new(self.room_id.clone())
    }

    /// Encode as a `huddle-room:{base58}` string
    pub fn encode(&self) -> Result<String, RoomError> {
        let bytes = postcard::to_stdvec(self)
            .map_err(|e| RoomError::Serialization(format!("Failed to encode ticket: {}", e)))?;
        Ok(format!("{}{}", TICKET_PREFIX, bs58::encode(&bytes).into_string()))
    }

    /// Decode from a `huddle-room:{base58}` string
    pub fn decode(encoded: &str) -> Result<Self, RoomError> {
        let encoded = encoded.trim();
        let payload = encoded
            .strip_prefix(TICKET_PREFIX)
            .ok_or_else(|| RoomError::InvalidTicket("Missing huddle-room: prefix".to_string()))?;
        let bytes = bs58::decode(payload)
            .into_vec()
            .map_err(|e| RoomError::InvalidTicket(format!("Invalid base58: {}", e)))?;
        let ticket: RoomTicket = postcard::from_bytes(&bytes)
            .map_err(|e| RoomError::InvalidTicket(format!("Malformed ticket: {}", e)))?;
        if ticket.version != TICKET_VERSION {
            return Err(RoomError::InvalidTicket(format!(
                "Unsupported ticket version {}",
                ticket.version
            )));
        }
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ticket() -> RoomTicket {
        RoomTicket::new(
            &RoomId::new("r9"),
            vec![NodeAddrBytes {
                node_id: [7u8; 32],
                relay_url: Some("https://relay.example.com".to_string()),
                direct_addresses: vec!["10.0.0.1:4433".to_string()],
            }],
        )
    }

    #[test]
    fn test_ticket_roundtrip() {
        let ticket = sample_ticket();
        let encoded = ticket.encode().unwrap();
        assert!(encoded.starts_with("huddle-room:"));
        let decoded = RoomTicket::decode(&encoded).unwrap();
        assert_eq!(decoded, ticket);
        assert_eq!(decoded.room(), RoomId::new("r9"));
    }

    #[test]
    fn test_decode_rejects_missing_prefix() {
        let err = RoomTicket::decode("not-a-ticket").unwrap_err();
        assert!(matches!(err, RoomError::InvalidTicket(_)));
    }

    #[test]
    fn test_decode_rejects_garbage_payload() {
        let err = RoomTicket::decode("huddle-room:!!notbase58!!").unwrap_err();
        assert!(matches!(err, RoomError::InvalidTicket(_)));
    }

    #[test]
    fn test_decode_trims_whitespace() {
        let encoded = format!("  {}\n", sample_ticket().encode().unwrap());
        assert!(RoomTicket::decode(&encoded).is_ok());
    }

    #[test]
    fn test_node_addr_rejects_bad_socket_addr() {
        let bad = NodeAddrBytes {
            node_id: [0u8; 32],
            relay_url: None,
            direct_addresses: vec!["not-an-addr".to_string()],
        };
        // Key decode may fail first depending on bytes; either way it is
        // reported as an invalid ticket.
        assert!(bad.to_endpoint_addr().is_err());
    }
}
