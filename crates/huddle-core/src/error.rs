//! Error types for Huddle

use thiserror::Error;

/// Main error type for Huddle operations
#[derive(Error, Debug)]
pub enum RoomError {
    /// Local media capture failed (permission denied, no device).
    /// Recoverable: the mesh is left in its pre-start state and the caller
    /// may retry.
    #[error("Media capture failed: {0}")]
    Media(String),

    /// Peer transport operation failed (connection setup, negotiation)
    #[error("Peer transport error: {0}")]
    Transport(String),

    /// Signaling relay failure
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Relay backend failure (topic subscription, broadcast)
    #[error("Relay error: {0}")]
    Relay(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid room ticket format or data
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using RoomError
pub type RoomResult<T> = Result<T, RoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RoomError::Media("permission denied".to_string());
        assert_eq!(format!("{}", err), "Media capture failed: permission denied");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RoomError = io_err.into();
        assert!(matches!(err, RoomError::Io(_)));
    }
}
