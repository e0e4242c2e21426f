//! Error types and response mapping.
//!
//! Strata distinguishes request-scoped errors (returned to the client as an
//! `Error` status response) from connection-fatal conditions (the connection
//! is closed without a response). Background tasks log and continue; no
//! data-path error panics the process.

use thiserror::Error;

/// Common Strata error conditions.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Operation expected a different value shape for this key.
    #[error("expected {expected} value, found {actual}")]
    ShapeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Operation other than login on an unauthenticated connection.
    #[error("authentication required")]
    Unauthenticated,

    /// Login carried an unsupported protocol version.
    #[error("unsupported protocol version: expected {expected}, got {got}")]
    ProtocolVersionMismatch { expected: u8, got: u8 },

    /// Received bytes violated the framing or field encoding.
    ///
    /// The connection is closed without a response.
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    /// Request was well-framed but semantically invalid.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Cluster peer failed the password handshake.
    #[error("peer {peer_id} handshake failed")]
    PeerHandshakeFailed { peer_id: u32 },

    /// Cluster peer send or acknowledgement failed.
    ///
    /// Treated as follower-absent for sync replication.
    #[error("peer {peer_id} unavailable: {message}")]
    TransientPeer { peer_id: u32, message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl StrataError {
    /// Create a ShapeMismatch error.
    pub fn shape_mismatch(expected: &'static str, actual: &'static str) -> Self {
        Self::ShapeMismatch { expected, actual }
    }

    /// Create a MalformedFrame error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a TransientPeer error.
    pub fn transient_peer(peer_id: u32, message: impl Into<String>) -> Self {
        Self::TransientPeer {
            peer_id,
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error terminates the connection instead of producing
    /// an `Error` response.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::MalformedFrame { .. })
    }
}

/// Result type using StrataError.
pub type StrataResult<T> = Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = StrataError::shape_mismatch("string", "list");
        assert_eq!(err.to_string(), "expected string value, found list");
    }

    #[test]
    fn test_connection_fatal() {
        assert!(StrataError::malformed("short frame").is_connection_fatal());
        assert!(!StrataError::Unauthenticated.is_connection_fatal());
        assert!(!StrataError::shape_mismatch("map", "counter").is_connection_fatal());
    }
}
