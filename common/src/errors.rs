// Error handling framework for the connection subsystem

use thiserror::Error;

/// Raw failure produced by the client builder at the point of failure.
///
/// Every variant is populated where the failing step is known (dial, TLS,
/// auth, topology discovery), so the classifier never has to inspect
/// message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RawConnectionError {
    #[error("Host {address} is unreachable: {message}")]
    Unreachable { address: String, message: String },

    #[error("Connection to {address} was refused: {message}")]
    Refused { address: String, message: String },

    #[error("Connection timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Topology discovery failed: {0}")]
    Topology(String),

    #[error("Connection failed: {0}")]
    Other(String),
}

/// Profile provider errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Connection profile not found: {0}")]
    NotFound(String),

    #[error("Failed to persist connection profile {database_id}: {reason}")]
    Persist { database_id: String, reason: String },
}

/// Connection key derivation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Client metadata missed required properties: {0}")]
    InvalidClientMetadata(&'static str),

    #[error("Session metadata missed required properties: {0}")]
    InvalidSessionMetadata(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_error_display() {
        let err = RawConnectionError::Refused {
            address: "127.0.0.1:6379".to_string(),
            message: "os error 111".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Connection to 127.0.0.1:6379 was refused: os error 111"
        );

        let err = RawConnectionError::TimedOut { after_ms: 500 };
        assert_eq!(err.to_string(), "Connection timed out after 500 ms");
    }

    #[test]
    fn test_profile_error_display() {
        let err = ProfileError::NotFound("db-1".to_string());
        assert_eq!(err.to_string(), "Connection profile not found: db-1");
    }

    #[test]
    fn test_key_error_display() {
        let err = KeyError::InvalidSessionMetadata("session_id");
        assert!(err.to_string().contains("session_id"));
    }
}
