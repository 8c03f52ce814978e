use thiserror::Error;

/// Main error type for the messenger core
#[derive(Error, Debug)]
pub enum P2PError {
    // Crypto errors
    #[error("Cryptographic primitives unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    // Protocol errors
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Malformed signaling payload: {0}")]
    MalformedSignal(String),

    #[error("Attachment of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    // Session errors
    #[error("Session manager not initialized")]
    NotInitialized,

    #[error("Session manager already initialized")]
    AlreadyInitialized,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("No open data channel to peer {0}")]
    ChannelNotOpen(String),

    #[error("Invalid session state for peer {peer}: {state}")]
    InvalidState { peer: String, state: String },

    // Network errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl P2PError {
    /// Whether the caller may retry the same operation later without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, P2PError::ChannelNotOpen(_) | P2PError::Transport(_))
    }
}

/// Result type alias for messenger operations
pub type P2PResult<T> = Result<T, P2PError>;

// Conversion implementations for common error types
impl From<p256::elliptic_curve::Error> for P2PError {
    fn from(_: p256::elliptic_curve::Error) -> Self {
        P2PError::MalformedKey("invalid P-256 key material".to_string())
    }
}

impl From<webrtc::Error> for P2PError {
    fn from(err: webrtc::Error) -> Self {
        P2PError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(P2PError::ChannelNotOpen("bob".to_string()).is_transient());
        assert!(!P2PError::DecryptionFailed.is_transient());
        assert!(!P2PError::NotInitialized.is_transient());
    }

    #[test]
    fn test_decryption_error_hides_cause() {
        assert_eq!(P2PError::DecryptionFailed.to_string(), "Decryption failed");
    }
}
