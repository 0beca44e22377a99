//! Error types for room sessions and connections

/// Result type alias using the room Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in room, signaling and connection operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Room token could not be decoded
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling channel is not live
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Server refused the credentials (fatal, never retried)
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server rejected a publish/subscribe/unpublish/unsubscribe request
    #[error("Request rejected: {0}")]
    RequestRejected(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stream cannot be used for the requested operation
    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Negotiation side effect failed; the connection moved to `failed`
    #[error("Negotiation failed during {transition}: {message}")]
    NegotiationFailed {
        /// Name of the aborted transition
        transition: String,
        /// Adapter error message
        message: String,
    },

    /// ICE connectivity failure
    #[error("ICE failure: {0}")]
    IceFailure(String),

    /// Local media acquisition was denied
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Check if this error is transient (recovered by transport reconnection)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::Disconnected(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is an authentication error
    pub fn is_authentication_error(&self) -> bool {
        matches!(self, Error::AuthenticationFailed(_) | Error::InvalidToken(_))
    }

    /// Check if this error is local to a single connection's negotiation
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::NegotiationFailed { .. } | Error::IceFailure(_) | Error::WebRtcError(_)
        )
    }

    /// Check if this error is a protocol-level rejection of a request
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::RequestRejected(_) | Error::InvalidStream(_) | Error::StreamNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::NegotiationFailed {
            transition: "process-offer".to_string(),
            message: "bad sdp".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Negotiation failed during process-offer: bad sdp"
        );
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingError("test".to_string()).is_retryable());
        assert!(Error::Disconnected("test".to_string()).is_retryable());
        assert!(!Error::AuthenticationFailed("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::AuthenticationFailed("x".to_string()).is_authentication_error());
        assert!(Error::IceFailure("x".to_string()).is_negotiation_error());
        assert!(Error::RequestRejected("x".to_string()).is_rejection());
        assert!(!Error::RequestRejected("x".to_string()).is_negotiation_error());
    }

    #[test]
    fn test_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        assert!(matches!(Error::from(io_err), Error::IoError(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::SerializationError(_)));
    }
}
