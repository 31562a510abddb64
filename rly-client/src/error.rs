use std::fmt;

/// Errors returned by a cluster client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Could not reach any of the configured master addresses
    ConnectionFailed(String),
    /// The client was shut down; in-flight and later calls fail with this
    Shutdown,
    /// The call did not complete within the RPC timeout
    Timeout,
    /// The server is temporarily unable to serve the request
    Unavailable(String),
    /// The requested tablet is not hosted by the cluster
    TabletNotFound(String),
    /// The server rejected a write
    WriteRejected(String),
    /// Invalid client options
    InvalidOptions(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            Self::Shutdown => write!(f, "Client is shut down"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            Self::TabletNotFound(tablet) => write!(f, "Tablet not found: {}", tablet),
            Self::WriteRejected(msg) => write!(f, "Write rejected: {}", msg),
            Self::InvalidOptions(msg) => write!(f, "Invalid client options: {}", msg),
        }
    }
}

impl ClientError {
    /// Transient errors: the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout | Self::Unavailable(_) => true,
            // tablet may not have been created on the producer yet
            Self::TabletNotFound(_) => true,
            Self::Shutdown | Self::WriteRejected(_) | Self::InvalidOptions(_) => false,
        }
    }
}

impl std::error::Error for ClientError {}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::Unavailable("leader election".into()).is_retryable());
        assert!(ClientError::ConnectionFailed("refused".into()).is_retryable());
        assert!(!ClientError::Shutdown.is_retryable());
        assert!(!ClientError::WriteRejected("bad op".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ClientError::TabletNotFound("pt1".into()).to_string(),
            "Tablet not found: pt1"
        );
    }
}
