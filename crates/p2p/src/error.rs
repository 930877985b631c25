use thiserror::Error;
use weft_peers::GuardError;

/// Errors surfaced by the overlay.
///
/// Callers branch on [`P2pError::is_retryable`]: transient failures are
/// retried (usually against a different peer), everything else is surfaced.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("peer is not connected")]
    NotConnected,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("oversized field: {0} bytes exceeds {1}")]
    Oversized(usize, usize),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("network service is gone")]
    ServiceClosed,
    #[error("listen failed: {0}")]
    Listen(String),
}

impl P2pError {
    /// Transient errors are worth retrying; protocol and guard failures are
    /// not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            P2pError::DialFailed(_) | P2pError::Timeout | P2pError::NotConnected
        )
    }
}
