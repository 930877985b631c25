use thiserror::Error;

/// Compute-layer failures, grouped by recovery class.
#[derive(Debug, Error)]
pub enum ComputeError {
    // Capacity: surfaced to the caller, not retried locally.
    #[error("job {0} already exists")]
    DuplicateJob(String),
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("invalid chunk bounds: min {min}, max {max}")]
    InvalidChunkBounds { min: usize, max: usize },
    #[error("ring buffer full")]
    RingFull,

    // Transient: retried within the job's retry budget.
    #[error("delegation failed: {0}")]
    DelegationFailed(String),
    #[error("job timed out")]
    Timeout,

    // Integrity: result discarded, worker trust decreased.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    // Sandbox outcomes.
    #[error("wasm module rejected: {0}")]
    InvalidModule(String),
    #[error("wasm trapped: {0}")]
    Trapped(String),
    #[error("gas limit exhausted")]
    GasExhausted,
    #[error("wall-clock limit exceeded")]
    DeadlineExceeded,

    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("job was cancelled")]
    Cancelled,
    #[error("result already taken")]
    ResultTaken,
}

impl ComputeError {
    /// Errors worth another attempt within the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ComputeError::DelegationFailed(_) | ComputeError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ComputeError::DelegationFailed("x".into()).is_retryable());
        assert!(!ComputeError::VerificationFailed("x".into()).is_retryable());
        assert!(!ComputeError::DuplicateJob("j".into()).is_retryable());
    }
}
