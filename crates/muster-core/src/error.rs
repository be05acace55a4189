//! Error taxonomy for the join handshake and the dispatch layer.
//!
//! Join errors resolve locally into an HTTP-shaped rejection — they never
//! propagate as process failures. Dispatch errors surface on the caller's
//! future; the dispatch layer itself never retries.

use thiserror::Error;

use crate::wire::status;

/// Why a join handshake was rejected.
#[derive(Debug, Error)]
pub enum JoinError {
    /// Undecryptable, oversized, or schema-invalid identity. Non-retryable.
    #[error("malformed identity: {0}")]
    Malformed(String),

    /// Peer has been removed from the fleet. Non-retryable — the peer must
    /// not hot-loop against this status.
    #[error("peer removed")]
    Forbidden,

    /// Peer record exists but is not yet activated. Non-retryable until an
    /// operator flips the record.
    #[error("peer not yet active")]
    NotActive,

    /// A live connection for this identifier already exists. Retryable after
    /// backoff — covers split-brain ghosts that have not timed out yet.
    #[error("peer already online")]
    AlreadyOnline,

    /// Handshake rate limit exceeded. Retryable.
    #[error("handshake rate limit exceeded")]
    RateLimited,

    /// Broker-side fault while building the reply.
    #[error("internal: {0}")]
    Internal(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl JoinError {
    /// The HTTP-equivalent status written in the rejection response.
    pub fn status(&self) -> u16 {
        match self {
            JoinError::Malformed(_) => status::BAD_IDENTITY,
            JoinError::Forbidden => status::FORBIDDEN,
            JoinError::NotActive => status::NOT_ACTIVE,
            JoinError::AlreadyOnline => status::ALREADY_ONLINE,
            JoinError::RateLimited => status::RATE_LIMITED,
            JoinError::Internal(_) | JoinError::Io(_) => status::INTERNAL,
        }
    }

    /// Whether the peer should back off and try again.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            JoinError::AlreadyOnline
                | JoinError::RateLimited
                | JoinError::Internal(_)
                | JoinError::Io(_)
        )
    }
}

/// Why a dispatched call failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Target identifier has no live connection in the registry.
    #[error("peer {0} offline")]
    Offline(u64),

    /// The per-call deadline expired before a response arrived.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The worker pool refused the task (queue closed or saturated).
    #[error("dispatch pool overloaded")]
    Overloaded,

    /// I/O failure on the logical stream.
    #[error("transport: {0}")]
    Transport(String),

    /// The peer's handler answered with an error status.
    #[error("remote error {status}: {detail}")]
    Remote { status: u16, detail: String },

    /// The pooled task died before delivering a result.
    #[error("dispatch task canceled")]
    Canceled,
}
