//! Engine error types
//!
//! One typed error covers the whole pipeline. Components C1-C7 are pure and
//! never retry; only the graph refresh, the planner, and the gas oracle talk
//! to the outside world and apply the retry policy before surfacing
//! `SourceUnavailable`.

use alloy::primitives::Address;
use thiserror::Error;

/// Errors surfaced by the opportunity engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Token passed to a quote does not belong to the pool.
    #[error("token {token} is not part of pool {pool}")]
    UnknownPair { pool: Address, token: Address },

    /// The input-side reserve is zero or missing.
    #[error("pool {pool} has an empty input reserve")]
    EmptyReserve { pool: Address },

    /// The hop cannot produce a meaningful quote (missing snapshot or
    /// reserves). The containing path is dropped without retry.
    #[error("pool {pool} is unquotable: {reason}")]
    Unquotable { pool: Address, reason: String },

    /// Path does not start and end on the same token.
    #[error("path is not cyclic")]
    NotCyclic,

    /// No probe amount produced a profitable bracket for the path.
    #[error("no profitable input amount for path")]
    NoProfitableInput,

    /// Every candidate path was eliminated by the allocation constraints.
    #[error("no path survived allocation constraints")]
    EmptyCandidateSet,

    /// Refresh produced no new data; the previous graph generation is kept.
    #[error("graph refresh produced no pools; previous generation retained")]
    RefreshStale,

    /// An external source kept failing after the retry budget was exhausted.
    #[error("source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// Precondition violation on caller-supplied input. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Opportunity is past its expiry; the caller must rediscover.
    #[error("opportunity expired")]
    OpportunityExpired,

    /// Expected profit does not clear the planning threshold.
    #[error("insufficient profit: expected {expected} <= cost {cost}")]
    InsufficientProfit { expected: String, cost: String },

    /// Opportunity confidence is below the minimum success rate.
    #[error("confidence {confidence:.3} below minimum {minimum:.3}")]
    LowConfidence { confidence: f64, minimum: f64 },

    /// Relay simulation failed or showed no extractable value.
    #[error("bundle simulation rejected: {0}")]
    SimulationRejected(String),

    /// Bundle was not included within the target window.
    #[error("execution rejected: {0}")]
    ExecutionRejected(String),

    /// Cooperative cancellation; no side effects beyond what was already
    /// transmitted.
    #[error("operation cancelled")]
    Cancelled,

    /// External I/O exceeded its hard timeout. Equivalent to cancellation.
    #[error("operation timed out")]
    Timeout,
}

impl EngineError {
    /// True for errors the C2/C8/C9 retry policy may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::SourceUnavailable { .. } | EngineError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Timeout.is_transient());
        assert!(EngineError::SourceUnavailable {
            source_name: "rpc".into(),
            reason: "connection reset".into()
        }
        .is_transient());
        assert!(!EngineError::NotCyclic.is_transient());
        assert!(!EngineError::OpportunityExpired.is_transient());
    }
}
