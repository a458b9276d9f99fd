//! Typed errors for the gateway core.
//!
//! Cancel and the two timeout kinds are deliberately distinct variants: they
//! traverse different unwind paths (a cancelled loader drains quietly, a
//! timed-out one diagnoses either a stalled upstream or a stuck consumer).

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors surfaced by the core subsystems.
#[derive(Debug, Error)]
pub enum GateError {
    /// The loader or request was aborted cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// The loader exceeded its production deadline while waiting for an
    /// in-flight fetch slot or for outstanding fetches to drain.
    #[error("item loader timed out producing data")]
    ProductionTimeout,

    /// The loader exceeded its consumption deadline while waiting for the
    /// consumer to free buffer space.
    #[error("item loader timed out waiting for the consumer")]
    ConsumptionTimeout,

    /// A PUT body's base or result MD5 did not match the computed hash.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Target path absent at the relevant revision.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request names a URL shape the gateway has no handler for.
    #[error("unsupported protocol path: {0}")]
    UnsupportedPath(String),

    /// `Depth:` header value outside the three recognized tokens.
    #[error("unsupported depth: {0}")]
    UnsupportedDepth(String),

    /// The upstream RPC returned or threw.
    #[error("upstream failure: {0}")]
    Upstream(#[from] anyhow::Error),
}

impl GateError {
    /// Numeric error code carried in the DAV error envelope.
    pub fn dialect_code(&self) -> u32 {
        match self {
            GateError::Cancelled => 200015,
            GateError::ProductionTimeout | GateError::ConsumptionTimeout => 175002,
            GateError::ChecksumMismatch { .. } => 160460,
            GateError::NotFound(_) => 160013,
            GateError::UnsupportedPath(_) => 175007,
            GateError::UnsupportedDepth(_) => 175009,
            GateError::Upstream(_) => 175002,
        }
    }

    /// True for the cooperative-cancel variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GateError::Cancelled)
    }

    /// True for either loader timeout kind.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GateError::ProductionTimeout | GateError::ConsumptionTimeout
        )
    }
}
