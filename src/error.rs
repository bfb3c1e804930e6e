// =============================================================================
// Error taxonomy for the Vega trading engine
// =============================================================================
//
// Every fallible boundary classifies its failures into one of these kinds so
// that callers can decide mechanically: retry, honor a delay, refresh auth,
// or surface terminally. Local recoverable kinds (Transient, RateLimited,
// AuthExpired) are handled inside the broker adapter; the rest propagate.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured reason an order intent was refused before reaching the broker,
/// or rejected by it. Surfaced via the API and the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RejectReason {
    /// Daily loss limit would be exceeded by the intent's worst case.
    ComplianceDll { remaining: f64 },
    /// Trailing maximum loss limit floor has been crossed.
    ComplianceMll,
    /// Net position size would exceed the configured cap.
    PositionCap { current: u32, requested: u32, max: u32 },
    /// A matching (symbol, action) intent was already submitted within the
    /// debounce window.
    Debounced,
    /// Trading is disabled for the remainder of the session.
    SessionDisabled,
    /// The broker refused the order for a business-rule reason.
    BrokerRejected { message: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComplianceDll { remaining } => {
                write!(f, "compliance-dll (remaining={remaining:.2})")
            }
            Self::ComplianceMll => write!(f, "compliance-mll"),
            Self::PositionCap {
                current,
                requested,
                max,
            } => write!(f, "position-cap ({current}+{requested}>{max})"),
            Self::Debounced => write!(f, "debounced"),
            Self::SessionDisabled => write!(f, "session-disabled"),
            Self::BrokerRejected { message } => write!(f, "broker-rejected:{message}"),
        }
    }
}

/// Engine-wide error classification.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level failure worth retrying with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// The broker asked us to slow down; `retry_after` is its advised delay
    /// when one was provided.
    #[error("rate-limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The session token expired mid-call. Refresh once and retry.
    #[error("auth-expired")]
    AuthExpired,

    /// Business-rule rejection. Never retried. `code` carries the broker's
    /// machine-readable code when one was present.
    #[error("broker-rejected: {message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },

    /// The requested entity does not exist. Terminal for that entity.
    #[error("not-found: {0}")]
    NotFound(String),

    /// The persistence store cannot be reached. Callers degrade to memory.
    #[error("persistence-unavailable: {0}")]
    StoreUnavailable(String),

    /// An internal invariant was violated. Fatal for the offending flow only.
    #[error("invariant-violation: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Short machine-readable kind label, used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient-network",
            Self::RateLimited { .. } => "rate-limited",
            Self::AuthExpired => "auth-expired",
            Self::Rejected { .. } => "broker-rejected",
            Self::NotFound(_) => "not-found",
            Self::StoreUnavailable(_) => "persistence-unavailable",
            Self::Invariant(_) => "invariant-violation",
        }
    }

    /// Whether the broker adapter should retry the call after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// True when the rejection carries the broker's brackets-disabled code,
    /// which triggers the entry-plus-post-fill-bracketing fallback.
    pub fn is_brackets_disabled(&self) -> bool {
        matches!(
            self,
            Self::Rejected { code: Some(c), .. } if c == "BRACKETS_DISABLED"
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
