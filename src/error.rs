//! Crate-wide error taxonomy
//!
//! Every failure surfaced to a tool caller carries a machine-readable
//! `kind` slug and a human message. Absolute filesystem paths and other
//! environment details never leave this module; internal errors are
//! reduced to a correlation id before crossing the tool boundary.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type HarvestResult<T> = Result<T, HarvestError>;

/// Reason a URL was rejected by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    /// Scheme was not http or https
    Scheme,
    /// Host is on the configured blocklist
    BlockedHost,
    /// A resolved address is private, loopback, or link-local
    PrivateAddress,
    /// Host or address is a cloud metadata endpoint
    MetadataHost,
    /// Port is on the blocked list
    BlockedPort,
    /// DNS resolution failed
    ResolutionFailed,
}

impl GuardReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheme => "Scheme",
            Self::BlockedHost => "BlockedHost",
            Self::PrivateAddress => "PrivateAddress",
            Self::MetadataHost => "MetadataHost",
            Self::BlockedPort => "BlockedPort",
            Self::ResolutionFailed => "ResolutionFailed",
        }
    }
}

/// Error type shared by the extraction pipeline and every tool.
#[derive(Debug, Error)]
pub enum HarvestError {
    // ── Validation ──────────────────────────────────────────────────
    /// Argument failed validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Request carried a field the schema does not declare
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// Numeric argument outside its declared range
    #[error("{field} out of range: {message}")]
    OutOfRange { field: String, message: String },

    // ── Policy ──────────────────────────────────────────────────────
    /// URL rejected by the SSRF guard
    #[error("blocked by guard ({}): {detail}", reason.as_str())]
    BlockedByGuard { reason: GuardReason, detail: String },

    /// robots.txt disallows this URL for our user agent
    #[error("robots.txt disallows {0}")]
    RobotsDisallowed(String),

    /// Caller has no credits left for this call
    #[error("credit balance exhausted (needed {needed}, have {available})")]
    CreditExhausted { needed: u64, available: u64 },

    // ── Transport ───────────────────────────────────────────────────
    /// Operation exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// DNS lookup failed
    #[error("dns error: {0}")]
    Dns(String),

    /// TCP connect failed
    #[error("connect error: {0}")]
    Connect(String),

    /// TLS handshake or certificate failure
    #[error("tls error: {0}")]
    Tls(String),

    /// Server answered with a non-success status
    #[error("http status {0}")]
    HttpStatus(u16),

    /// Body exceeded the configured byte cap
    #[error("response exceeded {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    /// Redirect target was missing, malformed, or re-validation failed
    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),

    // ── State ───────────────────────────────────────────────────────
    /// Circuit breaker is open for this host
    #[error("circuit open for {host}, retry after {retry_after:?}")]
    CircuitOpen { host: String, retry_after: Duration },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job cancelled: {0}")]
    JobCancelled(String),

    #[error("job expired: {0}")]
    JobExpired(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Operation observed a cancellation request
    #[error("operation cancelled")]
    Cancelled,

    /// A capability (browser, search, synthesizer) is not installed
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(&'static str),

    // ── Internal ────────────────────────────────────────────────────
    /// CPU worker panicked or was reaped
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// Bounded queue rejected the item
    #[error("queue overflow: {0}")]
    QueueOverflow(&'static str),

    /// On-disk artifact failed integrity checks
    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// Anything else; the message is sanitized and tagged with a
    /// correlation id before reaching a caller
    #[error("internal error [{correlation_id}]")]
    Internal { correlation_id: String },
}

impl HarvestError {
    /// Stable machine-readable slug for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::UnknownField(_) => "UnknownField",
            Self::OutOfRange { .. } => "OutOfRange",
            Self::BlockedByGuard { .. } => "BlockedByGuard",
            Self::RobotsDisallowed(_) => "RobotsDisallowed",
            Self::CreditExhausted { .. } => "CreditExhausted",
            Self::Timeout(_) => "Timeout",
            Self::Dns(_) => "DNSError",
            Self::Connect(_) => "ConnectError",
            Self::Tls(_) => "TLSError",
            Self::HttpStatus(_) => "HTTPStatus",
            Self::ResponseTooLarge { .. } => "ResponseTooLarge",
            Self::InvalidRedirect(_) => "InvalidRedirect",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::JobNotFound(_) => "JobNotFound",
            Self::JobCancelled(_) => "JobCancelled",
            Self::JobExpired(_) => "JobExpired",
            Self::SnapshotNotFound(_) => "SnapshotNotFound",
            Self::Cancelled => "Cancelled",
            Self::CapabilityUnavailable(_) => "CapabilityUnavailable",
            Self::WorkerCrashed(_) => "WorkerCrashed",
            Self::QueueOverflow(_) => "QueueOverflow",
            Self::CorruptArtifact(_) => "CorruptArtifact",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// Whether the retry wrapper may re-attempt the operation.
    ///
    /// 429/502/503/504 are retryable; every other HTTP status, guard
    /// rejection, and size overflow is terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::Dns(_) => true,
            Self::HttpStatus(code) => matches!(code, 429 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Wrap an internal failure, logging the detail and producing a
    /// sanitized error carrying only a correlation id.
    #[must_use]
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(12)
            .collect::<String>();
        tracing::error!(correlation_id = %correlation_id, detail = %detail, "internal error");
        Self::Internal { correlation_id }
    }

    /// The guard rejection reason, if this is a guard error.
    #[must_use]
    pub fn guard_reason(&self) -> Option<GuardReason> {
        match self {
            Self::BlockedByGuard { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HarvestError {
    fn from(e: std::io::Error) -> Self {
        Self::internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("json: {e}"))
    }
}

/// Map a transport-layer `reqwest` failure onto the taxonomy.
impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(Duration::ZERO);
        }
        let msg = e.to_string();
        if e.is_connect() {
            // reqwest folds DNS failures into connect errors; keep the
            // distinction when the message makes it recoverable.
            if msg.contains("dns") || msg.contains("resolve") {
                return Self::Dns(msg);
            }
            return Self::Connect(msg);
        }
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("handshake") {
            return Self::Tls(msg);
        }
        Self::Connect(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(HarvestError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(HarvestError::Connect("refused".into()).is_retryable());
        assert!(HarvestError::HttpStatus(503).is_retryable());
        assert!(HarvestError::HttpStatus(429).is_retryable());
        assert!(!HarvestError::HttpStatus(404).is_retryable());
        assert!(!HarvestError::ResponseTooLarge { limit: 10 }.is_retryable());
        assert!(
            !HarvestError::BlockedByGuard {
                reason: GuardReason::PrivateAddress,
                detail: "10.0.0.1".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn kind_slugs_are_stable() {
        assert_eq!(HarvestError::HttpStatus(500).kind(), "HTTPStatus");
        assert_eq!(
            HarvestError::BlockedByGuard {
                reason: GuardReason::MetadataHost,
                detail: String::new()
            }
            .kind(),
            "BlockedByGuard"
        );
        assert_eq!(HarvestError::Dns(String::new()).kind(), "DNSError");
    }

    #[test]
    fn internal_error_hides_detail() {
        let err = HarvestError::internal("secret /var/db path");
        assert!(!err.to_string().contains("/var/db"));
    }
}
