// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the control plane.
//!
//! Every control-plane error carries an [`ErrorCode`] (a machine-readable,
//! stable string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context.  Callers dispatch on the code, never on the
//! message text.  Use the builder returned by [`AcpError::new`] to construct
//! errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing or conflicting resources (runs, jobs, CAS objects).
    Resource,
    /// Tenant and capability checks.
    Access,
    /// Budget reservation and spend tracking.
    Budget,
    /// Queue depth and rate limits.
    Capacity,
    /// Hash mismatches and digest-path violations.
    Integrity,
    /// Event payload schema violations.
    Payload,
    /// Policy evaluation denials.
    Policy,
    /// Federation and circuit-breaker refusals.
    Delegation,
    /// Cancellation and deadline expiry.
    Lifecycle,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resource => "resource",
            Self::Access => "access",
            Self::Budget => "budget",
            Self::Capacity => "capacity",
            Self::Integrity => "integrity",
            Self::Payload => "payload",
            Self::Policy => "policy",
            Self::Delegation => "delegation",
            Self::Lifecycle => "lifecycle",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Resource --
    /// A run, session, job, or CAS object does not exist.
    NotFound,
    /// The resource already exists and cannot be created again.
    AlreadyExists,
    /// A job with the same (tenant, idempotency key) is already enqueued.
    DuplicateJob,

    // -- Access --
    /// The caller's tenant does not own the addressed resource.
    Unauthorized,
    /// The run lacks a capability required for the requested operation.
    CapabilityDenied,

    // -- Budget --
    /// A budget reservation was denied; the run is paused.
    BudgetExceeded,

    // -- Capacity --
    /// The durable queue is at its depth cap.
    QueueFull,
    /// A rate or resource limit was hit.
    ResourceExhausted,

    // -- Integrity --
    /// A stored hash does not match recomputed content.
    IntegrityError,
    /// A forbidden value (wall-clock, float) reached the digest path.
    EntropyViolation,

    // -- Payload --
    /// An event payload violates its schema.
    InvalidPayload,

    // -- Policy --
    /// One or more policy rules denied execution.
    PolicyViolation,

    // -- Delegation --
    /// The target node's circuit breaker is open.
    CircuitOpen,
    /// No delegation candidate survived the eligibility filter.
    NoEligibleCandidate,

    // -- Lifecycle --
    /// The operation was cancelled before completion.
    Cancelled,
    /// The operation exceeded its deadline.
    Timeout,

    // -- Internal --
    /// Catch-all for unexpected I/O and internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound | Self::AlreadyExists | Self::DuplicateJob => ErrorCategory::Resource,

            Self::Unauthorized | Self::CapabilityDenied => ErrorCategory::Access,

            Self::BudgetExceeded => ErrorCategory::Budget,

            Self::QueueFull | Self::ResourceExhausted => ErrorCategory::Capacity,

            Self::IntegrityError | Self::EntropyViolation => ErrorCategory::Integrity,

            Self::InvalidPayload => ErrorCategory::Payload,

            Self::PolicyViolation => ErrorCategory::Policy,

            Self::CircuitOpen | Self::NoEligibleCandidate => ErrorCategory::Delegation,

            Self::Cancelled | Self::Timeout => ErrorCategory::Lifecycle,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g. `"NOT_FOUND"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::DuplicateJob => "DUPLICATE_JOB",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::CapabilityDenied => "CAPABILITY_DENIED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::QueueFull => "QUEUE_FULL",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::IntegrityError => "INTEGRITY_ERROR",
            Self::EntropyViolation => "ENTROPY_VIOLATION",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::NoEligibleCandidate => "NO_ELIGIBLE_CANDIDATE",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status a transport façade should map this code to.
    ///
    /// The core mandates the mapping so that every façade reports the same
    /// status for the same failure.
    pub fn transport_status(&self) -> u16 {
        match self {
            Self::InvalidPayload | Self::CapabilityDenied => 400,
            Self::Unauthorized => 403,
            Self::NotFound => 404,
            Self::AlreadyExists | Self::DuplicateJob => 409,
            Self::BudgetExceeded => 402,
            Self::QueueFull | Self::ResourceExhausted => 429,
            Self::IntegrityError | Self::EntropyViolation | Self::PolicyViolation => 422,
            Self::CircuitOpen | Self::NoEligibleCandidate | Self::Internal => 503,
            Self::Cancelled => 499,
            Self::Timeout => 504,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AcpError
// ---------------------------------------------------------------------------

/// Unified control-plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use acp_error::{AcpError, ErrorCode};
///
/// let err = AcpError::new(ErrorCode::QueueFull, "queue at capacity")
///     .with_context("max_depth", 1000)
///     .with_context("tenant", "t1");
/// ```
pub struct AcpError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl AcpError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for AcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AcpError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for AcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of an [`AcpError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcpErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&AcpError> for AcpErrorDto {
    fn from(err: &AcpError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<AcpErrorDto> for AcpError {
    fn from(dto: AcpErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    /// All error codes for exhaustive iteration in tests.
    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::NotFound,
        ErrorCode::AlreadyExists,
        ErrorCode::DuplicateJob,
        ErrorCode::Unauthorized,
        ErrorCode::CapabilityDenied,
        ErrorCode::BudgetExceeded,
        ErrorCode::QueueFull,
        ErrorCode::ResourceExhausted,
        ErrorCode::IntegrityError,
        ErrorCode::EntropyViolation,
        ErrorCode::InvalidPayload,
        ErrorCode::PolicyViolation,
        ErrorCode::CircuitOpen,
        ErrorCode::NoEligibleCandidate,
        ErrorCode::Cancelled,
        ErrorCode::Timeout,
        ErrorCode::Internal,
    ];

    // -- Construction & Display -----------------------------------------

    #[test]
    fn basic_construction() {
        let err = AcpError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = AcpError::new(ErrorCode::NotFound, "run missing");
        assert_eq!(err.to_string(), "[NOT_FOUND] run missing");
    }

    #[test]
    fn display_with_context() {
        let err = AcpError::new(ErrorCode::QueueFull, "queue at capacity")
            .with_context("max_depth", 1000);
        let s = err.to_string();
        assert!(s.starts_with("[QUEUE_FULL] queue at capacity"));
        assert!(s.contains("max_depth"));
        assert!(s.contains("1000"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = AcpError::new(ErrorCode::Internal, "io failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    // -- Categorization --------------------------------------------------

    #[test]
    fn resource_codes_categorised() {
        assert_eq!(ErrorCode::NotFound.category(), ErrorCategory::Resource);
        assert_eq!(ErrorCode::AlreadyExists.category(), ErrorCategory::Resource);
        assert_eq!(ErrorCode::DuplicateJob.category(), ErrorCategory::Resource);
    }

    #[test]
    fn access_codes_categorised() {
        assert_eq!(ErrorCode::Unauthorized.category(), ErrorCategory::Access);
        assert_eq!(
            ErrorCode::CapabilityDenied.category(),
            ErrorCategory::Access
        );
    }

    #[test]
    fn integrity_codes_categorised() {
        assert_eq!(
            ErrorCode::IntegrityError.category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            ErrorCode::EntropyViolation.category(),
            ErrorCategory::Integrity
        );
    }

    #[test]
    fn delegation_codes_categorised() {
        assert_eq!(ErrorCode::CircuitOpen.category(), ErrorCategory::Delegation);
        assert_eq!(
            ErrorCode::NoEligibleCandidate.category(),
            ErrorCategory::Delegation
        );
    }

    #[test]
    fn lifecycle_codes_categorised() {
        assert_eq!(ErrorCode::Cancelled.category(), ErrorCategory::Lifecycle);
        assert_eq!(ErrorCode::Timeout.category(), ErrorCategory::Lifecycle);
    }

    // -- Transport mapping -----------------------------------------------

    #[test]
    fn transport_status_per_spec() {
        assert_eq!(ErrorCode::InvalidPayload.transport_status(), 400);
        assert_eq!(ErrorCode::CapabilityDenied.transport_status(), 400);
        assert_eq!(ErrorCode::NotFound.transport_status(), 404);
        assert_eq!(ErrorCode::DuplicateJob.transport_status(), 409);
        assert_eq!(ErrorCode::AlreadyExists.transport_status(), 409);
        assert_eq!(ErrorCode::QueueFull.transport_status(), 429);
        assert_eq!(ErrorCode::CircuitOpen.transport_status(), 503);
        assert_eq!(ErrorCode::Internal.transport_status(), 503);
    }

    #[test]
    fn every_code_has_a_transport_status() {
        for code in ALL_CODES {
            let status = code.transport_status();
            assert!(
                (400..=599).contains(&status),
                "{code:?} maps to {status}, outside the error range"
            );
        }
    }

    // -- Builder pattern -------------------------------------------------

    #[test]
    fn builder_with_context_multiple_keys() {
        let err = AcpError::new(ErrorCode::BudgetExceeded, "over budget")
            .with_context("run_id", "run-7")
            .with_context("budget_usd", 1.0)
            .with_context("requested", 1.2);
        assert_eq!(err.context.len(), 3);
        assert_eq!(err.context["run_id"], serde_json::json!("run-7"));
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = AcpError::new(ErrorCode::Unauthorized, "denied").with_source(src);
        assert!(err.source.is_some());
        let displayed = err.source.as_ref().unwrap().to_string();
        assert_eq!(displayed, "access denied");
    }

    // -- Serialization ---------------------------------------------------

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::EntropyViolation;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""ENTROPY_VIOLATION""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = AcpError::new(ErrorCode::InvalidPayload, "missing key")
            .with_context("key", "sessionId");
        let dto: AcpErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: AcpErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_to_acp_error_drops_opaque_source() {
        let dto = AcpErrorDto {
            code: ErrorCode::Timeout,
            message: "deadline".into(),
            context: BTreeMap::new(),
            source_message: Some("inner".into()),
        };
        let err: AcpError = dto.into();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(err.source.is_none());
    }

    // -- Unique string representations ------------------------------------

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn error_code_count() {
        // Ensure we don't silently drop a variant from ALL_CODES.
        assert_eq!(ALL_CODES.len(), 17);
    }

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let expected = format!(r#""{}""#, code.as_str());
            assert_eq!(json, expected, "mismatch for {code:?}");
        }
    }
}
