//! Validation error types.
//!
//! Every rejection carries a [`RejectionReason`] with a stable string form so
//! callers can log and count rejections without matching on messages. Mapping
//! a rejection to an HTTP response is the caller's concern; all of these are
//! "unauthorized" from the client's point of view.

use crate::claims::ClaimError;
use crate::header::HeaderError;
use crate::jwks::KeyCacheError;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    BadType,
    Malformed,
    KeyNotFound,
    KeyUnavailable,
    SignatureInvalid,
    Expired,
    IssuerMismatch,
    AudienceMismatch,
    ClaimMissing,
    ClaimTypeMismatch,
    ClaimValueMismatch,
    Cancelled,
    Configuration,
}

impl RejectionReason {
    /// Stable identifier, suitable for log fields and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::BadType => "bad-type",
            RejectionReason::Malformed => "malformed",
            RejectionReason::KeyNotFound => "key-not-found",
            RejectionReason::KeyUnavailable => "key-unavailable",
            RejectionReason::SignatureInvalid => "signature-invalid",
            RejectionReason::Expired => "expired",
            RejectionReason::IssuerMismatch => "issuer-mismatch",
            RejectionReason::AudienceMismatch => "audience-mismatch",
            RejectionReason::ClaimMissing => "claim-missing",
            RejectionReason::ClaimTypeMismatch => "claim-type-mismatch",
            RejectionReason::ClaimValueMismatch => "claim-value-mismatch",
            RejectionReason::Cancelled => "cancelled",
            RejectionReason::Configuration => "configuration",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token validation error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("token type {received:?} does not match required type {required:?}")]
    BadType {
        required: String,
        received: Option<String>,
    },

    #[error(transparent)]
    Malformed(#[from] HeaderError),

    #[error("no verification key for key id {0:?}")]
    KeyNotFound(Option<String>),

    #[error("verification keys unavailable: {0}")]
    KeyUnavailable(KeyCacheError),

    #[error("token signature is invalid")]
    SignatureInvalid,

    #[error("token expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },

    #[error("token issuer {received:?} does not match {expected:?}")]
    IssuerMismatch {
        expected: String,
        received: Option<String>,
    },

    #[error("token audience does not include {expected:?}")]
    AudienceMismatch { expected: String },

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error("token validation was cancelled")]
    Cancelled,

    #[error("verifier is misconfigured: {0}")]
    Configuration(String),
}

impl ValidationError {
    /// The rejection category of this error.
    #[must_use]
    pub fn reason(&self) -> RejectionReason {
        match self {
            ValidationError::BadType { .. } => RejectionReason::BadType,
            ValidationError::Malformed(_) => RejectionReason::Malformed,
            ValidationError::KeyNotFound(_) => RejectionReason::KeyNotFound,
            ValidationError::KeyUnavailable(_) => RejectionReason::KeyUnavailable,
            ValidationError::SignatureInvalid => RejectionReason::SignatureInvalid,
            ValidationError::Expired { .. } => RejectionReason::Expired,
            ValidationError::IssuerMismatch { .. } => RejectionReason::IssuerMismatch,
            ValidationError::AudienceMismatch { .. } => RejectionReason::AudienceMismatch,
            ValidationError::Claim(ClaimError::Missing { .. }) => RejectionReason::ClaimMissing,
            ValidationError::Claim(ClaimError::TypeMismatch { .. }) => {
                RejectionReason::ClaimTypeMismatch
            }
            ValidationError::Claim(ClaimError::ValueMismatch { .. }) => {
                RejectionReason::ClaimValueMismatch
            }
            ValidationError::Cancelled => RejectionReason::Cancelled,
            ValidationError::Configuration(_) => RejectionReason::Configuration,
        }
    }
}

impl From<KeyCacheError> for ValidationError {
    fn from(err: KeyCacheError) -> Self {
        match err {
            KeyCacheError::KeyNotFound(kid) => ValidationError::KeyNotFound(kid),
            KeyCacheError::Cancelled => ValidationError::Cancelled,
            KeyCacheError::AmbiguousKeySet(_) => ValidationError::Configuration(err.to_string()),
            other => ValidationError::KeyUnavailable(other),
        }
    }
}
