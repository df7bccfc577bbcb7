//! The result of a successful validation.

use crate::header::UnverifiedHeader;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

/// A token whose signature, issuer, audience, expiry and required claims
/// have all been checked.
#[derive(Clone, PartialEq)]
pub struct ValidatedToken {
    header: UnverifiedHeader,
    claims: Map<String, Value>,
    issuer: String,
    audience: Vec<String>,
    expires_at: DateTime<Utc>,
}

/// Custom Debug implementation that redacts the subject.
impl fmt::Debug for ValidatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedToken")
            .field("issuer", &self.issuer)
            .field("subject", &self.subject().map(|_| "[REDACTED]"))
            .field("audience", &self.audience)
            .field("expires_at", &self.expires_at)
            .field("kid", &self.header.kid)
            .finish_non_exhaustive()
    }
}

impl ValidatedToken {
    pub(crate) fn new(
        header: UnverifiedHeader,
        claims: Map<String, Value>,
        issuer: String,
        audience: Vec<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            header,
            claims,
            issuer,
            audience,
            expires_at,
        }
    }

    /// Token header. Trustworthy now that the signature has been verified.
    #[must_use]
    pub fn header(&self) -> &UnverifiedHeader {
        &self.header
    }

    #[must_use]
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    #[must_use]
    pub fn into_claims(self) -> Map<String, Value> {
        self.claims
    }

    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// `sub` claim, if present and a string.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    /// `aud` claim, normalized to a list.
    #[must_use]
    pub fn audience(&self) -> &[String] {
        &self.audience
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}
