//! Token validation pipeline.
//!
//! Validates a compact JWS against keys from a [`KeyCache`] and the
//! configured policy.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - The type gate runs before any key lookup or network activity
//! - Unknown key ids cause at most one refresh per token
//! - An empty configured issuer never matches
//! - Tokens without `exp` are rejected

use crate::claims::{match_required_claims, ClaimError, ClaimValue};
use crate::error::ValidationError;
use crate::header::{CompactToken, UnverifiedHeader};
use crate::jwks::{KeyCache, KeyCacheError, VerificationKey};
use crate::token::ValidatedToken;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Policy applied to every token.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOptions {
    /// Required `iss`. Compared exactly; empty fails every token.
    pub issuer: String,

    /// Required member of `aud`. `None` or empty accepts any audience.
    pub required_audience: Option<String>,

    /// Required `typ` header value.
    pub required_token_type: Option<String>,

    /// Claims the token must structurally contain.
    pub required_claims: Option<Map<String, Value>>,

    /// Tolerance added to `exp`.
    pub clock_drift: Duration,
}

/// Standard claims extracted while checking policy.
#[derive(Debug, Clone, PartialEq)]
struct StandardClaims {
    issuer: String,
    audience: Vec<String>,
    expires_at: DateTime<Utc>,
}

/// Validates tokens against a key cache and a [`ValidationOptions`] policy.
pub struct TokenValidator {
    key_cache: Arc<KeyCache>,
    options: ValidationOptions,
}

impl TokenValidator {
    #[must_use]
    pub fn new(key_cache: Arc<KeyCache>, options: ValidationOptions) -> Self {
        Self { key_cache, options }
    }

    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.key_cache
    }

    #[must_use]
    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    /// Validate `token` and return its claims.
    ///
    /// # Checks, in order
    ///
    /// 1. Size and structure of the envelope
    /// 2. `typ` against the required token type
    /// 3. Key resolution, with at most one refresh for an unknown `kid`
    /// 4. Signature (one refresh and retry when key ids are disabled)
    /// 5. `exp` plus clock drift strictly after now
    /// 6. `iss` exactly equal to the configured issuer
    /// 7. `aud` containing the required audience
    /// 8. Required claims
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`ValidationError`]. Waiting on a
    /// key refresh stops with [`ValidationError::Cancelled`] once `cancel` fires.
    #[instrument(skip_all)]
    pub async fn validate(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidatedToken, ValidationError> {
        let result = self.run_pipeline(token, cancel).await;

        match &result {
            Ok(validated) => {
                tracing::debug!(
                    target: "oidc.validator",
                    kid = ?validated.header().kid,
                    "Token validated successfully"
                );
            }
            Err(e) => {
                tracing::debug!(
                    target: "oidc.validator",
                    reason = %e.reason(),
                    error = %e,
                    "Token rejected"
                );
            }
        }

        result
    }

    async fn run_pipeline(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidatedToken, ValidationError> {
        let compact = CompactToken::parse(token)?;
        let header = compact.header()?;

        self.check_token_type(&header)?;

        let key = self.resolve_key(&header, cancel).await?;
        self.verify_signature(&compact, &header, &key, cancel).await?;

        let claims = compact.claims()?;
        let standard = check_claims(&self.options, &claims, Utc::now())?;

        Ok(ValidatedToken::new(
            header,
            claims,
            standard.issuer,
            standard.audience,
            standard.expires_at,
        ))
    }

    fn check_token_type(&self, header: &UnverifiedHeader) -> Result<(), ValidationError> {
        let Some(required) = &self.options.required_token_type else {
            return Ok(());
        };
        if header.typ.as_deref() == Some(required.as_str()) {
            return Ok(());
        }
        Err(ValidationError::BadType {
            required: required.clone(),
            received: header.typ.clone(),
        })
    }

    async fn resolve_key(
        &self,
        header: &UnverifiedHeader,
        cancel: &CancellationToken,
    ) -> Result<Arc<VerificationKey>, ValidationError> {
        let kid = if self.key_cache.settings().key_id_disabled {
            None
        } else {
            // Without a kid there is nothing a refresh could find
            let Some(kid) = header.kid.as_deref() else {
                return Err(ValidationError::KeyNotFound(None));
            };
            Some(kid)
        };

        if let Some(key) = self.key_cache.lookup(kid).await {
            return Ok(key);
        }

        self.key_cache
            .refresh_and_lookup(kid, cancel)
            .await
            .map_err(ValidationError::from)
    }

    async fn verify_signature(
        &self,
        compact: &CompactToken<'_>,
        header: &UnverifiedHeader,
        key: &VerificationKey,
        cancel: &CancellationToken,
    ) -> Result<(), ValidationError> {
        if key.verify(compact.signing_input(), compact.signature(), &header.alg) {
            return Ok(());
        }

        if !self.key_cache.settings().key_id_disabled {
            return Err(ValidationError::SignatureInvalid);
        }

        // The sole key may have rotated since it was read; refresh once and retry.
        tracing::debug!(
            target: "oidc.validator",
            "Signature check failed against default key, refreshing once"
        );
        let refreshed = match self.key_cache.refresh_and_lookup(None, cancel).await {
            Ok(key) => key,
            Err(KeyCacheError::Cancelled) => return Err(ValidationError::Cancelled),
            Err(e) => {
                tracing::debug!(target: "oidc.validator", error = %e, "Refresh for signature retry failed");
                return Err(ValidationError::SignatureInvalid);
            }
        };

        if refreshed.verify(compact.signing_input(), compact.signature(), &header.alg) {
            Ok(())
        } else {
            Err(ValidationError::SignatureInvalid)
        }
    }
}

// =============================================================================
// Claim checks
// =============================================================================

/// Check expiry, issuer, audience and required claims at time `now`.
fn check_claims(
    options: &ValidationOptions,
    claims: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<StandardClaims, ValidationError> {
    let expires_at = expiry_time(claims)?;
    check_expiry(expires_at, options.clock_drift, now)?;

    let issuer = check_issuer(&options.issuer, claims)?;

    let required_audience = options
        .required_audience
        .as_deref()
        .filter(|required| !required.is_empty());
    let audience = match (audience_list(claims), required_audience) {
        (Ok(audience), _) => audience,
        (Err(err), Some(_)) => return Err(err),
        // No audience requirement; an unusable `aud` is ignored
        (Err(_), None) => Vec::new(),
    };
    if let Some(required) = required_audience {
        if !audience.iter().any(|aud| aud == required) {
            return Err(ValidationError::AudienceMismatch {
                expected: required.to_string(),
            });
        }
    }

    if let Some(required) = &options.required_claims {
        match_required_claims(required, claims)?;
    }

    Ok(StandardClaims {
        issuer,
        audience,
        expires_at,
    })
}

/// Read `exp` as an instant. Fractional seconds are kept to the nanosecond.
///
/// # Errors
///
/// Returns a claim error if `exp` is absent, not a number, or out of range.
pub fn expiry_time(claims: &Map<String, Value>) -> Result<DateTime<Utc>, ValidationError> {
    let exp = claims.get("exp").ok_or_else(|| ClaimError::Missing {
        claim: "exp".to_string(),
    })?;

    let Value::Number(number) = exp else {
        return Err(ClaimError::TypeMismatch {
            claim: "exp".to_string(),
            required: "number",
            received: ClaimValue::from(exp).kind(),
        }
        .into());
    };

    let instant = match number.as_i64() {
        Some(secs) => DateTime::from_timestamp(secs, 0),
        None => number.as_f64().and_then(timestamp_from_f64),
    };

    instant.ok_or_else(|| {
        ClaimError::ValueMismatch {
            claim: "exp".to_string(),
        }
        .into()
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn timestamp_from_f64(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value.abs() >= i64::MAX as f64 {
        return None;
    }
    let secs = value.floor();
    let nanos = ((value - secs) * 1e9).round() as u32;
    // Rounding may carry into the next second
    if nanos >= 1_000_000_000 {
        DateTime::from_timestamp(secs as i64 + 1, 0)
    } else {
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

/// Accept iff `expires_at + drift` is strictly after `now`.
///
/// # Errors
///
/// Returns [`ValidationError::Expired`] otherwise.
pub fn check_expiry(
    expires_at: DateTime<Utc>,
    drift: Duration,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    let deadline = chrono::Duration::from_std(drift)
        .ok()
        .and_then(|drift| expires_at.checked_add_signed(drift));

    match deadline {
        Some(deadline) if deadline <= now => Err(ValidationError::Expired {
            expired_at: expires_at,
        }),
        // Overflow means a deadline beyond the representable range
        _ => Ok(()),
    }
}

fn check_issuer(expected: &str, claims: &Map<String, Value>) -> Result<String, ValidationError> {
    let received = claims.get("iss").and_then(Value::as_str);
    match received {
        Some(iss) if !expected.is_empty() && iss == expected => Ok(iss.to_string()),
        _ => Err(ValidationError::IssuerMismatch {
            expected: expected.to_string(),
            received: received.map(ToString::to_string),
        }),
    }
}

/// `aud` as a list. A single string is a one-element list; absent or null is empty.
fn audience_list(claims: &Map<String, Value>) -> Result<Vec<String>, ValidationError> {
    match claims.get("aud") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(aud)) => Ok(vec![aud.clone()]),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect()),
        Some(other) => Err(ClaimError::TypeMismatch {
            claim: "aud".to_string(),
            required: "sequence",
            received: ClaimValue::from(other).kind(),
        }
        .into()),
    }
}
