//! Builder patterns for test token construction
//!
//! Provides a fluent API for signed tokens with controllable claims and header.

use crate::crypto_fixtures::TestSigningKey;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, Header};
use serde_json::{json, Map, Value};

/// Issuer used by [`TestTokenBuilder`] unless overridden.
pub const TEST_ISSUER: &str = "https://idp.example";

/// Audience used by [`TestTokenBuilder`] unless overridden.
pub const TEST_AUDIENCE: &str = "svc-a";

/// Header `kid` handling.
enum KidMode {
    /// Use the signing key's kid
    FromKey,
    Override(String),
    Omit,
}

/// Builder for signed test tokens
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new()
///     .issuer(&idp.issuer())
///     .audience("svc-a")
///     .claim("realm_access", json!({"roles": ["admin"]}))
///     .expires_in(300)
///     .sign(&key);
/// ```
pub struct TestTokenBuilder {
    claims: Map<String, Value>,
    typ: Option<String>,
    kid: KidMode,
}

impl TestTokenBuilder {
    /// Create a builder with defaults: [`TEST_ISSUER`], [`TEST_AUDIENCE`],
    /// subject `test-subject`, valid for one hour, `typ` `JWT`.
    pub fn new() -> Self {
        let now = Utc::now();
        let mut claims = Map::new();
        claims.insert("iss".to_string(), json!(TEST_ISSUER));
        claims.insert("sub".to_string(), json!("test-subject"));
        claims.insert("aud".to_string(), json!([TEST_AUDIENCE]));
        claims.insert("iat".to_string(), json!(now.timestamp()));
        claims.insert(
            "exp".to_string(),
            json!((now + Duration::seconds(3600)).timestamp()),
        );

        Self {
            claims,
            typ: Some("JWT".to_string()),
            kid: KidMode::FromKey,
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        self.claim("iss", json!(issuer))
    }

    pub fn subject(self, subject: &str) -> Self {
        self.claim("sub", json!(subject))
    }

    /// Set `aud` to a single string.
    pub fn audience(self, audience: &str) -> Self {
        self.claim("aud", json!(audience))
    }

    /// Set `aud` to an array.
    pub fn audiences(self, audiences: &[&str]) -> Self {
        self.claim("aud", json!(audiences))
    }

    /// Set expiration in seconds from now (negative for already expired)
    pub fn expires_in(self, seconds: i64) -> Self {
        let exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self.claim("exp", json!(exp))
    }

    /// Set expiration to an absolute timestamp
    pub fn expires_at(self, timestamp: i64) -> Self {
        self.claim("exp", json!(timestamp))
    }

    pub fn without_expiry(self) -> Self {
        self.without_claim("exp")
    }

    /// Set the header `typ`
    pub fn typ(mut self, typ: &str) -> Self {
        self.typ = Some(typ.to_string());
        self
    }

    pub fn without_typ(mut self) -> Self {
        self.typ = None;
        self
    }

    /// Put `kid` in the header instead of the signing key's kid
    pub fn kid(mut self, kid: &str) -> Self {
        self.kid = KidMode::Override(kid.to_string());
        self
    }

    pub fn without_kid(mut self) -> Self {
        self.kid = KidMode::Omit;
        self
    }

    /// Set an arbitrary claim
    pub fn claim(mut self, name: &str, value: Value) -> Self {
        self.claims.insert(name.to_string(), value);
        self
    }

    pub fn without_claim(mut self, name: &str) -> Self {
        self.claims.remove(name);
        self
    }

    /// Claims as JSON, without signing
    pub fn build_claims(&self) -> Value {
        Value::Object(self.claims.clone())
    }

    /// Sign with `key` using EdDSA
    pub fn sign(&self, key: &TestSigningKey) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = self.typ.clone();
        header.kid = match &self.kid {
            KidMode::FromKey => key.kid().map(ToString::to_string),
            KidMode::Override(kid) => Some(kid.clone()),
            KidMode::Omit => None,
        };

        key.sign(header, &self.build_claims())
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}
