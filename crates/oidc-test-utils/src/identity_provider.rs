//! Mock OpenID Connect provider for integration tests
//!
//! Serves a discovery document and a JWKS endpoint from a wiremock server,
//! supports key rotation, and counts requests per endpoint.

use crate::crypto_fixtures::{jwks_json, TestSigningKey};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
pub const JWKS_PATH: &str = "/protocol/openid-connect/certs";

/// Identity provider backed by a local wiremock server
///
/// # Example
/// ```rust,ignore
/// let key = TestSigningKey::ed25519(1, "key-1");
/// let idp = MockIdentityProvider::start(&[&key]).await;
/// let config = VerifierConfig::new(idp.issuer());
/// ```
pub struct MockIdentityProvider {
    server: MockServer,
    /// Requests seen before the last reset, which clears wiremock's journal
    jwks_requests_before_reset: AtomicUsize,
    discovery_requests_before_reset: AtomicUsize,
}

impl MockIdentityProvider {
    /// Start a provider publishing `keys`.
    pub async fn start(keys: &[&TestSigningKey]) -> Self {
        Self::start_with_jwks_delay(keys, Duration::ZERO).await
    }

    /// Start a provider whose JWKS responses are delayed by `delay`.
    pub async fn start_with_jwks_delay(keys: &[&TestSigningKey], delay: Duration) -> Self {
        let idp = Self {
            server: MockServer::start().await,
            jwks_requests_before_reset: AtomicUsize::new(0),
            discovery_requests_before_reset: AtomicUsize::new(0),
        };
        idp.mount_discovery().await;
        idp.mount_jwks(ResponseTemplate::new(200).set_body_json(jwks_json(keys)).set_delay(delay))
            .await;
        idp
    }

    /// Issuer identifier, the server's base URI.
    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn discovery_url(&self) -> String {
        format!("{}{}", self.server.uri(), DISCOVERY_PATH)
    }

    pub fn jwks_url(&self) -> String {
        format!("{}{}", self.server.uri(), JWKS_PATH)
    }

    /// Replace the published key set.
    pub async fn rotate(&self, keys: &[&TestSigningKey]) {
        self.rotate_with_delay(keys, Duration::ZERO).await;
    }

    /// Replace the published key set, delaying JWKS responses by `delay`.
    pub async fn rotate_with_delay(&self, keys: &[&TestSigningKey], delay: Duration) {
        self.reset().await;
        self.mount_discovery().await;
        self.mount_jwks(ResponseTemplate::new(200).set_body_json(jwks_json(keys)).set_delay(delay))
            .await;
    }

    /// Make the JWKS endpoint answer with `status`.
    pub async fn fail_jwks(&self, status: u16) {
        self.reset().await;
        self.mount_discovery().await;
        self.mount_jwks(ResponseTemplate::new(status)).await;
    }

    /// Serve an arbitrary JWKS body.
    pub async fn serve_jwks_body(&self, body: Value) {
        self.reset().await;
        self.mount_discovery().await;
        self.mount_jwks(ResponseTemplate::new(200).set_body_json(body)).await;
    }

    /// JWKS requests received since start.
    pub async fn jwks_request_count(&self) -> usize {
        self.jwks_requests_before_reset.load(Ordering::SeqCst) + self.count_path(JWKS_PATH).await
    }

    /// Discovery requests received since start.
    pub async fn discovery_request_count(&self) -> usize {
        self.discovery_requests_before_reset.load(Ordering::SeqCst)
            + self.count_path(DISCOVERY_PATH).await
    }

    async fn count_path(&self, wanted: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == wanted)
            .count()
    }

    async fn reset(&self) {
        let jwks = self.count_path(JWKS_PATH).await;
        let discovery = self.count_path(DISCOVERY_PATH).await;
        self.jwks_requests_before_reset
            .fetch_add(jwks, Ordering::SeqCst);
        self.discovery_requests_before_reset
            .fetch_add(discovery, Ordering::SeqCst);
        self.server.reset().await;
    }

    async fn mount_discovery(&self) {
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": self.issuer(),
                "jwks_uri": self.jwks_url(),
                "id_token_signing_alg_values_supported": ["EdDSA"]
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_jwks(&self, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }
}
