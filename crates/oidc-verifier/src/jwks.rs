//! Verification key cache backed by a remote JWKS endpoint.
//!
//! The cache owns the current key set and the protocol for refreshing it:
//!
//! - Lookups read an immutable [`KeySnapshot`] under a read lock.
//! - A miss goes through [`KeyCache::refresh_and_lookup`]. Concurrent callers
//!   share one in-flight refresh: the first caller spawns the fetch and every
//!   caller arriving while it runs awaits the same result, success or error.
//! - Fetches are spaced by a rate limiter. A caller that asks for a refresh
//!   too soon waits for its slot instead of being rejected, so a stream of
//!   tokens with unknown key ids can never fetch faster than the limiter.
//! - A successful refresh replaces the snapshot wholesale and bumps the
//!   refresh counter. A failed one leaves the previous snapshot in place.
//!
//! # Security
//!
//! - Keys declared for encryption (`use: "enc"`) are never loaded
//! - A key with a declared `alg` is only used with that algorithm
//! - With key identifiers disabled, a key set holding more than one key is a
//!   configuration error rather than a guess

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Default bound on a single key-set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default minimum spacing between key-set fetches (one per second).
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from fetching key sets and resolving keys.
///
/// `Clone` so one refresh outcome can be handed to every waiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyCacheError {
    /// Transport failure talking to the JWKS endpoint.
    #[error("failed to fetch key set: {0}")]
    Fetch(String),

    /// The JWKS endpoint answered with a non-success status.
    #[error("key set endpoint returned status {0}")]
    Status(u16),

    /// The fetch did not finish within the configured timeout.
    #[error("key set fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The response was not a JWKS document.
    #[error("invalid key set document: {0}")]
    InvalidDocument(String),

    /// Key identifiers are disabled but the key set holds several keys.
    #[error("key set contains {0} keys but key identifiers are disabled")]
    AmbiguousKeySet(usize),

    /// No key matches, even after a refresh.
    #[error("no verification key found for key id {0:?}")]
    KeyNotFound(Option<String>),

    /// The caller stopped waiting for an in-flight refresh.
    #[error("waiting for key set refresh was cancelled")]
    Cancelled,
}

// =============================================================================
// Keys
// =============================================================================

/// Key type, used to bind keys without a declared `alg` to a compatible algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
    Okp,
}

impl KeyFamily {
    fn of(params: &AlgorithmParameters) -> Self {
        match params {
            AlgorithmParameters::OctetKey(_) => KeyFamily::Hmac,
            AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
            AlgorithmParameters::EllipticCurve(_) => KeyFamily::Ec,
            AlgorithmParameters::OctetKeyPair(_) => KeyFamily::Okp,
        }
    }

    fn allows(self, alg: Algorithm) -> bool {
        match self {
            KeyFamily::Hmac => {
                matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
            }
            KeyFamily::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyFamily::Ec => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
            KeyFamily::Okp => alg == Algorithm::EdDSA,
        }
    }
}

/// Map a JWK `alg` to a signature algorithm. Encryption algorithms map to `None`.
fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// A signature verification key loaded from a JWK.
///
/// Held behind `Arc` so a validation in progress keeps its key alive across a
/// concurrent refresh.
pub struct VerificationKey {
    kid: Option<String>,
    algorithm: Option<Algorithm>,
    family: KeyFamily,
    decoding_key: DecodingKey,
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Load a verification key from a JWK.
    ///
    /// # Errors
    ///
    /// Returns [`KeyCacheError::InvalidDocument`] if the key is meant for
    /// encryption, declares a non-signature or mismatched algorithm, or its
    /// key material cannot be decoded.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyCacheError> {
        if jwk.common.public_key_use == Some(PublicKeyUse::Encryption) {
            return Err(KeyCacheError::InvalidDocument(
                "key is declared for encryption".to_string(),
            ));
        }

        let family = KeyFamily::of(&jwk.algorithm);

        let algorithm = match jwk.common.key_algorithm.as_ref() {
            Some(declared) => {
                let alg = signing_algorithm(declared).ok_or_else(|| {
                    KeyCacheError::InvalidDocument(format!(
                        "unsupported key algorithm {declared:?}"
                    ))
                })?;
                if !family.allows(alg) {
                    return Err(KeyCacheError::InvalidDocument(format!(
                        "algorithm {alg:?} does not match key type"
                    )));
                }
                Some(alg)
            }
            None => None,
        };

        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|e| KeyCacheError::InvalidDocument(format!("undecodable key: {e}")))?;

        Ok(Self {
            kid: jwk.common.key_id.clone().filter(|kid| !kid.is_empty()),
            algorithm,
            family,
            decoding_key,
        })
    }

    /// Key identifier, if the JWK carried one.
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Algorithm declared by the JWK.
    #[must_use]
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// The algorithm to verify with.
    ///
    /// The declared algorithm always wins. Without one, the token's `alg` is
    /// used only if it fits the key type.
    #[must_use]
    pub fn algorithm_for(&self, header_alg: &str) -> Option<Algorithm> {
        match self.algorithm {
            Some(alg) => Some(alg),
            None => Algorithm::from_str(header_alg)
                .ok()
                .filter(|alg| self.family.allows(*alg)),
        }
    }

    /// Verify `signature` over `signing_input`.
    ///
    /// Any failure, including an unusable algorithm or bad signature encoding,
    /// is reported as `false`.
    #[must_use]
    pub fn verify(&self, signing_input: &str, signature: &str, header_alg: &str) -> bool {
        let Some(alg) = self.algorithm_for(header_alg) else {
            tracing::debug!(
                target: "oidc.jwks",
                kid = ?self.kid,
                header_alg = %header_alg,
                "No usable algorithm for key"
            );
            return false;
        };

        match jsonwebtoken::crypto::verify(
            signature,
            signing_input.as_bytes(),
            &self.decoding_key,
            alg,
        ) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::debug!(target: "oidc.jwks", kid = ?self.kid, error = %e, "Signature verification errored");
                false
            }
        }
    }
}

/// An ordered set of verification keys.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<Arc<VerificationKey>>,
}

impl KeySet {
    /// Build a key set from already-parsed JWKs, skipping unusable ones.
    #[must_use]
    pub fn from_jwks<'a>(jwks: impl IntoIterator<Item = &'a Jwk>) -> Self {
        let keys = jwks
            .into_iter()
            .filter_map(|jwk| match VerificationKey::from_jwk(jwk) {
                Ok(key) => Some(Arc::new(key)),
                Err(e) => {
                    tracing::warn!(
                        target: "oidc.jwks",
                        kid = ?jwk.common.key_id,
                        error = %e,
                        "Skipping unusable JWK"
                    );
                    None
                }
            })
            .collect();
        Self { keys }
    }

    /// Parse a JWKS document (`{"keys": [...]}`).
    ///
    /// Each entry is parsed on its own so one unknown key type does not
    /// discard the rest of the set.
    ///
    /// # Errors
    ///
    /// Returns [`KeyCacheError::InvalidDocument`] if there is no `keys` array.
    pub fn from_document(document: &Value) -> Result<Self, KeyCacheError> {
        let entries = document
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| KeyCacheError::InvalidDocument("missing keys array".to_string()))?;

        let jwks: Vec<Jwk> = entries
            .iter()
            .filter_map(|entry| match serde_json::from_value::<Jwk>(entry.clone()) {
                Ok(jwk) => Some(jwk),
                Err(e) => {
                    tracing::warn!(target: "oidc.jwks", error = %e, "Skipping unparseable JWK");
                    None
                }
            })
            .collect();

        Ok(Self::from_jwks(&jwks))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VerificationKey>> {
        self.keys.iter()
    }

    /// First key whose identifier equals `kid`.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Arc<VerificationKey>> {
        self.keys.iter().find(|key| key.kid() == Some(kid))
    }

    /// The only key of the set, or `None` if there are zero or several.
    #[must_use]
    pub fn sole(&self) -> Option<&Arc<VerificationKey>> {
        match self.keys.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

/// The key set visible to readers, with the number of refreshes that led to it.
#[derive(Debug)]
pub struct KeySnapshot {
    keys: KeySet,
    refresh_count: u64,
}

impl KeySnapshot {
    #[must_use]
    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    /// Successful refreshes since initialization. The initial fetch is 0.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    /// Resolve a key. With key identifiers disabled `kid` is ignored and the
    /// sole key is returned.
    #[must_use]
    pub fn resolve(
        &self,
        kid: Option<&str>,
        key_id_disabled: bool,
    ) -> Option<Arc<VerificationKey>> {
        if key_id_disabled {
            return self.keys.sole().cloned();
        }
        kid.and_then(|kid| self.keys.find(kid)).cloned()
    }
}

// =============================================================================
// Fetching
// =============================================================================

/// Source of key sets.
///
/// The HTTP implementation is [`HttpKeySetFetcher`]; tests substitute
/// [`mock::MockKeySetFetcher`].
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Fetch the current key set.
    async fn fetch_key_set(&self) -> Result<KeySet, KeyCacheError>;
}

/// Fetches a JWKS document over HTTP.
pub struct HttpKeySetFetcher {
    /// URL of the JWKS endpoint.
    jwks_url: String,

    /// HTTP client for fetching JWKS.
    http_client: reqwest::Client,
}

impl HttpKeySetFetcher {
    /// Create a fetcher with its own HTTP client bounded by `timeout`.
    #[must_use]
    pub fn new(jwks_url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "oidc.jwks", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });
        Self::with_client(jwks_url, http_client)
    }

    /// Create a fetcher sharing an existing HTTP client.
    #[must_use]
    pub fn with_client(jwks_url: String, http_client: reqwest::Client) -> Self {
        Self {
            jwks_url,
            http_client,
        }
    }

    #[must_use]
    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch_key_set(&self) -> Result<KeySet, KeyCacheError> {
        tracing::debug!(target: "oidc.jwks", url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "oidc.jwks", url = %self.jwks_url, error = %e, "Failed to fetch JWKS");
                KeyCacheError::Fetch(e.to_string())
            })?;

        if !response.status().is_success() {
            tracing::error!(
                target: "oidc.jwks",
                url = %self.jwks_url,
                status = %response.status(),
                "JWKS endpoint returned error"
            );
            return Err(KeyCacheError::Status(response.status().as_u16()));
        }

        let document: Value = response.json().await.map_err(|e| {
            tracing::error!(target: "oidc.jwks", error = %e, "Failed to parse JWKS response");
            KeyCacheError::InvalidDocument(e.to_string())
        })?;

        KeySet::from_document(&document)
    }
}

async fn fetch_with_timeout(
    fetcher: &dyn KeySetFetcher,
    timeout: Duration,
) -> Result<KeySet, KeyCacheError> {
    tokio::time::timeout(timeout, fetcher.fetch_key_set())
        .await
        .map_err(|_| {
            tracing::warn!(target: "oidc.jwks", timeout = ?timeout, "JWKS fetch timed out");
            KeyCacheError::Timeout(timeout)
        })?
}

fn check_unambiguous(keys: &KeySet, key_id_disabled: bool) -> Result<(), KeyCacheError> {
    if key_id_disabled && keys.len() > 1 {
        tracing::error!(
            target: "oidc.jwks",
            key_count = keys.len(),
            "Key identifiers are disabled but the key set holds several keys"
        );
        return Err(KeyCacheError::AmbiguousKeySet(keys.len()));
    }
    Ok(())
}

// =============================================================================
// Cache
// =============================================================================

/// Cache behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCacheSettings {
    /// Bound on each fetch.
    pub fetch_timeout: Duration,

    /// Minimum spacing between refresh fetches. Zero disables limiting.
    pub min_refresh_interval: Duration,

    /// Ignore `kid` and use the key set's only key.
    pub key_id_disabled: bool,
}

impl Default for KeyCacheSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            key_id_disabled: false,
        }
    }
}

type RefreshOutcome = Result<Arc<KeySnapshot>, KeyCacheError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct CacheInner {
    fetcher: Arc<dyn KeySetFetcher>,
    settings: KeyCacheSettings,
    snapshot: RwLock<Arc<KeySnapshot>>,
    /// The refresh currently in flight, if any.
    in_flight: Mutex<Option<SharedRefresh>>,
    limiter: Option<DefaultDirectRateLimiter>,
}

/// Thread-safe cache of verification keys with single-flight refresh.
pub struct KeyCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl KeyCache {
    /// Fetch the key set at `jwks_url` once and build a cache around it.
    ///
    /// # Errors
    ///
    /// Returns the fetch error if the initial fetch fails, or
    /// [`KeyCacheError::AmbiguousKeySet`] if key identifiers are disabled and
    /// the set holds more than one key.
    #[instrument(skip_all, fields(jwks_url = %jwks_url))]
    pub async fn initialize(
        jwks_url: &str,
        settings: KeyCacheSettings,
    ) -> Result<Self, KeyCacheError> {
        let fetcher = HttpKeySetFetcher::new(jwks_url.to_string(), settings.fetch_timeout);
        Self::initialize_with_fetcher(Arc::new(fetcher), settings).await
    }

    /// Like [`KeyCache::initialize`] with a caller-supplied fetcher.
    ///
    /// # Errors
    ///
    /// See [`KeyCache::initialize`].
    #[instrument(skip_all)]
    pub async fn initialize_with_fetcher(
        fetcher: Arc<dyn KeySetFetcher>,
        settings: KeyCacheSettings,
    ) -> Result<Self, KeyCacheError> {
        let keys = fetch_with_timeout(fetcher.as_ref(), settings.fetch_timeout).await?;
        check_unambiguous(&keys, settings.key_id_disabled)?;

        tracing::info!(
            target: "oidc.jwks",
            key_count = keys.len(),
            key_id_disabled = settings.key_id_disabled,
            "Key cache initialized"
        );

        let limiter = Quota::with_period(settings.min_refresh_interval).map(RateLimiter::direct);

        Ok(Self {
            inner: Arc::new(CacheInner {
                fetcher,
                settings,
                snapshot: RwLock::new(Arc::new(KeySnapshot {
                    keys,
                    refresh_count: 0,
                })),
                in_flight: Mutex::new(None),
                limiter,
            }),
        })
    }

    #[must_use]
    pub fn settings(&self) -> KeyCacheSettings {
        self.inner.settings
    }

    /// The current snapshot. It never changes once returned.
    pub async fn snapshot(&self) -> Arc<KeySnapshot> {
        Arc::clone(&*self.inner.snapshot.read().await)
    }

    /// Number of successful refreshes so far.
    pub async fn refresh_count(&self) -> u64 {
        self.inner.snapshot.read().await.refresh_count
    }

    /// Resolve a key from the current snapshot without fetching.
    ///
    /// With key identifiers disabled `kid` is ignored and the sole key is
    /// returned; `None` then means the set is empty.
    pub async fn lookup(&self, kid: Option<&str>) -> Option<Arc<VerificationKey>> {
        let snapshot = self.snapshot().await;
        let key = snapshot.resolve(kid, self.inner.settings.key_id_disabled);
        if key.is_some() {
            tracing::trace!(target: "oidc.jwks", kid = ?kid, "Key cache hit");
        } else {
            tracing::debug!(target: "oidc.jwks", kid = ?kid, "Key cache miss");
        }
        key
    }

    /// Refresh the key set (or join the refresh already in flight), then
    /// resolve `kid` against the result.
    ///
    /// Performs at most one refresh per call. Waiting is abandoned as soon as
    /// `cancel` fires; the fetch itself keeps running for other waiters.
    ///
    /// # Errors
    ///
    /// - the refresh error shared by every waiter of a failed refresh
    /// - [`KeyCacheError::KeyNotFound`] if the refreshed set has no match
    /// - [`KeyCacheError::Cancelled`] if `cancel` fired first
    #[instrument(skip_all, fields(kid = ?kid))]
    pub async fn refresh_and_lookup(
        &self,
        kid: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Arc<VerificationKey>, KeyCacheError> {
        let refresh = self.join_or_start_refresh();

        let snapshot = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(target: "oidc.jwks", "Stopped waiting for key set refresh");
                return Err(KeyCacheError::Cancelled);
            }
            outcome = refresh => outcome?,
        };

        snapshot
            .resolve(kid, self.inner.settings.key_id_disabled)
            .ok_or_else(|| {
                tracing::debug!(
                    target: "oidc.jwks",
                    kid = ?kid,
                    refresh_count = snapshot.refresh_count,
                    "Key not found in JWKS after refresh"
                );
                KeyCacheError::KeyNotFound(kid.map(ToString::to_string))
            })
    }

    fn join_or_start_refresh(&self) -> SharedRefresh {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(refresh) = slot.as_ref() {
            tracing::debug!(target: "oidc.jwks", "Joining in-flight key set refresh");
            return refresh.clone();
        }

        // The slot lock is held until the shared handle is stored, so the
        // task cannot clear the slot before it has been filled.
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run_refresh().await });
        let refresh = async move {
            task.await.unwrap_or_else(|e| {
                Err(KeyCacheError::Fetch(format!("refresh task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        *slot = Some(refresh.clone());
        refresh
    }
}

impl CacheInner {
    async fn run_refresh(&self) -> RefreshOutcome {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let outcome = self.fetch_and_swap().await;

        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        outcome
    }

    async fn fetch_and_swap(&self) -> RefreshOutcome {
        let fetched = fetch_with_timeout(self.fetcher.as_ref(), self.settings.fetch_timeout)
            .await
            .and_then(|keys| {
                check_unambiguous(&keys, self.settings.key_id_disabled)?;
                Ok(keys)
            });

        let keys = match fetched {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(target: "oidc.jwks", error = %e, "Key set refresh failed, keeping previous keys");
                return Err(e);
            }
        };

        let mut current = self.snapshot.write().await;
        let next = Arc::new(KeySnapshot {
            keys,
            refresh_count: current.refresh_count + 1,
        });
        *current = Arc::clone(&next);

        tracing::info!(
            target: "oidc.jwks",
            key_count = next.keys.len(),
            refresh_count = next.refresh_count,
            "JWKS cache refreshed"
        );

        Ok(next)
    }
}

/// In-memory fetcher for tests.
pub mod mock {
    use super::{async_trait, Duration, KeyCacheError, KeySet, KeySetFetcher, Mutex, PoisonError};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher that replays queued responses. The last response repeats.
    pub struct MockKeySetFetcher {
        responses: Mutex<VecDeque<Result<KeySet, KeyCacheError>>>,
        call_count: AtomicUsize,
        delay: Duration,
    }

    impl MockKeySetFetcher {
        /// Create a fetcher that always returns `keys`.
        #[must_use]
        pub fn new(keys: KeySet) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from([Ok(keys)])),
                call_count: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        /// Delay every fetch by `delay`.
        #[must_use]
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Queue the response for the next fetch after the current ones.
        #[must_use]
        pub fn then(self, response: Result<KeySet, KeyCacheError>) -> Self {
            self.push_response(response);
            self
        }

        /// Queue a response while the fetcher is in use.
        pub fn push_response(&self, response: Result<KeySet, KeyCacheError>) {
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(response);
        }

        /// Number of fetches performed.
        #[must_use]
        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySetFetcher for MockKeySetFetcher {
        async fn fetch_key_set(&self) -> Result<KeySet, KeyCacheError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
            if responses.len() > 1 {
                if let Some(next) = responses.pop_front() {
                    return next;
                }
            }
            responses
                .front()
                .cloned()
                .unwrap_or_else(|| Err(KeyCacheError::Fetch("no mock response queued".to_string())))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::mock::MockKeySetFetcher;
    use super::*;
    use oidc_test_utils::{MockIdentityProvider, TestSigningKey};
    use std::time::Instant;

    fn key_set(keys: &[&TestSigningKey]) -> KeySet {
        let jwks: Vec<Jwk> = keys.iter().map(|key| key.jwk()).collect();
        KeySet::from_jwks(&jwks)
    }

    fn fast_settings() -> KeyCacheSettings {
        KeyCacheSettings {
            fetch_timeout: Duration::from_secs(2),
            min_refresh_interval: Duration::from_millis(10),
            key_id_disabled: false,
        }
    }

    async fn cache_with(fetcher: Arc<MockKeySetFetcher>, settings: KeyCacheSettings) -> KeyCache {
        KeyCache::initialize_with_fetcher(fetcher, settings)
            .await
            .expect("cache should initialize")
    }

    // =========================================================================
    // Key set parsing
    // =========================================================================

    #[test]
    fn test_key_set_from_document() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let k2 = TestSigningKey::ed25519(2, "key-2");
        let document = serde_json::json!({ "keys": [k1.jwk_json(), k2.jwk_json()] });

        let keys = KeySet::from_document(&document).unwrap();

        assert_eq!(keys.len(), 2);
        assert_eq!(keys.find("key-2").unwrap().kid(), Some("key-2"));
        assert!(keys.find("key-3").is_none());
        assert!(keys.sole().is_none());
    }

    #[test]
    fn test_key_set_skips_unusable_entries() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let mut encryption = TestSigningKey::ed25519(2, "enc-key").jwk_json();
        encryption["use"] = serde_json::json!("enc");
        let document = serde_json::json!({
            "keys": [
                k1.jwk_json(),
                encryption,
                { "kty": "unknown", "kid": "weird" },
                { "kty": "OKP", "crv": "Ed25519", "x": "AAAA", "alg": "RS256", "kid": "mismatched" }
            ]
        });

        let keys = KeySet::from_document(&document).unwrap();

        assert_eq!(keys.len(), 1);
        assert_eq!(keys.sole().unwrap().kid(), Some("key-1"));
    }

    #[test]
    fn test_key_set_document_without_keys_array() {
        let result = KeySet::from_document(&serde_json::json!({ "not_keys": [] }));
        assert!(matches!(result, Err(KeyCacheError::InvalidDocument(_))));
    }

    #[test]
    fn test_algorithm_binding() {
        let declared = TestSigningKey::ed25519(1, "declared");
        let key = VerificationKey::from_jwk(&declared.jwk()).unwrap();
        assert_eq!(key.algorithm(), Some(Algorithm::EdDSA));
        assert_eq!(key.algorithm_for("RS256"), Some(Algorithm::EdDSA));

        let mut undeclared = declared.jwk_json();
        undeclared.as_object_mut().unwrap().remove("alg");
        let jwk: Jwk = serde_json::from_value(undeclared).unwrap();
        let key = VerificationKey::from_jwk(&jwk).unwrap();
        assert_eq!(key.algorithm(), None);
        assert_eq!(key.algorithm_for("EdDSA"), Some(Algorithm::EdDSA));
        assert_eq!(key.algorithm_for("HS256"), None);
        assert_eq!(key.algorithm_for("none"), None);
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    #[tokio::test]
    async fn test_initialize_rejects_ambiguous_key_set_when_kid_disabled() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let k2 = TestSigningKey::ed25519(2, "key-2");
        let fetcher = Arc::new(MockKeySetFetcher::new(key_set(&[&k1, &k2])));

        let settings = KeyCacheSettings {
            key_id_disabled: true,
            ..fast_settings()
        };
        let result = KeyCache::initialize_with_fetcher(fetcher, settings).await;

        assert_eq!(result.unwrap_err(), KeyCacheError::AmbiguousKeySet(2));
    }

    #[tokio::test]
    async fn test_initialize_propagates_fetch_failure() {
        let fetcher = Arc::new(
            MockKeySetFetcher::new(KeySet::default()).then(Err(KeyCacheError::Status(503))),
        );
        // First queued response is the empty set; drop it so the failure is first
        let _ = fetcher.fetch_key_set().await;

        let result = KeyCache::initialize_with_fetcher(fetcher, fast_settings()).await;
        assert_eq!(result.unwrap_err(), KeyCacheError::Status(503));
    }

    #[tokio::test]
    async fn test_initialize_times_out() {
        let fetcher = Arc::new(
            MockKeySetFetcher::new(KeySet::default()).with_delay(Duration::from_millis(500)),
        );
        let settings = KeyCacheSettings {
            fetch_timeout: Duration::from_millis(50),
            ..fast_settings()
        };

        let result = KeyCache::initialize_with_fetcher(fetcher, settings).await;
        assert_eq!(
            result.unwrap_err(),
            KeyCacheError::Timeout(Duration::from_millis(50))
        );
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    #[tokio::test]
    async fn test_lookup_is_idempotent() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let cache = cache_with(
            Arc::new(MockKeySetFetcher::new(key_set(&[&k1]))),
            fast_settings(),
        )
        .await;

        let first = cache.lookup(Some("key-1")).await.unwrap();
        let second = cache.lookup(Some("key-1")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.lookup(Some("other")).await.is_none());
        assert!(cache.lookup(None).await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_with_kid_disabled_returns_sole_key() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let settings = KeyCacheSettings {
            key_id_disabled: true,
            ..fast_settings()
        };
        let cache = cache_with(Arc::new(MockKeySetFetcher::new(key_set(&[&k1]))), settings).await;

        let by_wrong_kid = cache.lookup(Some("anything")).await.unwrap();
        let without_kid = cache.lookup(None).await.unwrap();
        assert!(Arc::ptr_eq(&by_wrong_kid, &without_kid));
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    #[tokio::test]
    async fn test_refresh_picks_up_rotated_key() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let k2 = TestSigningKey::ed25519(2, "key-2");
        let fetcher = Arc::new(MockKeySetFetcher::new(key_set(&[&k1])).then(Ok(key_set(&[&k2]))));
        let cache = cache_with(Arc::clone(&fetcher), fast_settings()).await;
        let cancel = CancellationToken::new();

        let key = cache.refresh_and_lookup(Some("key-2"), &cancel).await.unwrap();

        assert_eq!(key.kid(), Some("key-2"));
        assert_eq!(cache.refresh_count().await, 1);
        assert!(cache.lookup(Some("key-1")).await.is_none());
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_miss_returns_key_not_found_after_one_fetch() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let fetcher = Arc::new(MockKeySetFetcher::new(key_set(&[&k1])));
        let cache = cache_with(Arc::clone(&fetcher), fast_settings()).await;

        let result = cache
            .refresh_and_lookup(Some("never-valid"), &CancellationToken::new())
            .await;

        assert_eq!(
            result.unwrap_err(),
            KeyCacheError::KeyNotFound(Some("never-valid".to_string()))
        );
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let fetcher = Arc::new(
            MockKeySetFetcher::new(key_set(&[&k1])).then(Err(KeyCacheError::Status(500))),
        );
        let cache = cache_with(Arc::clone(&fetcher), fast_settings()).await;

        let result = cache
            .refresh_and_lookup(Some("key-2"), &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap_err(), KeyCacheError::Status(500));
        assert_eq!(cache.refresh_count().await, 0);
        assert!(cache.lookup(Some("key-1")).await.is_some());
    }

    #[tokio::test]
    async fn test_refresh_to_ambiguous_set_is_rejected_when_kid_disabled() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let k2 = TestSigningKey::ed25519(2, "key-2");
        let fetcher = Arc::new(
            MockKeySetFetcher::new(key_set(&[&k1])).then(Ok(key_set(&[&k1, &k2]))),
        );
        let settings = KeyCacheSettings {
            key_id_disabled: true,
            ..fast_settings()
        };
        let cache = cache_with(fetcher, settings).await;

        let result = cache.refresh_and_lookup(None, &CancellationToken::new()).await;

        assert_eq!(result.unwrap_err(), KeyCacheError::AmbiguousKeySet(2));
        let still_k1 = cache.lookup(None).await.unwrap();
        assert_eq!(still_k1.kid(), Some("key-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let k2 = TestSigningKey::ed25519(2, "key-2");
        let fetcher = Arc::new(
            MockKeySetFetcher::new(key_set(&[&k1]))
                .then(Ok(key_set(&[&k1, &k2])))
                .with_delay(Duration::from_millis(200)),
        );
        let cache = Arc::new(cache_with(Arc::clone(&fetcher), fast_settings()).await);
        assert_eq!(fetcher.call_count(), 1);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .refresh_and_lookup(Some("key-2"), &CancellationToken::new())
                    .await
            }));
        }

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(fetcher.call_count(), 2, "exactly one refresh fetch");
        assert_eq!(cache.refresh_count().await, 1);
        let first = keys.first().unwrap();
        assert!(keys.iter().all(|key| Arc::ptr_eq(key, first)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_waiters_share_refresh_error() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let fetcher = Arc::new(
            MockKeySetFetcher::new(key_set(&[&k1]))
                .then(Err(KeyCacheError::Status(502)))
                .with_delay(Duration::from_millis(200)),
        );
        let cache = Arc::new(cache_with(Arc::clone(&fetcher), fast_settings()).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .refresh_and_lookup(Some("key-2"), &CancellationToken::new())
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap_err(), KeyCacheError::Status(502));
        }
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_returns_promptly() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let k2 = TestSigningKey::ed25519(2, "key-2");
        let fetcher = Arc::new(
            MockKeySetFetcher::new(key_set(&[&k1]))
                .then(Ok(key_set(&[&k2])))
                .with_delay(Duration::from_millis(300)),
        );
        // Initial fetch also pays the delay
        let cache = cache_with(Arc::clone(&fetcher), fast_settings()).await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = cache.refresh_and_lookup(Some("key-2"), &cancel).await;

        assert_eq!(result.unwrap_err(), KeyCacheError::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(250));

        // The fetch keeps running for everyone else
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.refresh_count().await, 1);
        assert!(cache.lookup(Some("key-2")).await.is_some());
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_sequential_refreshes() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let fetcher = Arc::new(MockKeySetFetcher::new(key_set(&[&k1])));
        let settings = KeyCacheSettings {
            min_refresh_interval: Duration::from_millis(200),
            ..fast_settings()
        };
        let cache = cache_with(Arc::clone(&fetcher), settings).await;
        let cancel = CancellationToken::new();

        let started = Instant::now();
        for _ in 0..3 {
            let _ = cache.refresh_and_lookup(Some("unknown"), &cancel).await;
        }

        // First refresh is immediate, the next two wait for the limiter
        assert!(started.elapsed() >= Duration::from_millis(350));
        assert_eq!(fetcher.call_count(), 4);
        assert_eq!(cache.refresh_count().await, 3);
    }

    // =========================================================================
    // HTTP fetcher
    // =========================================================================

    #[tokio::test]
    async fn test_initialize_from_http_endpoint_and_refresh() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let k2 = TestSigningKey::ed25519(2, "key-2");
        let idp = MockIdentityProvider::start(&[&k1]).await;

        let cache = KeyCache::initialize(&idp.jwks_url(), fast_settings())
            .await
            .expect("cache should initialize over HTTP");
        assert!(cache.lookup(Some("key-1")).await.is_some());

        let mut encryption = TestSigningKey::ed25519(3, "enc-key").jwk_json();
        encryption["use"] = serde_json::json!("enc");
        idp.serve_jwks_body(serde_json::json!({ "keys": [k2.jwk_json(), encryption] })).await;

        let key = cache
            .refresh_and_lookup(Some("key-2"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(key.kid(), Some("key-2"));
        assert_eq!(cache.snapshot().await.keys().len(), 1);
        assert_eq!(idp.jwks_request_count().await, 2);
    }

    #[tokio::test]
    async fn test_http_fetcher_reports_status_and_bad_body() {
        let k1 = TestSigningKey::ed25519(1, "key-1");
        let idp = MockIdentityProvider::start(&[&k1]).await;
        let fetcher = HttpKeySetFetcher::new(idp.jwks_url(), Duration::from_secs(2));
        assert_eq!(fetcher.jwks_url(), idp.jwks_url());

        idp.fail_jwks(503).await;
        assert_eq!(
            fetcher.fetch_key_set().await.unwrap_err(),
            KeyCacheError::Status(503)
        );

        idp.serve_jwks_body(serde_json::json!("not a key set")).await;
        assert!(matches!(
            fetcher.fetch_key_set().await,
            Err(KeyCacheError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_default_settings() {
        let settings = KeyCacheSettings::default();
        assert_eq!(settings.fetch_timeout, Duration::from_secs(5));
        assert_eq!(settings.min_refresh_interval, Duration::from_secs(1));
        assert!(!settings.key_id_disabled);
    }
}
