//! Configured token verifier.
//!
//! [`TokenVerifier`] resolves the key set location, initializes the key cache
//! and exposes [`TokenVerifier::parse_token`], the only call request
//! middleware needs.

use crate::config::VerifierConfig;
use crate::discovery;
use crate::error::ValidationError;
use crate::jwks::{HttpKeySetFetcher, KeyCache};
use crate::token::ValidatedToken;
use crate::validator::TokenValidator;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Verifies bearer tokens issued by one OpenID Connect provider.
pub struct TokenVerifier {
    config: VerifierConfig,
    /// Used for discovery and key set fetches; absent for a caller-owned cache.
    http_client: Option<reqwest::Client>,
    /// Set once discovery and the initial key set fetch have succeeded.
    validator: OnceCell<TokenValidator>,
}

impl TokenVerifier {
    /// Build a verifier from `config`.
    ///
    /// Unless `lazy_load` is set, discovery and the first key set fetch happen
    /// here and any failure is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Configuration`] if the configuration is
    /// invalid, the metadata document or key set cannot be fetched, or the key
    /// set is ambiguous with key identifiers disabled.
    #[instrument(skip_all, fields(issuer = %config.issuer))]
    pub async fn new(config: VerifierConfig) -> Result<Self, ValidationError> {
        config
            .validate()
            .map_err(|e| ValidationError::Configuration(e.to_string()))?;

        let http_client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| {
                ValidationError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        let verifier = Self {
            config,
            http_client: Some(http_client),
            validator: OnceCell::new(),
        };

        if verifier.config.lazy_load {
            tracing::info!(target: "oidc.verifier", "Lazy load enabled, deferring key set fetch");
        } else {
            verifier.validator().await?;
        }

        Ok(verifier)
    }

    /// Build a verifier around a key cache the caller owns.
    ///
    /// No discovery happens; the cache's settings decide key-identifier mode.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Configuration`] if the configuration is
    /// invalid or disagrees with the cache on key-identifier mode.
    pub fn with_key_cache(
        config: VerifierConfig,
        key_cache: Arc<KeyCache>,
    ) -> Result<Self, ValidationError> {
        config
            .validate()
            .map_err(|e| ValidationError::Configuration(e.to_string()))?;

        if key_cache.settings().key_id_disabled != config.key_id_disabled {
            return Err(ValidationError::Configuration(
                "key identifier mode differs between configuration and key cache".to_string(),
            ));
        }

        let validator = TokenValidator::new(key_cache, config.validation_options());
        Ok(Self {
            config,
            http_client: None,
            validator: OnceCell::new_with(Some(validator)),
        })
    }

    #[must_use]
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Whether the key cache has been initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.validator.initialized()
    }

    /// The key cache, once initialized.
    #[must_use]
    pub fn key_cache(&self) -> Option<&Arc<KeyCache>> {
        self.validator.get().map(TokenValidator::key_cache)
    }

    /// Validate a bearer token.
    ///
    /// With `lazy_load`, the first call performs discovery and the initial key
    /// set fetch; if that fails the error is returned and the next call tries
    /// again.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing why the token was rejected.
    #[instrument(skip_all)]
    pub async fn parse_token(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidatedToken, ValidationError> {
        let validator = if let Some(validator) = self.validator.get() {
            validator
        } else {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ValidationError::Cancelled),
                validator = self.validator() => validator?,
            }
        };

        validator.validate(token, cancel).await
    }

    async fn validator(&self) -> Result<&TokenValidator, ValidationError> {
        self.validator
            .get_or_try_init(|| self.build_validator())
            .await
    }

    async fn build_validator(&self) -> Result<TokenValidator, ValidationError> {
        let http_client = self.http_client.as_ref().ok_or_else(|| {
            ValidationError::Configuration("no HTTP client to fetch the key set".to_string())
        })?;
        let jwks_url = self.resolve_jwks_url(http_client).await?;

        let fetcher = HttpKeySetFetcher::with_client(jwks_url, http_client.clone());
        let key_cache =
            KeyCache::initialize_with_fetcher(Arc::new(fetcher), self.config.key_cache_settings())
                .await
                .map_err(|e| {
                    tracing::error!(target: "oidc.verifier", error = %e, "Initial key set fetch failed");
                    ValidationError::Configuration(format!("initial key set fetch failed: {e}"))
                })?;

        tracing::info!(target: "oidc.verifier", issuer = %self.config.issuer, "Token verifier ready");

        Ok(TokenValidator::new(
            Arc::new(key_cache),
            self.config.validation_options(),
        ))
    }

    async fn resolve_jwks_url(
        &self,
        http_client: &reqwest::Client,
    ) -> Result<String, ValidationError> {
        if let Some(jwks_url) = &self.config.jwks_url {
            return Ok(jwks_url.clone());
        }

        let discovery_url = self.config.resolved_discovery_url();
        let metadata = discovery::fetch_provider_metadata(
            http_client,
            &discovery_url,
            self.config.fetch_timeout,
        )
        .await
        .map_err(|e| ValidationError::Configuration(format!("discovery failed: {e}")))?;

        if !metadata.issuer_matches(&self.config.issuer) {
            tracing::warn!(
                target: "oidc.verifier",
                configured = %self.config.issuer,
                advertised = ?metadata.issuer,
                "Provider metadata advertises a different issuer"
            );
        }

        Ok(metadata.jwks_uri)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::RejectionReason;
    use crate::jwks::mock::MockKeySetFetcher;
    use crate::jwks::{KeyCacheSettings, KeySet};
    use oidc_test_utils::{TestSigningKey, TestTokenBuilder, TEST_ISSUER};
    use std::time::Duration;

    async fn cache_for(key: &TestSigningKey, key_id_disabled: bool) -> Arc<KeyCache> {
        let fetcher = MockKeySetFetcher::new(KeySet::from_jwks(&[key.jwk()]));
        let settings = KeyCacheSettings {
            key_id_disabled,
            ..KeyCacheSettings::default()
        };
        Arc::new(
            KeyCache::initialize_with_fetcher(Arc::new(fetcher), settings)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = TokenVerifier::new(VerifierConfig::new(String::new())).await;
        assert_eq!(result.err().unwrap().reason(), RejectionReason::Configuration);
    }

    #[tokio::test]
    async fn test_lazy_new_does_no_network_io() {
        // Nothing listens here; construction must still succeed
        let config = VerifierConfig::new("http://127.0.0.1:9".to_string())
            .with_lazy_load(true)
            .with_fetch_timeout(Duration::from_millis(200));

        let verifier = TokenVerifier::new(config).await.unwrap();
        assert!(!verifier.is_initialized());
        assert!(verifier.key_cache().is_none());
        assert!(verifier.http_client.is_some());
    }

    #[tokio::test]
    async fn test_with_key_cache_validates_tokens() {
        let key = TestSigningKey::ed25519(1, "key-1");
        let config = VerifierConfig::new(TEST_ISSUER.to_string())
            .with_required_audience("svc-a".to_string());
        let verifier = TokenVerifier::with_key_cache(config, cache_for(&key, false).await).unwrap();

        assert!(verifier.is_initialized());
        assert!(verifier.http_client.is_none());
        let token = TestTokenBuilder::new().audience("svc-a").sign(&key);
        let validated = verifier
            .parse_token(&token, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(validated.audience(), ["svc-a".to_string()]);
    }

    #[tokio::test]
    async fn test_with_key_cache_rejects_mode_mismatch() {
        let key = TestSigningKey::ed25519(1, "key-1");
        let config = VerifierConfig::new(TEST_ISSUER.to_string()).with_key_id_disabled(true);

        let result = TokenVerifier::with_key_cache(config, cache_for(&key, false).await);
        assert_eq!(result.err().unwrap().reason(), RejectionReason::Configuration);
    }

    #[tokio::test]
    async fn test_cancelled_before_lazy_init() {
        let config = VerifierConfig::new("http://127.0.0.1:9".to_string()).with_lazy_load(true);
        let verifier = TokenVerifier::new(config).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = verifier.parse_token("a.b.c", &cancel).await.unwrap_err();

        assert_eq!(err, ValidationError::Cancelled);
        assert!(!verifier.is_initialized());
    }
}
