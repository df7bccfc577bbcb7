//! Verifier configuration.
//!
//! Configuration is a plain struct built either in code with the `with_*`
//! setters or from `OIDC_*` environment variables.

use crate::discovery;
use crate::jwks::{KeyCacheSettings, DEFAULT_FETCH_TIMEOUT, DEFAULT_MIN_REFRESH_INTERVAL};
use crate::validator::ValidationOptions;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default clock drift tolerance for expiry checks (10 seconds).
pub const DEFAULT_CLOCK_DRIFT: Duration = Duration::from_secs(10);

/// Maximum allowed clock drift tolerance (10 minutes).
pub const MAX_CLOCK_DRIFT: Duration = Duration::from_secs(600);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid issuer configuration: {0}")]
    InvalidIssuer(String),

    #[error("Invalid fetch timeout configuration: {0}")]
    InvalidFetchTimeout(String),

    #[error("Invalid refresh interval configuration: {0}")]
    InvalidRefreshInterval(String),

    #[error("Invalid clock drift configuration: {0}")]
    InvalidClockDrift(String),

    #[error("Invalid required claims configuration: {0}")]
    InvalidRequiredClaims(String),

    #[error("Invalid flag value: {0}")]
    InvalidFlag(String),
}

/// Token verifier configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    /// Expected `iss` claim. Required and non-empty.
    pub issuer: String,

    /// Provider metadata URL. Defaults to the well-known path under the issuer.
    pub discovery_url: Option<String>,

    /// Key set URL. When set, discovery is skipped.
    pub jwks_url: Option<String>,

    /// Bound on each metadata and key set fetch (default: 5s).
    pub fetch_timeout: Duration,

    /// Minimum spacing between key set refreshes (default: 1s).
    pub min_refresh_interval: Duration,

    /// Tolerance added to `exp` (default: 10s).
    pub clock_drift: Duration,

    /// Defer discovery and the first key set fetch to the first token.
    pub lazy_load: bool,

    /// Required `typ` header value, compared exactly.
    pub required_token_type: Option<String>,

    /// Audience the token must include. Empty means any audience.
    pub required_audience: Option<String>,

    /// Claims the token must structurally contain.
    pub required_claims: Option<Map<String, Value>>,

    /// Ignore `kid` and verify against the key set's only key.
    pub key_id_disabled: bool,
}

impl VerifierConfig {
    /// Create a configuration for `issuer` with default settings.
    #[must_use]
    pub fn new(issuer: String) -> Self {
        Self {
            issuer,
            discovery_url: None,
            jwks_url: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            clock_drift: DEFAULT_CLOCK_DRIFT,
            lazy_load: false,
            required_token_type: None,
            required_audience: None,
            required_claims: None,
            key_id_disabled: false,
        }
    }

    #[must_use]
    pub fn with_discovery_url(mut self, url: String) -> Self {
        self.discovery_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_jwks_url(mut self, url: String) -> Self {
        self.jwks_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn with_clock_drift(mut self, drift: Duration) -> Self {
        self.clock_drift = drift;
        self
    }

    #[must_use]
    pub fn with_lazy_load(mut self, lazy_load: bool) -> Self {
        self.lazy_load = lazy_load;
        self
    }

    #[must_use]
    pub fn with_required_token_type(mut self, typ: String) -> Self {
        self.required_token_type = Some(typ);
        self
    }

    #[must_use]
    pub fn with_required_audience(mut self, audience: String) -> Self {
        self.required_audience = Some(audience);
        self
    }

    #[must_use]
    pub fn with_required_claims(mut self, claims: Map<String, Value>) -> Self {
        self.required_claims = Some(claims);
        self
    }

    #[must_use]
    pub fn with_key_id_disabled(mut self, disabled: bool) -> Self {
        self.key_id_disabled = disabled;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`VerifierConfig::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `OIDC_ISSUER` is missing or any value fails
    /// to parse or validate.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let issuer = vars
            .get("OIDC_ISSUER")
            .ok_or_else(|| ConfigError::MissingEnvVar("OIDC_ISSUER".to_string()))?
            .clone();

        let mut config = Self::new(issuer);
        config.discovery_url = vars.get("OIDC_DISCOVERY_URL").cloned();
        config.jwks_url = vars.get("OIDC_JWKS_URL").cloned();

        if let Some(value_str) = vars.get("OIDC_FETCH_TIMEOUT_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidFetchTimeout(format!(
                    "OIDC_FETCH_TIMEOUT_SECONDS must be a valid positive integer, got '{value_str}': {e}"
                ))
            })?;
            config.fetch_timeout = Duration::from_secs(value);
        }

        if let Some(value_str) = vars.get("OIDC_REFRESH_INTERVAL_MS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidRefreshInterval(format!(
                    "OIDC_REFRESH_INTERVAL_MS must be a valid non-negative integer, got '{value_str}': {e}"
                ))
            })?;
            config.min_refresh_interval = Duration::from_millis(value);
        }

        if let Some(value_str) = vars.get("OIDC_CLOCK_DRIFT_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidClockDrift(format!(
                    "OIDC_CLOCK_DRIFT_SECONDS must be a valid non-negative integer, got '{value_str}': {e}"
                ))
            })?;
            config.clock_drift = Duration::from_secs(value);
        }

        config.lazy_load = parse_flag(vars, "OIDC_LAZY_LOAD")?;
        config.key_id_disabled = parse_flag(vars, "OIDC_DISABLE_KEY_ID")?;
        config.required_token_type = vars.get("OIDC_REQUIRED_TOKEN_TYPE").cloned();
        config.required_audience = vars.get("OIDC_REQUIRED_AUDIENCE").cloned();

        if let Some(value_str) = vars.get("OIDC_REQUIRED_CLAIMS") {
            let value: Value = serde_json::from_str(value_str).map_err(|e| {
                ConfigError::InvalidRequiredClaims(format!(
                    "OIDC_REQUIRED_CLAIMS must be valid JSON: {e}"
                ))
            })?;
            match value {
                Value::Object(claims) => config.required_claims = Some(claims),
                _ => {
                    return Err(ConfigError::InvalidRequiredClaims(
                        "OIDC_REQUIRED_CLAIMS must be a JSON object".to_string(),
                    ))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that the type system does not.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty issuer, a zero fetch timeout or a
    /// clock drift above [`MAX_CLOCK_DRIFT`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::InvalidIssuer(
                "issuer must not be empty".to_string(),
            ));
        }

        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidFetchTimeout(
                "fetch timeout must be greater than 0".to_string(),
            ));
        }

        if self.clock_drift > MAX_CLOCK_DRIFT {
            return Err(ConfigError::InvalidClockDrift(format!(
                "clock drift must not exceed {} seconds, got {}",
                MAX_CLOCK_DRIFT.as_secs(),
                self.clock_drift.as_secs()
            )));
        }

        Ok(())
    }

    /// Metadata document URL: the explicit override, else derived from the issuer.
    #[must_use]
    pub fn resolved_discovery_url(&self) -> String {
        self.discovery_url
            .clone()
            .unwrap_or_else(|| discovery::discovery_url(&self.issuer))
    }

    #[must_use]
    pub fn key_cache_settings(&self) -> KeyCacheSettings {
        KeyCacheSettings {
            fetch_timeout: self.fetch_timeout,
            min_refresh_interval: self.min_refresh_interval,
            key_id_disabled: self.key_id_disabled,
        }
    }

    #[must_use]
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            issuer: self.issuer.clone(),
            required_audience: self.required_audience.clone(),
            required_token_type: self.required_token_type.clone(),
            required_claims: self.required_claims.clone(),
            clock_drift: self.clock_drift,
        }
    }
}

fn parse_flag(vars: &HashMap<String, String>, name: &str) -> Result<bool, ConfigError> {
    let Some(value) = vars.get(name) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidFlag(format!(
            "{name} must be true or false, got '{other}'"
        ))),
    }
}
