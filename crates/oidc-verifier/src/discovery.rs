//! OpenID Connect provider metadata discovery.
//!
//! Only the `jwks_uri` field of the metadata document is used; it is read
//! once, when the verifier is built.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Well-known path of the provider metadata document, relative to the issuer.
pub const OPENID_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";

/// Errors from fetching provider metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("failed to fetch provider metadata: {0}")]
    Fetch(String),

    #[error("provider metadata endpoint returned status {0}")]
    Status(u16),

    #[error("invalid provider metadata: {0}")]
    InvalidDocument(String),
}

/// The subset of provider metadata this crate needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier advertised by the provider.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Location of the provider's signing keys.
    pub jwks_uri: String,
}

impl ProviderMetadata {
    /// Whether the advertised issuer equals `expected`, ignoring one trailing
    /// slash on either side. A document without `issuer` matches.
    #[must_use]
    pub fn issuer_matches(&self, expected: &str) -> bool {
        fn trim(issuer: &str) -> &str {
            issuer.strip_suffix('/').unwrap_or(issuer)
        }
        match self.issuer.as_deref() {
            Some(advertised) => trim(advertised) == trim(expected),
            None => true,
        }
    }
}

/// Metadata document URL for `issuer`.
///
/// A single trailing slash on the issuer is dropped first.
#[must_use]
pub fn discovery_url(issuer: &str) -> String {
    let base = issuer.strip_suffix('/').unwrap_or(issuer);
    format!("{base}{OPENID_CONFIGURATION_PATH}")
}

/// Fetch and parse the provider metadata document at `url`.
///
/// # Errors
///
/// Returns a [`DiscoveryError`] if the request fails, times out, returns a
/// non-success status, or the body lacks a non-empty `jwks_uri`.
#[instrument(skip_all, fields(url = %url))]
pub async fn fetch_provider_metadata(
    http_client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<ProviderMetadata, DiscoveryError> {
    tracing::debug!(target: "oidc.discovery", "Fetching provider metadata");

    let response = http_client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(target: "oidc.discovery", error = %e, "Failed to fetch provider metadata");
            DiscoveryError::Fetch(e.to_string())
        })?;

    if !response.status().is_success() {
        tracing::error!(
            target: "oidc.discovery",
            status = %response.status(),
            "Provider metadata endpoint returned error"
        );
        return Err(DiscoveryError::Status(response.status().as_u16()));
    }

    let metadata: ProviderMetadata = response.json().await.map_err(|e| {
        tracing::error!(target: "oidc.discovery", error = %e, "Failed to parse provider metadata");
        DiscoveryError::InvalidDocument(e.to_string())
    })?;

    if metadata.jwks_uri.is_empty() {
        return Err(DiscoveryError::InvalidDocument("empty jwks_uri".to_string()));
    }

    tracing::info!(
        target: "oidc.discovery",
        jwks_uri = %metadata.jwks_uri,
        "Discovered key set location"
    );

    Ok(metadata)
}
