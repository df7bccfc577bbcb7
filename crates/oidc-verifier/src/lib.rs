//! Bearer token verification against an OpenID Connect provider.
//!
//! The crate turns a compact JWS string into a [`ValidatedToken`] by:
//!
//! 1. reading the unverified header to learn which key to try ([`header`]),
//! 2. resolving that key from a cached copy of the provider's JWKS, refreshing
//!    the cache at most once per call when the key is unknown ([`jwks`]),
//! 3. verifying the signature and the issuer, audience, expiry and
//!    required-claim policies ([`validator`], [`claims`]).
//!
//! [`TokenVerifier`] wires these together from a [`VerifierConfig`] and is the
//! single entry point request middleware is expected to call.
//!
//! # Example
//!
//! ```rust,ignore
//! use oidc_verifier::{TokenVerifier, VerifierConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = VerifierConfig::new("https://idp.example".to_string())
//!     .with_required_audience("svc-a".to_string());
//! let verifier = TokenVerifier::new(config).await?;
//!
//! let token = verifier.parse_token(bearer, &CancellationToken::new()).await?;
//! tracing::info!(subject = ?token.subject(), "request authorized");
//! ```

#![warn(clippy::pedantic)]

/// Structural matching of required claim values against token claims
pub mod claims;

/// Configuration loading and validation
pub mod config;

/// OpenID Connect provider metadata discovery
pub mod discovery;

/// Pipeline-level error taxonomy
pub mod error;

/// Unverified token envelope parsing
pub mod header;

/// Verification key cache with coordinated refresh
pub mod jwks;

/// Validated token representation
pub mod token;

/// Token validation pipeline
pub mod validator;

/// Configured entry point used by request middleware
pub mod verifier;

pub use claims::{ClaimError, ClaimValue};
pub use config::{ConfigError, VerifierConfig};
pub use discovery::{DiscoveryError, ProviderMetadata};
pub use error::{RejectionReason, ValidationError};
pub use header::{unverified_header, CompactToken, HeaderError, UnverifiedHeader};
pub use jwks::{
    HttpKeySetFetcher, KeyCache, KeyCacheError, KeyCacheSettings, KeySet, KeySetFetcher,
    KeySnapshot, VerificationKey,
};
pub use token::ValidatedToken;
pub use validator::{TokenValidator, ValidationOptions};
pub use verifier::TokenVerifier;
