//! # OIDC Test Utilities
//!
//! Shared test utilities for the `oidc-verifier` crate.
//!
//! This crate provides:
//! - Deterministic crypto fixtures (fixed Ed25519 keys for reproducible tests)
//! - A fluent token builder (`TestTokenBuilder`)
//! - A wiremock-backed identity provider (`MockIdentityProvider`)
//! - Test logging setup (`init_test_tracing`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use oidc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let key = TestSigningKey::ed25519(1, "key-1");
//!     let idp = MockIdentityProvider::start(&[&key]).await;
//!
//!     let token = TestTokenBuilder::new()
//!         .issuer(&idp.issuer())
//!         .audience("svc-a")
//!         .sign(&key);
//! }
//! ```

pub mod crypto_fixtures;
pub mod identity_provider;
pub mod token_builders;

// Re-export commonly used items
pub use crypto_fixtures::*;
pub use identity_provider::*;
pub use token_builders::*;

use tracing_subscriber::EnvFilter;

/// Install a test-friendly tracing subscriber once per test binary.
///
/// Honors `RUST_LOG`, defaulting to debug output for the verifier's targets.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("oidc=debug")),
        )
        .with_test_writer()
        .try_init();
}
