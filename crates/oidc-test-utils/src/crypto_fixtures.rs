//! Deterministic cryptographic fixtures for testing
//!
//! Provides reproducible Ed25519 signing keys and their JWK form.
//! All fixtures are deterministic based on seed values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Value};

/// Ed25519 signing key with an optional key id.
///
/// # Example
/// ```rust,ignore
/// let key = TestSigningKey::ed25519(1, "key-1");
/// let jwks = jwks_json(&[&key]);
/// let token = TestTokenBuilder::new().sign(&key);
/// ```
#[derive(Clone)]
pub struct TestSigningKey {
    kid: Option<String>,
    public_key_bytes: Vec<u8>,
    private_key_pkcs8: Vec<u8>,
}

impl TestSigningKey {
    /// Deterministic key for `seed`, published under `kid`.
    ///
    /// The same seed always produces the same keypair.
    pub fn ed25519(seed: u8, kid: &str) -> Self {
        let mut key = Self::ed25519_without_kid(seed);
        key.kid = Some(kid.to_string());
        key
    }

    /// Deterministic key for `seed` whose JWK carries no `kid`.
    pub fn ed25519_without_kid(seed: u8) -> Self {
        let seed_bytes = seed_bytes(seed);

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .expect("Failed to create test keypair");

        Self {
            kid: None,
            public_key_bytes: key_pair.public_key().as_ref().to_vec(),
            private_key_pkcs8: build_pkcs8_from_seed(&seed_bytes),
        }
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Raw 32-byte public key.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key_bytes
    }

    /// Public key as a JWK JSON object.
    pub fn jwk_json(&self) -> Value {
        let mut jwk = json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(&self.public_key_bytes),
            "alg": "EdDSA",
            "use": "sig"
        });
        if let Some(kid) = &self.kid {
            jwk["kid"] = json!(kid);
        }
        jwk
    }

    /// Public key as a parsed [`Jwk`].
    pub fn jwk(&self) -> Jwk {
        serde_json::from_value(self.jwk_json()).expect("Test JWK should parse")
    }

    pub fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_ed_der(&self.private_key_pkcs8)
    }

    /// Sign `claims` with `header`. The header's `alg` is forced to EdDSA.
    pub fn sign(&self, mut header: Header, claims: &Value) -> String {
        header.alg = Algorithm::EdDSA;
        jsonwebtoken::encode(&header, claims, &self.encoding_key()).expect("Failed to sign token")
    }
}

/// A JWKS document (`{"keys": [...]}`) publishing `keys`.
pub fn jwks_json(keys: &[&TestSigningKey]) -> Value {
    json!({ "keys": keys.iter().map(|key| key.jwk_json()).collect::<Vec<_>>() })
}

fn seed_bytes(seed: u8) -> [u8; 32] {
    let mut seed_bytes = [0u8; 32];
    seed_bytes[0] = seed;
    // Fill rest with deterministic pattern
    for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
        *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
    }
    seed_bytes
}

/// Build PKCS#8 v1 document from Ed25519 seed
///
/// This is a test-only utility. Production code must use ring::rand::SystemRandom.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    // PKCS#8 v1 format for Ed25519 (RFC 5208):
    // SEQUENCE {
    //   version         INTEGER (0),
    //   algorithm       AlgorithmIdentifier,
    //   privateKey      OCTET STRING
    // }
    let mut pkcs8 = Vec::with_capacity(48);

    // Outer SEQUENCE, 46 bytes
    pkcs8.extend_from_slice(&[0x30, 0x2e]);

    // Version: INTEGER 0
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);

    // AlgorithmIdentifier with OID 1.3.101.112 (Ed25519)
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);

    // OCTET STRING wrapping an OCTET STRING holding the seed
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);

    pkcs8
}
