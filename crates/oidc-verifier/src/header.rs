//! Unverified token envelope parsing.
//!
//! The verification key must be chosen *before* the signature can be checked,
//! so the header is read without trusting it. Nothing parsed here may be used
//! for a trust decision beyond "which key to try" and the token type gate.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only the compact serialization with exactly one signature is accepted
//! - No cryptographic work happens here

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum accepted token size in bytes (8KB).
///
/// Checked before any base64 decoding. Typical access tokens are well under
/// 2KB, so this only rejects abusive input.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Errors from structural parsing of a token envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Token size exceeds [`MAX_TOKEN_SIZE_BYTES`].
    #[error("token is too large")]
    TokenTooLarge,

    /// Token is not a well-formed compact JWS.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Token is a JSON serialization carrying several signatures.
    #[error("tokens with more than one signature are not supported")]
    MultipleSignatures,
}

/// Header fields read before the signature is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnverifiedHeader {
    /// Signature algorithm named by the token (`alg`).
    pub alg: String,

    /// Key identifier (`kid`). Empty or non-string values are treated as absent.
    pub kid: Option<String>,

    /// Token type (`typ`).
    pub typ: Option<String>,
}

/// A compact JWS split into its three segments.
///
/// Borrowing the original string keeps the signing input byte-identical to
/// what the issuer signed.
#[derive(Debug, Clone, Copy)]
pub struct CompactToken<'a> {
    signing_input: &'a str,
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
}

impl<'a> CompactToken<'a> {
    /// Split a compact token into header, payload and signature.
    ///
    /// # Errors
    ///
    /// - [`HeaderError::TokenTooLarge`] if the token exceeds the size limit
    /// - [`HeaderError::MultipleSignatures`] for a multi-signature JSON serialization
    /// - [`HeaderError::Malformed`] for anything that is not three non-empty segments
    pub fn parse(token: &'a str) -> Result<Self, HeaderError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            tracing::debug!(
                target: "oidc.header",
                token_size = token.len(),
                max_size = MAX_TOKEN_SIZE_BYTES,
                "Token rejected: size exceeds maximum allowed"
            );
            return Err(HeaderError::TokenTooLarge);
        }

        if token.trim_start().starts_with('{') {
            return Err(classify_json_serialization(token));
        }

        // header.payload.signature, where signature = alg(header.payload)
        let (signing_input, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| malformed("expected three dot-separated segments"))?;
        let (header, payload) = signing_input
            .split_once('.')
            .ok_or_else(|| malformed("expected three dot-separated segments"))?;

        if payload.contains('.') {
            tracing::debug!(
                target: "oidc.header",
                segments = token.split('.').count(),
                "Token rejected: too many segments"
            );
            return Err(malformed("expected three dot-separated segments"));
        }
        if header.is_empty() || payload.is_empty() || signature.is_empty() {
            return Err(malformed("empty token segment"));
        }

        Ok(Self {
            signing_input,
            header,
            payload,
            signature,
        })
    }

    /// The bytes the signature covers: `header.payload`.
    #[must_use]
    pub fn signing_input(&self) -> &'a str {
        self.signing_input
    }

    /// The base64url-encoded signature segment.
    #[must_use]
    pub fn signature(&self) -> &'a str {
        self.signature
    }

    /// Decode the header without verifying anything.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::Malformed`] if the header is not base64url JSON
    /// object carrying a string `alg`.
    pub fn header(&self) -> Result<UnverifiedHeader, HeaderError> {
        let header = decode_segment(self.header, "header")?;

        let alg = header
            .get("alg")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| malformed("header is missing alg"))?;

        // Non-string or empty kid values are treated as absent
        let kid = header
            .get("kid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);

        let typ = header
            .get("typ")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        Ok(UnverifiedHeader { alg, kid, typ })
    }

    /// Decode the payload into a claim map.
    ///
    /// Only meaningful after the signature has been verified.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::Malformed`] if the payload is not a base64url
    /// JSON object.
    pub fn claims(&self) -> Result<Map<String, Value>, HeaderError> {
        decode_segment(self.payload, "payload")
    }
}

/// Read the header of a token without verifying it.
///
/// # Errors
///
/// See [`CompactToken::parse`] and [`CompactToken::header`].
pub fn unverified_header(token: &str) -> Result<UnverifiedHeader, HeaderError> {
    CompactToken::parse(token)?.header()
}

fn decode_segment(segment: &str, name: &str) -> Result<Map<String, Value>, HeaderError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
        tracing::debug!(target: "oidc.header", segment = name, error = %e, "Failed to decode token base64");
        malformed(&format!("{name} is not base64url"))
    })?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(malformed(&format!("{name} is not a JSON object"))),
        Err(e) => {
            tracing::debug!(target: "oidc.header", segment = name, error = %e, "Failed to parse token JSON");
            Err(malformed(&format!("{name} is not valid JSON")))
        }
    }
}

fn classify_json_serialization(token: &str) -> HeaderError {
    let Ok(document) = serde_json::from_str::<Value>(token) else {
        return malformed("invalid JSON serialization");
    };
    match document.get("signatures").and_then(Value::as_array) {
        Some(signatures) if signatures.len() > 1 => {
            tracing::debug!(
                target: "oidc.header",
                signatures = signatures.len(),
                "Token rejected: multiple signatures"
            );
            HeaderError::MultipleSignatures
        }
        _ => malformed("JSON serialization is not supported"),
    }
}

fn malformed(reason: &str) -> HeaderError {
    HeaderError::Malformed(reason.to_string())
}
