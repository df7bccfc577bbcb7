//! Required-claim matching.
//!
//! A required-claims policy is an entitlement check: the presented token must
//! carry *at least* the required values, not exactly them.
//!
//! - Scalars (string, number, bool) compare by value.
//! - Sequences use containment: every required element must match some
//!   element of the received sequence, in any order. Extra elements are fine.
//! - Mappings require every required key to exist and match recursively.
//!   Extra keys are fine.
//! - A shape mismatch (e.g. mapping required, string received) is a hard
//!   failure. Values are never coerced.
//!
//! # Example
//!
//! ```rust
//! use oidc_verifier::claims::match_required_claims;
//! use serde_json::json;
//!
//! let required = json!({ "roles": ["admin"] });
//! let claims = json!({ "roles": ["user", "admin", "ops"], "sub": "alice" });
//!
//! assert!(match_required_claims(
//!     required.as_object().unwrap(),
//!     claims.as_object().unwrap(),
//! )
//! .is_ok());
//! ```

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Reasons a token's claims fail a required-claims policy.
///
/// `claim` is the dotted path of the offending value, e.g. `realm.roles`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// A required key is absent from the token.
    #[error("required claim `{claim}` is missing")]
    Missing { claim: String },

    /// The token carries the claim with a different shape than required.
    #[error("claim `{claim}` is a {received}, expected a {required}")]
    TypeMismatch {
        claim: String,
        required: &'static str,
        received: &'static str,
    },

    /// Shapes agree but the token does not contain the required value.
    #[error("claim `{claim}` does not contain the required value")]
    ValueMismatch { claim: String },
}

/// A scalar claim value.
#[derive(Debug, Clone, Copy)]
pub enum Scalar<'a> {
    String(&'a str),
    Number(&'a Number),
    Bool(bool),
}

/// Borrowed, shape-tagged view of a JSON claim value.
///
/// Matching recurses over this type so every shape combination is handled
/// by an exhaustive `match`.
#[derive(Debug, Clone, Copy)]
pub enum ClaimValue<'a> {
    Scalar(Scalar<'a>),
    Sequence(&'a [Value]),
    Mapping(&'a Map<String, Value>),
    /// `null`: carries no value that can be compared.
    Incomparable,
}

impl<'a> From<&'a Value> for ClaimValue<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::String(s) => ClaimValue::Scalar(Scalar::String(s)),
            Value::Number(n) => ClaimValue::Scalar(Scalar::Number(n)),
            Value::Bool(b) => ClaimValue::Scalar(Scalar::Bool(*b)),
            Value::Array(items) => ClaimValue::Sequence(items),
            Value::Object(map) => ClaimValue::Mapping(map),
            Value::Null => ClaimValue::Incomparable,
        }
    }
}

impl ClaimValue<'_> {
    /// Short shape name used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimValue::Scalar(Scalar::String(_)) => "string",
            ClaimValue::Scalar(Scalar::Number(_)) => "number",
            ClaimValue::Scalar(Scalar::Bool(_)) => "bool",
            ClaimValue::Sequence(_) => "sequence",
            ClaimValue::Mapping(_) => "mapping",
            ClaimValue::Incomparable => "null",
        }
    }
}

/// Check every top-level required claim against the token's claim set.
///
/// # Errors
///
/// Returns the first [`ClaimError`] encountered, in the iteration order of
/// `required`.
pub fn match_required_claims(
    required: &Map<String, Value>,
    claims: &Map<String, Value>,
) -> Result<(), ClaimError> {
    for (name, required_value) in required {
        let received = claims.get(name).ok_or_else(|| ClaimError::Missing {
            claim: name.clone(),
        })?;
        matches(name, required_value, received)?;
    }
    Ok(())
}

/// Check that `received` structurally contains `required`.
///
/// `claim` is the path used in error messages.
///
/// # Errors
///
/// - [`ClaimError::TypeMismatch`] if the shapes differ
/// - [`ClaimError::Missing`] if a required mapping key is absent
/// - [`ClaimError::ValueMismatch`] if a scalar differs or a required sequence
///   element has no match
pub fn matches(claim: &str, required: &Value, received: &Value) -> Result<(), ClaimError> {
    let required_view = ClaimValue::from(required);
    let received_view = ClaimValue::from(received);

    match (required_view, received_view) {
        (ClaimValue::Scalar(want), ClaimValue::Scalar(got)) => match scalars_equal(want, got) {
            Some(true) => Ok(()),
            Some(false) => Err(ClaimError::ValueMismatch {
                claim: claim.to_string(),
            }),
            None => Err(type_mismatch(claim, required_view, received_view)),
        },
        (ClaimValue::Sequence(want), ClaimValue::Sequence(got)) => {
            for wanted in want {
                if !got.iter().any(|item| matches(claim, wanted, item).is_ok()) {
                    return Err(ClaimError::ValueMismatch {
                        claim: claim.to_string(),
                    });
                }
            }
            Ok(())
        }
        (ClaimValue::Mapping(want), ClaimValue::Mapping(got)) => {
            for (key, wanted) in want {
                let path = format!("{claim}.{key}");
                match got.get(key) {
                    Some(item) => matches(&path, wanted, item)?,
                    None => return Err(ClaimError::Missing { claim: path }),
                }
            }
            Ok(())
        }
        (
            ClaimValue::Scalar(_)
            | ClaimValue::Sequence(_)
            | ClaimValue::Mapping(_)
            | ClaimValue::Incomparable,
            _,
        ) => Err(type_mismatch(claim, required_view, received_view)),
    }
}

fn type_mismatch(claim: &str, required: ClaimValue<'_>, received: ClaimValue<'_>) -> ClaimError {
    ClaimError::TypeMismatch {
        claim: claim.to_string(),
        required: required.kind(),
        received: received.kind(),
    }
}

/// `None` when the scalar kinds differ.
fn scalars_equal(required: Scalar<'_>, received: Scalar<'_>) -> Option<bool> {
    match (required, received) {
        (Scalar::String(a), Scalar::String(b)) => Some(a == b),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a == b),
        (Scalar::Number(a), Scalar::Number(b)) => Some(numbers_equal(a, b)),
        _ => None,
    }
}

/// JSON numbers compare by value, so `1` and `1.0` are equal.
#[allow(clippy::float_cmp)]
fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: &Value) -> &Map<String, Value> {
        value.as_object().expect("test value must be an object")
    }

    // -------------------------------------------------------------------------
    // Scalars
    // -------------------------------------------------------------------------

    #[test]
    fn test_scalars_match_by_value() {
        assert!(matches("c", &json!("a"), &json!("a")).is_ok());
        assert!(matches("c", &json!(true), &json!(true)).is_ok());
        assert!(matches("c", &json!(42), &json!(42)).is_ok());
        assert!(matches("c", &json!(1), &json!(1.0)).is_ok());
    }

    #[test]
    fn test_scalar_value_mismatch() {
        assert_eq!(
            matches("c", &json!("a"), &json!("b")),
            Err(ClaimError::ValueMismatch {
                claim: "c".to_string()
            })
        );
        assert!(matches("c", &json!(false), &json!(true)).is_err());
        assert!(matches("c", &json!(1.5), &json!(2)).is_err());
    }

    #[test]
    fn test_scalar_kinds_are_not_coerced() {
        assert_eq!(
            matches("c", &json!("1"), &json!(1)),
            Err(ClaimError::TypeMismatch {
                claim: "c".to_string(),
                required: "string",
                received: "number",
            })
        );
        assert!(matches("c", &json!(true), &json!("true")).is_err());
    }

    // -------------------------------------------------------------------------
    // Sequences
    // -------------------------------------------------------------------------

    #[test]
    fn test_sequence_containment_ignores_order_and_extras() {
        let received = json!(["user", "admin", "ops"]);
        assert!(matches("roles", &json!(["admin"]), &received).is_ok());
        assert!(matches("roles", &json!(["ops", "user"]), &received).is_ok());
        assert!(matches("roles", &json!([]), &received).is_ok());
    }

    #[test]
    fn test_sequence_missing_element() {
        let received = json!(["user", "admin", "ops"]);
        assert_eq!(
            matches("roles", &json!(["superadmin"]), &received),
            Err(ClaimError::ValueMismatch {
                claim: "roles".to_string()
            })
        );
        assert!(matches("roles", &json!(["admin", "root"]), &received).is_err());
    }

    #[test]
    fn test_sequence_of_mappings_uses_containment() {
        let received = json!([{ "name": "a", "level": 1 }, { "name": "b", "level": 2 }]);
        assert!(matches("grants", &json!([{ "name": "b" }]), &received).is_ok());
        assert!(matches("grants", &json!([{ "name": "c" }]), &received).is_err());
    }

    #[test]
    fn test_sequence_required_against_scalar_is_type_mismatch() {
        assert!(matches!(
            matches("roles", &json!(["admin"]), &json!("admin")),
            Err(ClaimError::TypeMismatch {
                required: "sequence",
                received: "string",
                ..
            })
        ));
    }

    // -------------------------------------------------------------------------
    // Mappings
    // -------------------------------------------------------------------------

    #[test]
    fn test_nested_mapping_allows_extra_keys() {
        let received = json!({
            "realm": { "roles": ["reader", "writer"], "tenant": "acme" },
            "extra": 1
        });
        let required = json!({ "realm": { "roles": ["writer"] } });
        assert!(match_required_claims(object(&required), object(&received)).is_ok());
    }

    #[test]
    fn test_nested_mapping_missing_key_reports_path() {
        let received = json!({ "realm": { "tenant": "acme" } });
        let required = json!({ "realm": { "roles": ["writer"] } });
        assert_eq!(
            match_required_claims(object(&required), object(&received)),
            Err(ClaimError::Missing {
                claim: "realm.roles".to_string()
            })
        );
    }

    #[test]
    fn test_mapping_required_against_scalar_is_type_mismatch() {
        let received = json!({ "realm": "acme" });
        let required = json!({ "realm": { "tenant": "acme" } });
        assert!(matches!(
            match_required_claims(object(&required), object(&received)),
            Err(ClaimError::TypeMismatch {
                required: "mapping",
                received: "string",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_top_level_claim() {
        let required = json!({ "tenant": "acme" });
        let received = json!({ "sub": "alice" });
        assert_eq!(
            match_required_claims(object(&required), object(&received)),
            Err(ClaimError::Missing {
                claim: "tenant".to_string()
            })
        );
    }

    #[test]
    fn test_null_required_value_never_matches() {
        assert!(matches!(
            matches("c", &json!(null), &json!(null)),
            Err(ClaimError::TypeMismatch {
                required: "null",
                ..
            })
        ));
    }

    // -------------------------------------------------------------------------
    // Containment law
    // -------------------------------------------------------------------------

    #[test]
    fn test_every_value_contains_itself() {
        let samples = [
            json!("s"),
            json!(7),
            json!(false),
            json!(["a", 1, { "k": [true] }]),
            json!({ "a": { "b": ["c", "d"] }, "e": 2.5 }),
        ];
        for sample in &samples {
            assert!(
                matches("c", sample, sample).is_ok(),
                "{sample} should contain itself"
            );
        }
    }

    #[test]
    fn test_containment_survives_received_growth() {
        let required = json!({ "scope": ["read"], "org": { "id": 9 } });
        let received = json!({
            "scope": ["write", "read", "admin"],
            "org": { "id": 9, "name": "acme", "tags": ["x"] },
            "sub": "alice"
        });
        assert!(match_required_claims(object(&required), object(&received)).is_ok());

        let not_contained = json!({ "scope": ["read"], "org": { "id": 10 } });
        assert!(match_required_claims(object(&not_contained), object(&received)).is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ClaimValue::from(&json!("x")).kind(), "string");
        assert_eq!(ClaimValue::from(&json!(1)).kind(), "number");
        assert_eq!(ClaimValue::from(&json!(true)).kind(), "bool");
        assert_eq!(ClaimValue::from(&json!([])).kind(), "sequence");
        assert_eq!(ClaimValue::from(&json!({})).kind(), "mapping");
        assert_eq!(ClaimValue::from(&json!(null)).kind(), "null");
    }
}
