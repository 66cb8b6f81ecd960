//! Signed JSON objects.
//!
//! Matrix signs the canonical form of a JSON object: keys sorted, no
//! insignificant whitespace, and the `signatures` and `unsigned` members removed.
//! Signatures are stored back in the object under
//! `signatures.<user id>.<algorithm>:<key id>`.

use matrix_sdk::ruma::CanonicalJsonValue;
use serde_json::{Map, Value};
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::TrixError;

/// Serializes `value` in canonical form.
///
/// # Errors
///
/// Canonical JSON only allows integers in the `[-(2**53)+1, (2**53)-1]` range,
/// other numbers are rejected.
pub fn canonical_json(value: &Value) -> Result<String, TrixError> {
    let canonical = CanonicalJsonValue::try_from(value.clone())
        .map_err(|e| TrixError::crypto("canonical json", e))?;
    Ok(canonical.to_string())
}

/// Returns the bytes covered by the signatures of `value`.
pub fn signing_payload(value: &Value) -> Result<String, TrixError> {
    match value {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove("signatures");
            map.remove("unsigned");
            canonical_json(&Value::Object(map))
        }
        other => canonical_json(other),
    }
}

/// Signs `value` and stores the signature under `signatures.<user_id>.<key_id>`.
///
/// `sign` receives the canonical payload and returns its Ed25519 signature.
pub fn sign_json(
    value: &mut Value,
    user_id: &str,
    key_id: &str,
    sign: impl FnOnce(&[u8]) -> Ed25519Signature,
) -> Result<(), TrixError> {
    let signature = sign(signing_payload(value)?.as_bytes());

    let object = value
        .as_object_mut()
        .ok_or_else(|| TrixError::crypto("sign json", "only objects can be signed"))?;
    let signatures = object_entry(object, "signatures")?;
    let user_signatures = object_entry(signatures, user_id)?;
    user_signatures.insert(key_id.to_owned(), Value::from(signature.to_base64()));

    Ok(())
}

fn object_entry<'a>(
    object: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>, TrixError> {
    object
        .entry(key.to_owned())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| TrixError::crypto("sign json", format!("{key} is not an object")))
}

/// Checks the signature made by `key_id` of `user_id` over `value`.
pub fn verify_json(
    value: &Value,
    user_id: &str,
    key_id: &str,
    public_key: &Ed25519PublicKey,
) -> Result<(), TrixError> {
    let encoded = value
        .get("signatures")
        .and_then(|signatures| signatures.get(user_id))
        .and_then(|signatures| signatures.get(key_id))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            TrixError::crypto("verify json", format!("no signature from {user_id} {key_id}"))
        })?;

    let signature = Ed25519Signature::from_base64(encoded)
        .map_err(|e| TrixError::crypto("verify json", e))?;

    public_key
        .verify(signing_payload(value)?.as_bytes(), &signature)
        .map_err(|e| TrixError::crypto("verify json", e))
}
