//! Cross-signing keys of the sending account.
//!
//! The bundle holds the master, self-signing and user-signing Ed25519 keys. The
//! master key signs the two others, and the self-signing key signs our device so
//! other clients can verify it without an interactive verification.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey};

use crate::{
    crypto::{device::cross_signing_public_key, signing::sign_json},
    error::TrixError,
};

/// Store key of the cross-signing bundle.
pub const CROSS_SIGNING_KEY: &str = "cross_signing";

/// Why cross-signing keys were not published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The account already has a master key on the server, created elsewhere
    RemoteExists,
    /// Provisioning failed; the message carries the cause
    Failed(String),
}

/// Result of the cross-signing step of the identity bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossSigningOutcome {
    /// New keys were uploaded and our device signed
    Published,
    /// Keys from an earlier run are in the store
    AlreadyPresent,
    /// Messaging works without cross-signing, the device stays unverified
    Skipped(SkipReason),
}

impl fmt::Display for CrossSigningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossSigningOutcome::Published => f.write_str("published"),
            CrossSigningOutcome::AlreadyPresent => f.write_str("already present"),
            CrossSigningOutcome::Skipped(SkipReason::RemoteExists) => {
                f.write_str("skipped, a master key already exists on the server")
            }
            CrossSigningOutcome::Skipped(SkipReason::Failed(reason)) => {
                write!(f, "skipped, {reason}")
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredBundle {
    master: String,
    self_signing: String,
    user_signing: String,
}

/// Master, self-signing and user-signing keys.
pub struct CrossSigningBundle {
    master: Ed25519SecretKey,
    self_signing: Ed25519SecretKey,
    user_signing: Ed25519SecretKey,
}

impl CrossSigningBundle {
    pub fn generate() -> Self {
        CrossSigningBundle {
            master: Ed25519SecretKey::new(),
            self_signing: Ed25519SecretKey::new(),
            user_signing: Ed25519SecretKey::new(),
        }
    }

    pub fn master_key(&self) -> Ed25519PublicKey {
        self.master.public_key()
    }

    pub fn self_signing_key(&self) -> Ed25519PublicKey {
        self.self_signing.public_key()
    }

    /// Body of `keys/device_signing/upload`.
    pub fn upload_body(&self, user_id: &str) -> Result<Value, TrixError> {
        let master_key = key_object(user_id, "master", &self.master);
        let mut self_signing_key = key_object(user_id, "self_signing", &self.self_signing);
        let mut user_signing_key = key_object(user_id, "user_signing", &self.user_signing);

        let master_id = key_id(&self.master.public_key());
        sign_json(&mut self_signing_key, user_id, &master_id, |payload| {
            self.master.sign(payload)
        })?;
        sign_json(&mut user_signing_key, user_id, &master_id, |payload| {
            self.master.sign(payload)
        })?;

        Ok(json!({
            "master_key": master_key,
            "self_signing_key": self_signing_key,
            "user_signing_key": user_signing_key,
        }))
    }

    /// Body of `keys/signatures/upload` signing our device with the
    /// self-signing key.
    pub fn sign_device(
        &self,
        user_id: &str,
        device_id: &str,
        device_keys: &Value,
    ) -> Result<Value, TrixError> {
        let mut signed = device_keys.clone();
        if let Some(object) = signed.as_object_mut() {
            object.remove("signatures");
        }
        sign_json(
            &mut signed,
            user_id,
            &key_id(&self.self_signing.public_key()),
            |payload| self.self_signing.sign(payload),
        )?;

        Ok(json!({ user_id: { device_id: signed } }))
    }

    /// Whether `master_key`, as returned by `keys/query`, is ours.
    pub fn matches_remote(&self, master_key: &Value) -> bool {
        cross_signing_public_key(master_key) == Some(self.master.public_key())
    }

    pub fn to_record(&self) -> Result<Vec<u8>, TrixError> {
        let stored = StoredBundle {
            master: encode_secret(&self.master),
            self_signing: encode_secret(&self.self_signing),
            user_signing: encode_secret(&self.user_signing),
        };
        serde_json::to_vec(&stored).map_err(|e| TrixError::crypto("serialize cross-signing keys", e))
    }

    pub fn from_record(bytes: &[u8]) -> Result<Self, TrixError> {
        let stored: StoredBundle = serde_json::from_slice(bytes)
            .map_err(|e| TrixError::crypto("parse cross-signing keys", e))?;

        Ok(CrossSigningBundle {
            master: decode_secret(&stored.master)?,
            self_signing: decode_secret(&stored.self_signing)?,
            user_signing: decode_secret(&stored.user_signing)?,
        })
    }
}

fn key_id(key: &Ed25519PublicKey) -> String {
    format!("ed25519:{}", key.to_base64())
}

fn key_object(user_id: &str, usage: &str, key: &Ed25519SecretKey) -> Value {
    let public = key.public_key();
    json!({
        "user_id": user_id,
        "usage": [usage],
        "keys": { key_id(&public): public.to_base64() },
    })
}

fn encode_secret(key: &Ed25519SecretKey) -> String {
    vodozemac::base64_encode(key.to_bytes().as_slice())
}

fn decode_secret(encoded: &str) -> Result<Ed25519SecretKey, TrixError> {
    let bytes = vodozemac::base64_decode(encoded)
        .map_err(|e| TrixError::crypto("decode cross-signing key", e))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TrixError::crypto("decode cross-signing key", "expected 32 bytes"))?;
    Ok(Ed25519SecretKey::from_slice(&bytes))
}
