//! Devices of the room members, as published by the homeserver.

use std::collections::BTreeSet;

use log::{debug, warn};
use matrix_sdk::ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId, api::client::keys::get_keys};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{crypto::signing::verify_json, error::TrixError, matrix::requester::raw_json};

/// A device that never receives room keys.
///
/// Device ids are only unique per user, so the owner is part of the entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockedDevice {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
}

/// Trust level of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Signed by the owner's self-signing key, itself signed by the master key
    Verified,
    /// Valid device keys without a cross-signing chain
    Unverified,
    /// Listed in the configured block list
    Blocked,
}

/// A device able to receive room keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    /// Identity key used to establish Olm sessions
    pub curve25519: Curve25519PublicKey,
    /// Fingerprint key signing the device keys and one-time keys
    pub ed25519: Ed25519PublicKey,
    pub verification: Verification,
}

impl Device {
    /// Extracts the devices of a `keys/query` response.
    ///
    /// Devices whose keys are malformed, do not match the user and device they
    /// are listed under, or are not signed by their own Ed25519 key are dropped.
    /// Devices in `blocked` are kept with [`Verification::Blocked`].
    pub fn from_keys_query(
        response: &get_keys::v3::Response,
        blocked: &BTreeSet<BlockedDevice>,
    ) -> Vec<Self> {
        let mut devices = Vec::new();

        for (user_id, user_devices) in &response.device_keys {
            let self_signing_key = verified_self_signing_key(response, user_id);

            for (device_id, device_keys) in user_devices {
                let Some(device_keys) = raw_json(device_keys) else {
                    warn!("ignore device {device_id} of {user_id}: keys are not JSON");
                    continue;
                };
                let device = match parse_device(user_id, device_id, &device_keys) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("ignore device {device_id} of {user_id}: {e}");
                        continue;
                    }
                };

                let verification = if blocked.contains(&BlockedDevice {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                }) {
                    Verification::Blocked
                } else if self_signing_key.as_ref().is_some_and(|key| {
                    verify_json(
                        &device_keys,
                        user_id.as_str(),
                        &format!("ed25519:{}", key.to_base64()),
                        key,
                    )
                    .is_ok()
                }) {
                    Verification::Verified
                } else {
                    Verification::Unverified
                };

                debug!("device {device_id} of {user_id} is {verification:?}");
                devices.push(Device {
                    verification,
                    ..device
                });
            }
        }

        devices
    }
}

fn parse_device(
    user_id: &UserId,
    device_id: &DeviceId,
    keys: &Value,
) -> Result<Device, TrixError> {
    if keys.get("user_id").and_then(Value::as_str) != Some(user_id.as_str())
        || keys.get("device_id").and_then(Value::as_str) != Some(device_id.as_str())
    {
        return Err(TrixError::crypto(
            "parse device keys",
            "user or device id mismatch",
        ));
    }

    let key = |algorithm: &str| {
        keys.get("keys")
            .and_then(|keys| keys.get(format!("{algorithm}:{device_id}")))
            .and_then(Value::as_str)
            .ok_or_else(|| TrixError::crypto("parse device keys", format!("no {algorithm} key")))
    };

    let curve25519 = Curve25519PublicKey::from_base64(key("curve25519")?)
        .map_err(|e| TrixError::crypto("parse device keys", e))?;
    let ed25519 = Ed25519PublicKey::from_base64(key("ed25519")?)
        .map_err(|e| TrixError::crypto("parse device keys", e))?;

    verify_json(
        keys,
        user_id.as_str(),
        &format!("ed25519:{device_id}"),
        &ed25519,
    )?;

    Ok(Device {
        user_id: user_id.to_owned(),
        device_id: device_id.to_owned(),
        curve25519,
        ed25519,
        verification: Verification::Unverified,
    })
}

/// Returns the first Ed25519 key of a cross-signing key object.
pub(crate) fn cross_signing_public_key(key: &Value) -> Option<Ed25519PublicKey> {
    key.get("keys")?
        .as_object()?
        .values()
        .find_map(Value::as_str)
        .and_then(|encoded| Ed25519PublicKey::from_base64(encoded).ok())
}

/// Returns the self-signing key of `user_id` if the master key vouches for it.
fn verified_self_signing_key(
    response: &get_keys::v3::Response,
    user_id: &UserId,
) -> Option<Ed25519PublicKey> {
    let master = cross_signing_public_key(&raw_json(response.master_keys.get(user_id)?)?)?;
    let self_signing_keys = raw_json(response.self_signing_keys.get(user_id)?)?;
    let self_signing = cross_signing_public_key(&self_signing_keys)?;

    let master_key_id = format!("ed25519:{}", master.to_base64());
    match verify_json(&self_signing_keys, user_id.as_str(), &master_key_id, &master) {
        Ok(()) => Some(self_signing),
        Err(e) => {
            warn!("self-signing key of {user_id} is not signed by its master key: {e}");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::signing::sign_json;
    use matrix_sdk::ruma::{OwnedUserId, serde::Raw};
    use serde_json::json;
    use std::collections::BTreeMap;
    use vodozemac::{Ed25519SecretKey, olm::Account};

    /// Device keys of `account`, signed by the account.
    pub(crate) fn signed_device_keys(account: &Account, user_id: &str, device_id: &str) -> Value {
        let mut keys = json!({
            "user_id": user_id,
            "device_id": device_id,
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                format!("curve25519:{device_id}"): account.curve25519_key().to_base64(),
                format!("ed25519:{device_id}"): account.ed25519_key().to_base64(),
            },
        });
        sign_json(&mut keys, user_id, &format!("ed25519:{device_id}"), |payload| {
            account.sign(payload)
        })
        .unwrap();
        keys
    }

    fn cross_signing_key(user_id: &str, usage: &str, key: &Ed25519SecretKey) -> Value {
        let public = key.public_key().to_base64();
        json!({
            "user_id": user_id,
            "usage": [usage],
            "keys": { format!("ed25519:{public}"): public },
        })
    }

    fn raw<T>(value: &Value) -> Raw<T> {
        Raw::from_json_string(value.to_string()).unwrap()
    }

    fn owned(user_id: &str) -> OwnedUserId {
        UserId::parse(user_id).unwrap()
    }

    fn query_response(user_id: &str, devices: Vec<(&str, Value)>) -> get_keys::v3::Response {
        let devices = devices
            .into_iter()
            .map(|(device_id, keys)| (OwnedDeviceId::from(device_id), raw(&keys)))
            .collect();
        let mut response = get_keys::v3::Response::new();
        response.device_keys = BTreeMap::from([(owned(user_id), devices)]);
        response
    }

    fn blocked(user_id: &str, device_id: &str) -> BTreeSet<BlockedDevice> {
        BTreeSet::from([BlockedDevice {
            user_id: owned(user_id),
            device_id: device_id.into(),
        }])
    }

    #[test]
    fn test_unverified_device() {
        let account = Account::new();
        let keys = signed_device_keys(&account, "@bob:localhost", "BOB");
        let response = query_response("@bob:localhost", vec![("BOB", keys)]);

        let devices = Device::from_keys_query(&response, &BTreeSet::new());

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id.as_str(), "BOB");
        assert_eq!(devices[0].curve25519, account.curve25519_key());
        assert_eq!(devices[0].verification, Verification::Unverified);
    }

    #[test]
    fn test_blocked_device() {
        let account = Account::new();
        let keys = signed_device_keys(&account, "@bob:localhost", "BOB");
        let response = query_response("@bob:localhost", vec![("BOB", keys)]);

        let devices = Device::from_keys_query(&response, &blocked("@bob:localhost", "BOB"));

        assert_eq!(devices[0].verification, Verification::Blocked);
    }

    #[test]
    fn test_block_applies_to_the_listed_user_only() {
        let account = Account::new();
        let keys = signed_device_keys(&account, "@carol:localhost", "BOB");
        let response = query_response("@carol:localhost", vec![("BOB", keys)]);

        let devices = Device::from_keys_query(&response, &blocked("@bob:localhost", "BOB"));

        assert_eq!(devices[0].user_id.as_str(), "@carol:localhost");
        assert_eq!(devices[0].verification, Verification::Unverified);
    }

    #[test]
    fn test_badly_signed_device_is_dropped() {
        let account = Account::new();
        let mut keys = signed_device_keys(&account, "@bob:localhost", "BOB");
        keys["algorithms"] = json!([]);
        let response = query_response("@bob:localhost", vec![("BOB", keys)]);

        assert!(Device::from_keys_query(&response, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_device_listed_under_another_id_is_dropped() {
        let account = Account::new();
        let keys = signed_device_keys(&account, "@bob:localhost", "BOB");
        let response = query_response("@bob:localhost", vec![("OTHER", keys)]);

        assert!(Device::from_keys_query(&response, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_cross_signed_device_is_verified() {
        let user_id = "@bob:localhost";
        let account = Account::new();
        let master = Ed25519SecretKey::new();
        let self_signing = Ed25519SecretKey::new();

        let master_key = cross_signing_key(user_id, "master", &master);
        let mut self_signing_key = cross_signing_key(user_id, "self_signing", &self_signing);
        let master_id = format!("ed25519:{}", master.public_key().to_base64());
        sign_json(&mut self_signing_key, user_id, &master_id, |payload| {
            master.sign(payload)
        })
        .unwrap();

        let mut keys = signed_device_keys(&account, user_id, "BOB");
        let self_signing_id = format!("ed25519:{}", self_signing.public_key().to_base64());
        sign_json(&mut keys, user_id, &self_signing_id, |payload| {
            self_signing.sign(payload)
        })
        .unwrap();

        let mut response = query_response(user_id, vec![("BOB", keys)]);
        response.master_keys.insert(owned(user_id), raw(&master_key));
        response
            .self_signing_keys
            .insert(owned(user_id), raw(&self_signing_key));

        let devices = Device::from_keys_query(&response, &BTreeSet::new());
        assert_eq!(devices[0].verification, Verification::Verified);
    }

    #[test]
    fn test_self_signing_key_without_master_signature_is_not_trusted() {
        let user_id = "@bob:localhost";
        let account = Account::new();
        let master = Ed25519SecretKey::new();
        let self_signing = Ed25519SecretKey::new();

        let mut keys = signed_device_keys(&account, user_id, "BOB");
        let self_signing_id = format!("ed25519:{}", self_signing.public_key().to_base64());
        sign_json(&mut keys, user_id, &self_signing_id, |payload| {
            self_signing.sign(payload)
        })
        .unwrap();

        let mut response = query_response(user_id, vec![("BOB", keys)]);
        response.master_keys.insert(
            owned(user_id),
            raw(&cross_signing_key(user_id, "master", &master)),
        );
        response.self_signing_keys.insert(
            owned(user_id),
            raw(&cross_signing_key(user_id, "self_signing", &self_signing)),
        );

        let devices = Device::from_keys_query(&response, &BTreeSet::new());
        assert_eq!(devices[0].verification, Verification::Unverified);
    }
}
