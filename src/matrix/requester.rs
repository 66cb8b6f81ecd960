//! Key and send endpoints of the Client-Server API.
//!
//! This module provides the [`KeysRequester`] struct. The device identity is
//! owned by trix rather than by the Matrix SDK, whose end-to-end layer is
//! disabled, so the SDK has no high-level call for the endpoints carrying key
//! material or ciphertext. They are sent as typed ruma requests through the SDK
//! client, which adds the access token, retries and maps the errors.
//!
//! Signed objects stay JSON [`Value`]s on our side: their signatures cover the
//! exact JSON, so they cross the ruma types as [`Raw`] values only.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use matrix_sdk::{
    Client,
    ruma::{
        OneTimeKeyAlgorithm, OneTimeKeyId, OwnedDeviceId, OwnedEventId, OwnedUserId, RoomId,
        TransactionId,
        api::client::{
            keys::{claim_keys, get_keys, upload_keys, upload_signatures, upload_signing_keys},
            message::send_message_event,
            to_device::send_event_to_device,
            uiaa::AuthData,
        },
        events::{MessageLikeEventType, ToDeviceEventType},
        serde::Raw,
        to_device::DeviceIdOrAllDevices,
    },
};
use serde_json::{Map, Value, value::to_raw_value};

use crate::{error::TrixError, matrix::client::ToDeviceMessages};

/// Outcome of `keys/device_signing/upload`.
#[derive(Debug, PartialEq, Eq)]
pub enum SigningUpload {
    Done,
    /// The server asks for user-interactive authentication
    AuthRequired { session: Option<String> },
}

/// Requester of the key and send endpoints for one logged in session.
///
/// # Examples
///
/// ```no_run
/// # use trix::matrix::requester::KeysRequester;
/// # async fn example(client: matrix_sdk::Client) -> Result<(), trix::error::TrixError> {
/// let requester = KeysRequester::new(client);
/// let response = requester.query_keys(&[]).await?;
/// println!("{} users", response.device_keys.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KeysRequester {
    /// Logged in Matrix SDK client
    client: Client,
}

impl KeysRequester {
    pub fn new(client: Client) -> Self {
        KeysRequester { client }
    }

    /// Request `POST /keys/upload` to publish device keys and one-time keys.
    ///
    /// Returns the number of `signed_curve25519` one-time keys left on the server.
    pub async fn upload_keys(
        &self,
        device_keys: Option<&Value>,
        one_time_keys: &Map<String, Value>,
    ) -> Result<u64, TrixError> {
        let operation = "upload keys";
        let target = "keys/upload";
        info!("upload {} one-time keys", one_time_keys.len());

        let mut request = upload_keys::v3::Request::new();
        request.device_keys = device_keys.map(|keys| to_raw(keys, operation)).transpose()?;
        for (key_id, key) in one_time_keys {
            let key_id =
                OneTimeKeyId::parse(key_id).map_err(|e| TrixError::crypto(operation, e))?;
            request.one_time_keys.insert(key_id, to_raw(key, operation)?);
        }

        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| TrixError::network(operation, target, e))?;

        Ok(response
            .one_time_key_counts
            .get(&OneTimeKeyAlgorithm::SignedCurve25519)
            .map_or(0, |count| u64::from(*count)))
    }

    /// Request `POST /keys/query` to get the devices and cross-signing keys of `users`.
    pub async fn query_keys(
        &self,
        users: &[OwnedUserId],
    ) -> Result<get_keys::v3::Response, TrixError> {
        debug!("query device keys of {users:?}");

        let mut request = get_keys::v3::Request::new();
        request.device_keys = users
            .iter()
            .map(|user_id| (user_id.clone(), Vec::new()))
            .collect();

        let keys = self
            .client
            .send(request)
            .await
            .map_err(|e| TrixError::network("query keys", "keys/query", e))?;

        let devices: usize = keys.device_keys.values().map(BTreeMap::len).sum();
        debug!(
            "response from keys/query -> users={}, devices={devices}, master_keys={}, failures={:?}",
            keys.device_keys.len(),
            keys.master_keys.len(),
            keys.failures.keys().collect::<Vec<_>>()
        );
        Ok(keys)
    }

    /// Request `POST /keys/claim` to claim one `signed_curve25519` key per device.
    pub async fn claim_keys(
        &self,
        devices: &[(OwnedUserId, OwnedDeviceId)],
    ) -> Result<claim_keys::v3::Response, TrixError> {
        debug!("claim one-time keys of {} devices", devices.len());

        let mut one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, OneTimeKeyAlgorithm>> =
            BTreeMap::new();
        for (user_id, device_id) in devices {
            one_time_keys
                .entry(user_id.clone())
                .or_default()
                .insert(device_id.clone(), OneTimeKeyAlgorithm::SignedCurve25519);
        }

        self.client
            .send(claim_keys::v3::Request::new(one_time_keys))
            .await
            .map_err(|e| TrixError::network("claim keys", "keys/claim", e))
    }

    /// Request `POST /keys/device_signing/upload` to publish cross-signing keys.
    ///
    /// `keys` holds the `master_key`, `self_signing_key` and `user_signing_key`
    /// objects. A user-interactive auth answer is returned as
    /// [`SigningUpload::AuthRequired`] so the caller can retry with `auth`.
    pub async fn upload_signing_keys(
        &self,
        keys: &Value,
        auth: Option<AuthData>,
    ) -> Result<SigningUpload, TrixError> {
        let operation = "upload cross-signing keys";
        let target = "keys/device_signing/upload";

        let key = |name: &str| {
            keys.get(name)
                .map(|key| to_raw(key, operation))
                .transpose()
        };
        let mut request = upload_signing_keys::v3::Request::new();
        request.auth = auth;
        request.master_key = key("master_key")?;
        request.self_signing_key = key("self_signing_key")?;
        request.user_signing_key = key("user_signing_key")?;

        match self.client.send(request).await {
            Ok(_) => Ok(SigningUpload::Done),
            Err(e) => match e.as_uiaa_response() {
                Some(uiaa) => {
                    debug!("user-interactive auth required, session {:?}", uiaa.session);
                    Ok(SigningUpload::AuthRequired {
                        session: uiaa.session.clone(),
                    })
                }
                None => Err(TrixError::network(operation, target, e)),
            },
        }
    }

    /// Request `POST /keys/signatures/upload` with signed device keys.
    ///
    /// `signatures` maps user ids to device ids to the signed device keys.
    pub async fn upload_signatures(&self, signatures: &Value) -> Result<(), TrixError> {
        let operation = "upload signatures";
        let target = "keys/signatures/upload";

        let mut signed_keys = BTreeMap::new();
        for (user_id, devices) in signatures.as_object().into_iter().flatten() {
            let user_id =
                OwnedUserId::try_from(user_id.as_str()).map_err(|e| TrixError::crypto(operation, e))?;
            let mut user_keys = upload_signatures::v3::SignedKeys::new();
            for (device_id, device_keys) in devices.as_object().into_iter().flatten() {
                user_keys.add_device_keys(device_id.as_str().into(), to_raw(device_keys, operation)?);
            }
            signed_keys.insert(user_id, user_keys);
        }

        let response = self
            .client
            .send(upload_signatures::v3::Request::new(signed_keys))
            .await
            .map_err(|e| TrixError::network(operation, target, e))?;

        if !response.failures.is_empty() {
            let rejected: Vec<String> = response
                .failures
                .iter()
                .flat_map(|(user_id, keys)| keys.keys().map(move |key| format!("{user_id} {key}")))
                .collect();
            warn!("signatures rejected: {rejected:?}");
            return Err(TrixError::network(
                operation,
                target,
                format!("rejected {}", rejected.join(", ")),
            ));
        }

        Ok(())
    }

    /// Request `PUT /sendToDevice/{eventType}/{txnId}` with one message per device.
    pub async fn send_to_device(
        &self,
        event_type: &str,
        messages: &ToDeviceMessages,
    ) -> Result<(), TrixError> {
        let operation = "send to-device messages";
        let txn_id = TransactionId::new();
        info!("send {event_type} to-device messages (txn {txn_id})");

        let mut wire = send_event_to_device::v3::Messages::new();
        for (user_id, devices) in messages {
            let user_messages = wire.entry(user_id.clone()).or_default();
            for (device_id, content) in devices {
                user_messages.insert(
                    DeviceIdOrAllDevices::DeviceId(device_id.clone()),
                    to_raw(content, operation)?,
                );
            }
        }

        let request = send_event_to_device::v3::Request::new_raw(
            ToDeviceEventType::from(event_type),
            txn_id,
            wire,
        );
        self.client
            .send(request)
            .await
            .map_err(|e| TrixError::network(operation, event_type, e))?;
        Ok(())
    }

    /// Request `PUT /rooms/{roomId}/send/{eventType}/{txnId}`.
    pub async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<OwnedEventId, TrixError> {
        let operation = "send room event";
        let txn_id = TransactionId::new();
        info!("send {event_type} to {room_id} (txn {txn_id})");

        let request = send_message_event::v3::Request::new_raw(
            room_id.to_owned(),
            txn_id,
            MessageLikeEventType::from(event_type),
            to_raw(content, operation)?,
        );
        let sent = self
            .client
            .send(request)
            .await
            .map_err(|e| TrixError::network(operation, room_id, e))?;

        debug!("response from rooms/{room_id}/send -> {}", sent.event_id);
        Ok(sent.event_id)
    }
}

/// Wraps a JSON value into a ruma [`Raw`], keeping it byte for byte.
fn to_raw<T>(value: &Value, operation: &str) -> Result<Raw<T>, TrixError> {
    let json = to_raw_value(value).map_err(|e| TrixError::crypto(operation, e))?;
    Ok(Raw::from_json(json))
}

/// Reads a ruma [`Raw`] back as the JSON value the server sent.
pub fn raw_json<T>(raw: &Raw<T>) -> Option<Value> {
    serde_json::from_str(raw.json().get()).ok()
}
