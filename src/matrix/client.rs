//! Matrix client wrapper for the send path.
//!
//! This module provides the [`SessionClient`] trait, the wire operations the
//! group session manager and the dispatcher depend on, and [`MatrixClient`], its
//! implementation on top of the Matrix SDK and the [`KeysRequester`].

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use matrix_sdk::{
    Client, RoomMemberships,
    ruma::{
        OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomAliasId, RoomId, UserId,
        api::client::keys::claim_keys,
    },
};
use mockall::automock;
use serde_json::Value;

use crate::{
    crypto::{
        device::{BlockedDevice, Device},
        group_session::MegolmContent,
    },
    error::TrixError,
    matrix::requester::{KeysRequester, raw_json},
};

/// Olm-encrypted to-device contents, by user and device.
pub type ToDeviceMessages = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>;

/// A one-time key claimed for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedKey {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    /// Signed key object: `{ "key": ..., "signatures": ... }`
    pub key: Value,
}

/// Wire operations of an authenticated session.
///
/// This trait abstracts the homeserver for easier testing with mocks.
#[automock]
pub trait SessionClient {
    /// Resolves a room alias into a room id.
    async fn resolve_alias(&self, alias: &RoomAliasId) -> Result<OwnedRoomId, TrixError>;
    /// Joins a room, a no-op when already joined.
    async fn join_room(&self, room_id: &RoomId) -> Result<(), TrixError>;
    /// Lists the joined members of a room.
    async fn joined_members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>, TrixError>;
    /// Fetches the devices of `users`.
    async fn query_devices(&self, users: &[OwnedUserId]) -> Result<Vec<Device>, TrixError>;
    /// Claims one `signed_curve25519` key per device. Devices without keys left
    /// are missing from the result.
    async fn claim_one_time_keys(&self, devices: &[Device]) -> Result<Vec<ClaimedKey>, TrixError>;
    /// Sends one to-device event per device in a single request.
    async fn send_to_device(
        &self,
        event_type: &str,
        messages: &ToDeviceMessages,
    ) -> Result<(), TrixError>;
    /// Sends an `m.room.encrypted` event.
    async fn send_encrypted(
        &self,
        room_id: &RoomId,
        content: &MegolmContent,
    ) -> Result<OwnedEventId, TrixError>;
}

/// Logged in Matrix session.
pub struct MatrixClient {
    /// Underlying Matrix SDK client
    client: Client,
    /// Requester of the key and send endpoints
    requester: KeysRequester,
    /// Devices that never receive room keys
    blocked_devices: BTreeSet<BlockedDevice>,
}

impl MatrixClient {
    pub fn new(
        client: Client,
        requester: KeysRequester,
        blocked_devices: BTreeSet<BlockedDevice>,
    ) -> Self {
        MatrixClient {
            client,
            requester,
            blocked_devices,
        }
    }

    /// Returns the underlying Matrix SDK client.
    pub fn sdk(&self) -> &Client {
        &self.client
    }

    /// Logs out, which also deletes the device on the homeserver.
    pub async fn logout(&self) -> Result<(), TrixError> {
        let user = self
            .client
            .user_id()
            .map(UserId::to_string)
            .unwrap_or_default();

        self.client
            .matrix_auth()
            .logout()
            .await
            .map_err(|e| TrixError::network("logout", user, e))?;

        info!("logged out");
        Ok(())
    }
}

impl SessionClient for MatrixClient {
    async fn resolve_alias(&self, alias: &RoomAliasId) -> Result<OwnedRoomId, TrixError> {
        let response = self
            .client
            .resolve_room_alias(alias)
            .await
            .map_err(|e| TrixError::network("resolve alias", alias, e))?;

        debug!("alias {alias} resolved to {}", response.room_id);
        Ok(response.room_id)
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<(), TrixError> {
        self.client
            .join_room_by_id(room_id)
            .await
            .map_err(|e| TrixError::network("join room", room_id, e))?;

        info!("joined room {room_id}");
        Ok(())
    }

    async fn joined_members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>, TrixError> {
        let room = self
            .client
            .get_room(room_id)
            .ok_or_else(|| TrixError::network("list members", room_id, "room is not known"))?;

        let members = room
            .members(RoomMemberships::JOIN)
            .await
            .map_err(|e| TrixError::network("list members", room_id, e))?;

        Ok(members
            .iter()
            .map(|member| member.user_id().to_owned())
            .collect())
    }

    async fn query_devices(&self, users: &[OwnedUserId]) -> Result<Vec<Device>, TrixError> {
        let response = self.requester.query_keys(users).await?;
        Ok(Device::from_keys_query(&response, &self.blocked_devices))
    }

    async fn claim_one_time_keys(&self, devices: &[Device]) -> Result<Vec<ClaimedKey>, TrixError> {
        let targets: Vec<(OwnedUserId, OwnedDeviceId)> = devices
            .iter()
            .map(|device| (device.user_id.clone(), device.device_id.clone()))
            .collect();

        let response = self.requester.claim_keys(&targets).await?;
        Ok(claimed_keys(response))
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        messages: &ToDeviceMessages,
    ) -> Result<(), TrixError> {
        self.requester.send_to_device(event_type, messages).await
    }

    async fn send_encrypted(
        &self,
        room_id: &RoomId,
        content: &MegolmContent,
    ) -> Result<OwnedEventId, TrixError> {
        let content = serde_json::to_value(content)
            .map_err(|e| TrixError::network("send room event", room_id, e))?;
        self.requester
            .send_room_event(room_id, "m.room.encrypted", &content)
            .await
    }
}

/// Flattens a `keys/claim` response, keeping the first key of each device.
fn claimed_keys(response: claim_keys::v3::Response) -> Vec<ClaimedKey> {
    let mut claimed = Vec::new();

    for (user_id, devices) in response.one_time_keys {
        for (device_id, keys) in devices {
            let Some((key_id, key)) = keys.into_iter().next() else {
                continue;
            };
            let Some(key) = raw_json(&key) else {
                warn!("ignore malformed one-time key {key_id} of {user_id} {device_id}");
                continue;
            };
            debug!("claimed {key_id} for {user_id} {device_id}");

            claimed.push(ClaimedKey {
                user_id: user_id.clone(),
                device_id,
                key,
            });
        }
    }

    claimed
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use matrix_sdk::ruma::{OneTimeKeyId, serde::Raw, user_id};
    use serde_json::json;

    #[test]
    fn test_claimed_keys() {
        let key = |json: Value| Raw::from_json_string(json.to_string()).unwrap();
        let key_id = OneTimeKeyId::parse("signed_curve25519:AAAA").unwrap();
        let bob_devices = BTreeMap::from([
            (
                OwnedDeviceId::from("BOB"),
                BTreeMap::from([(key_id, key(json!({"key": "bob key"})))]),
            ),
            (OwnedDeviceId::from("EMPTY"), BTreeMap::new()),
        ]);
        let response = claim_keys::v3::Response::new(BTreeMap::from([(
            user_id!("@bob:localhost").to_owned(),
            bob_devices,
        )]));

        let claimed = claimed_keys(response);

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].user_id.as_str(), "@bob:localhost");
        assert_eq!(claimed[0].device_id.as_str(), "BOB");
        assert_eq!(claimed[0].key["key"], "bob key");
    }
}
