//! Outbound Megolm session of a room.

use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use matrix_sdk::ruma::{OwnedDeviceId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use vodozemac::{
    Curve25519PublicKey,
    megolm::{GroupSession, GroupSessionPickle, SessionConfig},
};

use crate::{crypto::MEGOLM_ALGORITHM, error::TrixError};

/// Bounds after which a group session must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_age: Duration,
    pub max_messages: u64,
}

impl Default for RotationPolicy {
    /// One week or 100 messages, whichever comes first.
    fn default() -> Self {
        RotationPolicy {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_messages: 100,
        }
    }
}

/// A device that received the session key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SharedDevice {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
}

/// Content of an `m.room.encrypted` event encrypted with Megolm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegolmContent {
    pub algorithm: String,
    pub sender_key: String,
    pub ciphertext: String,
    pub session_id: String,
    pub device_id: String,
}

#[derive(Serialize, Deserialize)]
struct StoredGroupSession {
    pickle: String,
    created_at_ms: u64,
    message_count: u64,
    shared: bool,
    shared_with: BTreeSet<SharedDevice>,
}

/// Megolm ratchet plus its rotation bookkeeping.
pub struct OutboundGroupSession {
    inner: GroupSession,
    created_at: SystemTime,
    message_count: u64,
    /// Set once the session key was delivered to every target device
    shared: bool,
    shared_with: BTreeSet<SharedDevice>,
}

impl OutboundGroupSession {
    pub fn new(created_at: SystemTime) -> Self {
        OutboundGroupSession {
            inner: GroupSession::new(SessionConfig::version_1()),
            created_at,
            message_count: 0,
            shared: false,
            shared_with: BTreeSet::new(),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn shared_with(&self) -> &BTreeSet<SharedDevice> {
        &self.shared_with
    }

    /// Whether any device of `user_id` holds the session key.
    pub fn is_shared_with_user(&self, user_id: &UserId) -> bool {
        self.shared_with
            .iter()
            .any(|device| *device.user_id == *user_id)
    }

    /// Whether the session reached the age or message bound of `policy`.
    pub fn is_expired(&self, policy: &RotationPolicy, now: SystemTime) -> bool {
        let age = now.duration_since(self.created_at).unwrap_or_default();
        age >= policy.max_age || self.message_count >= policy.max_messages
    }

    /// Content of the `m.room_key` event handing this session out.
    pub fn room_key_content(&self, room_id: &RoomId) -> Value {
        json!({
            "algorithm": MEGOLM_ALGORITHM,
            "room_id": room_id,
            "session_id": self.session_id(),
            "session_key": self.inner.session_key().to_base64(),
        })
    }

    /// Records that the key reached `devices`.
    pub fn mark_shared(&mut self, devices: impl IntoIterator<Item = SharedDevice>) {
        self.shared_with.extend(devices);
        self.shared = true;
    }

    /// Encrypts a room message and advances the message counter.
    pub fn encrypt(
        &mut self,
        room_id: &RoomId,
        content: &Value,
        sender_key: Curve25519PublicKey,
        device_id: &str,
    ) -> MegolmContent {
        let plaintext = json!({
            "type": "m.room.message",
            "content": content,
            "room_id": room_id,
        });
        let ciphertext = self.inner.encrypt(plaintext.to_string()).to_base64();
        self.message_count += 1;

        MegolmContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            sender_key: sender_key.to_base64(),
            ciphertext,
            session_id: self.session_id(),
            device_id: device_id.to_owned(),
        }
    }

    /// Serializes the session, its ratchet encrypted with `pickle_key`.
    pub fn to_record(&self, pickle_key: &[u8; 32]) -> Result<Vec<u8>, TrixError> {
        let created_at_ms = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let stored = StoredGroupSession {
            pickle: self.inner.pickle().encrypt(pickle_key),
            created_at_ms,
            message_count: self.message_count,
            shared: self.shared,
            shared_with: self.shared_with.clone(),
        };
        serde_json::to_vec(&stored).map_err(|e| TrixError::crypto("serialize group session", e))
    }

    pub fn from_record(bytes: &[u8], pickle_key: &[u8; 32]) -> Result<Self, TrixError> {
        let stored: StoredGroupSession = serde_json::from_slice(bytes)
            .map_err(|e| TrixError::crypto("parse group session", e))?;
        let pickle = GroupSessionPickle::from_encrypted(&stored.pickle, pickle_key)
            .map_err(|e| TrixError::crypto("unpickle group session", e))?;

        Ok(OutboundGroupSession {
            inner: GroupSession::from_pickle(pickle),
            created_at: UNIX_EPOCH + Duration::from_millis(stored.created_at_ms),
            message_count: stored.message_count,
            shared: stored.shared,
            shared_with: stored.shared_with,
        })
    }
}
