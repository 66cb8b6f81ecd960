//! Device identity and pairwise Olm sessions.

use log::{debug, info, warn};
use matrix_sdk::ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use vodozemac::{
    Curve25519PublicKey, Ed25519PublicKey, base64_encode,
    olm::{Account, AccountPickle, Session, SessionConfig, SessionPickle},
};

use crate::{
    crypto::{MEGOLM_ALGORITHM, OLM_ALGORITHM, device::Device, signing::sign_json},
    error::TrixError,
    store::CredentialStore,
};

/// Store key of the pickled Olm account.
const ACCOUNT_KEY: &str = "olm_account";

/// Pickled account as written in the credential store.
#[derive(Serialize, Deserialize)]
struct StoredAccount {
    /// Device the account was created for
    device_id: String,
    /// Account pickle encrypted with the store pickle key
    pickle: String,
}

/// Pickled pairwise session as written in the credential store.
#[derive(Serialize, Deserialize)]
struct StoredSession {
    /// Our Curve25519 key when the session was created
    sender_key: String,
    pickle: String,
}

/// Identity of the sending device.
///
/// Wraps the Olm account: the long-term Curve25519 and Ed25519 keys and the
/// pool of one-time keys. The account is bound to one device id; logging in
/// with another device id yields a new account.
pub struct OlmIdentity {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Account,
}

impl OlmIdentity {
    /// Restores the account of `device_id` from the store, or creates and
    /// persists a new one.
    pub async fn load_or_create(
        store: &CredentialStore,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    ) -> Result<Self, TrixError> {
        if let Some(bytes) = store.read(ACCOUNT_KEY).await? {
            let stored: StoredAccount = serde_json::from_slice(&bytes)
                .map_err(|e| TrixError::storage(store.account(), "parse olm_account", e))?;

            if stored.device_id == device_id.as_str() {
                let pickle = AccountPickle::from_encrypted(&stored.pickle, store.pickle_key())
                    .map_err(|e| TrixError::crypto("unpickle olm account", e))?;
                info!("restored olm account of device {device_id}");

                return Ok(OlmIdentity {
                    user_id,
                    device_id,
                    account: Account::from_pickle(pickle),
                });
            }

            warn!(
                "stored olm account belongs to device {}, creating one for {device_id}",
                stored.device_id
            );
        }

        let identity = OlmIdentity {
            user_id,
            device_id,
            account: Account::new(),
        };
        identity.persist(store).await?;
        info!("created olm account for device {}", identity.device_id);

        Ok(identity)
    }

    /// Writes the account to the store.
    pub async fn persist(&self, store: &CredentialStore) -> Result<(), TrixError> {
        let stored = StoredAccount {
            device_id: self.device_id.to_string(),
            pickle: self.account.pickle().encrypt(store.pickle_key()),
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| TrixError::storage(store.account(), "serialize olm_account", e))?;
        store.write(ACCOUNT_KEY, &bytes).await
    }

    pub fn user_id(&self) -> &OwnedUserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &OwnedDeviceId {
        &self.device_id
    }

    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.account.curve25519_key()
    }

    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.account.ed25519_key()
    }

    /// Signed device keys, as uploaded to `keys/upload`.
    pub fn device_keys(&self) -> Result<Value, TrixError> {
        let device_id = self.device_id.as_str();
        let mut keys = json!({
            "user_id": self.user_id,
            "device_id": device_id,
            "algorithms": [OLM_ALGORITHM, MEGOLM_ALGORITHM],
            "keys": {
                format!("curve25519:{device_id}"): self.curve25519_key().to_base64(),
                format!("ed25519:{device_id}"): self.ed25519_key().to_base64(),
            },
        });
        self.sign_object(&mut keys)?;
        Ok(keys)
    }

    /// Upper bound of one-time keys the account keeps.
    pub fn max_one_time_keys(&self) -> usize {
        self.account.max_number_of_one_time_keys()
    }

    /// Generates `count` one-time keys and returns every unpublished key, signed.
    pub fn generate_one_time_keys(&mut self, count: usize) -> Result<Map<String, Value>, TrixError> {
        self.account.generate_one_time_keys(count);

        let mut signed_keys = Map::new();
        for (key_id, key) in self.account.one_time_keys() {
            let mut signed_key = json!({ "key": key.to_base64() });
            self.sign_object(&mut signed_key)?;
            signed_keys.insert(
                format!("signed_curve25519:{}", key_id.to_base64()),
                signed_key,
            );
        }

        debug!("{} one-time keys ready for upload", signed_keys.len());
        Ok(signed_keys)
    }

    /// Marks the generated one-time keys as uploaded.
    pub fn mark_keys_as_published(&mut self) {
        self.account.mark_keys_as_published();
    }

    /// Creates an Olm session with `device` from one of its one-time keys.
    pub fn create_outbound_session(
        &self,
        device: &Device,
        one_time_key: Curve25519PublicKey,
    ) -> Result<Session, TrixError> {
        // vodozemac's create_outbound_session is infallible
        Ok(self.account.create_outbound_session(
            SessionConfig::version_1(),
            device.curve25519,
            one_time_key,
        ))
    }

    /// Olm-encrypts an event of `event_type` for `device`.
    ///
    /// Returns the content of an `m.room.encrypted` to-device event.
    pub fn encrypt_for_device(
        &self,
        session: &mut Session,
        device: &Device,
        event_type: &str,
        content: &Value,
    ) -> Value {
        let payload = json!({
            "type": event_type,
            "content": content,
            "sender": self.user_id,
            "sender_device": self.device_id,
            "keys": { "ed25519": self.ed25519_key().to_base64() },
            "recipient": device.user_id,
            "recipient_keys": { "ed25519": device.ed25519.to_base64() },
        });

        // to_parts yields the raw message bytes, the event carries them as
        // unpadded base64
        let (message_type, body) = session.encrypt(payload.to_string()).to_parts();

        json!({
            "algorithm": OLM_ALGORITHM,
            "sender_key": self.curve25519_key().to_base64(),
            "ciphertext": {
                device.curve25519.to_base64(): {
                    "type": message_type,
                    "body": base64_encode(body),
                },
            },
        })
    }

    /// Loads the stored Olm session with `device`, if it was created by this account.
    pub async fn load_session(
        &self,
        store: &CredentialStore,
        device: &Device,
    ) -> Result<Option<Session>, TrixError> {
        let key = session_key(device);
        let Some(bytes) = store.read(&key).await? else {
            return Ok(None);
        };

        let stored: StoredSession = serde_json::from_slice(&bytes)
            .map_err(|e| TrixError::storage(store.account(), &format!("parse {key}"), e))?;
        if stored.sender_key != self.curve25519_key().to_base64() {
            debug!("ignore olm session with {} created by another account", device.device_id);
            return Ok(None);
        }

        let pickle = SessionPickle::from_encrypted(&stored.pickle, store.pickle_key())
            .map_err(|e| TrixError::crypto("unpickle olm session", e))?;
        Ok(Some(Session::from_pickle(pickle)))
    }

    /// Persists the Olm session with `device`.
    pub async fn save_session(
        &self,
        store: &CredentialStore,
        device: &Device,
        session: &Session,
    ) -> Result<(), TrixError> {
        let key = session_key(device);
        let stored = StoredSession {
            sender_key: self.curve25519_key().to_base64(),
            pickle: session.pickle().encrypt(store.pickle_key()),
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| TrixError::storage(store.account(), &format!("serialize {key}"), e))?;
        store.write(&key, &bytes).await
    }

    fn sign_object(&self, value: &mut Value) -> Result<(), TrixError> {
        let key_id = format!("ed25519:{}", self.device_id);
        sign_json(value, self.user_id.as_str(), &key_id, |payload| {
            self.account.sign(payload)
        })
    }
}

fn session_key(device: &Device) -> String {
    format!("olm_session:{}", device.curve25519.to_base64())
}
