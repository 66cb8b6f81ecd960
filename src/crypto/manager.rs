//! Lifecycle of the outbound group session of each room.
//!
//! Every room has one slot, `Absent -> Active -> Retired`. A session becomes
//! usable once its key was delivered to the devices of the joined members, and is
//! retired when it reaches the rotation policy bounds or when a member holding its
//! key leaves the room. Membership changes arrive from the sync task over an
//! ordered channel and are applied before each share and encrypt.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::{debug, info, warn};
use matrix_sdk::ruma::{OwnedRoomId, OwnedUserId, RoomId};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc::UnboundedReceiver};
use vodozemac::{Curve25519PublicKey, olm::Session};

use crate::{
    crypto::{
        Clock, EncryptOutcome, RoomEncryptor, SessionSignal,
        device::{Device, Verification},
        group_session::{OutboundGroupSession, RotationPolicy, SharedDevice},
        olm::OlmIdentity,
        signing::verify_json,
    },
    error::TrixError,
    matrix::client::{ClaimedKey, SessionClient, ToDeviceMessages},
    store::CredentialStore,
};

/// Membership change seen by the sync task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberUpdate {
    Joined {
        room_id: OwnedRoomId,
        user_id: OwnedUserId,
    },
    Left {
        room_id: OwnedRoomId,
        user_id: OwnedUserId,
    },
}

/// Which devices receive room keys and how long a session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionPolicy {
    pub rotation: RotationPolicy,
    /// Share keys with devices lacking a cross-signing chain
    pub allow_unverified: bool,
}

impl Default for EncryptionPolicy {
    fn default() -> Self {
        EncryptionPolicy {
            rotation: RotationPolicy::default(),
            allow_unverified: true,
        }
    }
}

enum GroupSlot {
    Active(Box<OutboundGroupSession>),
    Retired,
}

#[derive(Default)]
struct ManagerState {
    rooms: HashMap<OwnedRoomId, GroupSlot>,
    /// Devices per user, as last queried
    devices: HashMap<OwnedUserId, Vec<Device>>,
    /// Users whose device list must be queried again
    stale: HashSet<OwnedUserId>,
}

/// Owner of the outbound group sessions.
pub struct GroupSessionManager<C: SessionClient, K: Clock> {
    client: Arc<C>,
    identity: Arc<OlmIdentity>,
    store: Arc<CredentialStore>,
    clock: K,
    policy: EncryptionPolicy,
    state: Mutex<ManagerState>,
    updates: Mutex<UnboundedReceiver<MemberUpdate>>,
}

impl<C: SessionClient, K: Clock> GroupSessionManager<C, K> {
    pub fn new(
        client: Arc<C>,
        identity: Arc<OlmIdentity>,
        store: Arc<CredentialStore>,
        clock: K,
        policy: EncryptionPolicy,
        updates: UnboundedReceiver<MemberUpdate>,
    ) -> Self {
        GroupSessionManager {
            client,
            identity,
            store,
            clock,
            policy,
            state: Mutex::new(ManagerState::default()),
            updates: Mutex::new(updates),
        }
    }

    /// Creates a new group session for `room_id` and delivers its key to the
    /// devices of the joined members, retiring the previous session.
    ///
    /// The new session is persisted before any key leaves, so a failed delivery
    /// leaves it in the not-shared state.
    pub async fn share(&self, room_id: &RoomId) -> Result<(), TrixError> {
        let mut state = self.state.lock().await;
        self.apply_updates(&mut state).await?;
        self.load_slot(&mut state, room_id).await?;

        let devices = self.target_devices(&mut state, room_id).await?;

        if matches!(state.rooms.get(room_id), Some(GroupSlot::Active(_))) {
            self.retire(&mut state, room_id).await?;
        }

        let session = OutboundGroupSession::new(self.clock.now());
        info!(
            "share group session {} of {room_id} with {} devices",
            session.session_id(),
            devices.len()
        );
        self.save_active(room_id, &session).await?;
        let room_key = session.room_key_content(room_id);
        state
            .rooms
            .insert(room_id.to_owned(), GroupSlot::Active(Box::new(session)));

        let (messages, delivered) = self.encrypt_room_key(&devices, &room_key).await?;
        if !messages.is_empty() {
            self.client
                .send_to_device("m.room.encrypted", &messages)
                .await?;
        }

        if let Some(GroupSlot::Active(session)) = state.rooms.get_mut(room_id) {
            session.mark_shared(delivered);
            self.save_active(room_id, session).await?;
        }

        Ok(())
    }

    /// Retires the persisted session of `room_id` when a user holding its key
    /// is no longer joined.
    ///
    /// Leaves that happened while no run was active never reach the sync
    /// channel, so a restored session is checked against the current members
    /// once, before the first encrypt of the run.
    pub async fn reconcile(&self, room_id: &RoomId) -> Result<(), TrixError> {
        let mut state = self.state.lock().await;
        self.apply_updates(&mut state).await?;
        self.load_slot(&mut state, room_id).await?;

        let Some(GroupSlot::Active(session)) = state.rooms.get(room_id) else {
            return Ok(());
        };
        if !session.is_shared() {
            return Ok(());
        }

        let members: HashSet<OwnedUserId> =
            self.client.joined_members(room_id).await?.into_iter().collect();
        let departed = session
            .shared_with()
            .iter()
            .find(|device| !members.contains(&device.user_id))
            .map(|device| device.user_id.clone());

        if let Some(user_id) = departed {
            info!("{user_id} is no longer in {room_id} but holds the room key");
            self.retire(&mut state, room_id).await?;
        }

        Ok(())
    }

    /// Devices of the joined members that may receive the room key.
    async fn target_devices(
        &self,
        state: &mut ManagerState,
        room_id: &RoomId,
    ) -> Result<Vec<Device>, TrixError> {
        let members = self.client.joined_members(room_id).await?;

        let to_query: Vec<OwnedUserId> = members
            .iter()
            .filter(|user_id| !state.devices.contains_key(*user_id) || state.stale.contains(*user_id))
            .cloned()
            .collect();

        if !to_query.is_empty() {
            let devices = self.client.query_devices(&to_query).await?;
            for user_id in &to_query {
                state.devices.insert(user_id.clone(), Vec::new());
                state.stale.remove(user_id);
            }
            for device in devices {
                if let Some(user_devices) = state.devices.get_mut(&device.user_id) {
                    user_devices.push(device);
                }
            }
        }

        let own_user = self.identity.user_id();
        let own_device = self.identity.device_id();

        Ok(members
            .iter()
            .filter_map(|user_id| state.devices.get(user_id))
            .flatten()
            .filter(|device| !(&device.user_id == own_user && &device.device_id == own_device))
            .filter(|device| match device.verification {
                Verification::Verified => true,
                Verification::Unverified => {
                    if !self.policy.allow_unverified {
                        debug!("skip unverified device {} of {}", device.device_id, device.user_id);
                    }
                    self.policy.allow_unverified
                }
                Verification::Blocked => {
                    debug!("skip blocked device {} of {}", device.device_id, device.user_id);
                    false
                }
            })
            .cloned()
            .collect())
    }

    /// Olm-encrypts the room key for every device with a usable Olm session.
    async fn encrypt_room_key(
        &self,
        devices: &[Device],
        room_key: &Value,
    ) -> Result<(ToDeviceMessages, Vec<SharedDevice>), TrixError> {
        let mut sessions: Vec<(Device, Session)> = Vec::new();
        let mut missing: Vec<Device> = Vec::new();

        for device in devices {
            match self.identity.load_session(&self.store, device).await? {
                Some(session) => sessions.push((device.clone(), session)),
                None => missing.push(device.clone()),
            }
        }

        if !missing.is_empty() {
            let claimed = self.client.claim_one_time_keys(&missing).await?;
            for device in missing {
                let Some(claimed_key) = claimed
                    .iter()
                    .find(|key| key.user_id == device.user_id && key.device_id == device.device_id)
                else {
                    warn!(
                        "no one-time key left for device {} of {}, skipping it",
                        device.device_id, device.user_id
                    );
                    continue;
                };

                match self.session_from_claimed_key(&device, claimed_key) {
                    Ok(session) => sessions.push((device, session)),
                    Err(e) => warn!(
                        "cannot create an olm session with device {} of {}: {e}",
                        device.device_id, device.user_id
                    ),
                }
            }
        }

        let mut messages = ToDeviceMessages::new();
        let mut delivered = Vec::new();
        for (device, mut session) in sessions {
            let content =
                self.identity
                    .encrypt_for_device(&mut session, &device, "m.room_key", room_key);
            self.identity
                .save_session(&self.store, &device, &session)
                .await?;

            messages
                .entry(device.user_id.clone())
                .or_default()
                .insert(device.device_id.clone(), content);
            delivered.push(SharedDevice {
                user_id: device.user_id,
                device_id: device.device_id,
            });
        }

        Ok((messages, delivered))
    }

    fn session_from_claimed_key(
        &self,
        device: &Device,
        claimed_key: &ClaimedKey,
    ) -> Result<Session, TrixError> {
        verify_json(
            &claimed_key.key,
            device.user_id.as_str(),
            &format!("ed25519:{}", device.device_id),
            &device.ed25519,
        )?;

        let key = claimed_key
            .key
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| TrixError::crypto("read one-time key", "missing key"))?;
        let one_time_key = Curve25519PublicKey::from_base64(key)
            .map_err(|e| TrixError::crypto("read one-time key", e))?;

        self.identity.create_outbound_session(device, one_time_key)
    }

    /// Applies the membership changes received since the last call, in order.
    async fn apply_updates(&self, state: &mut ManagerState) -> Result<(), TrixError> {
        let mut updates = self.updates.lock().await;

        while let Ok(update) = updates.try_recv() {
            match update {
                MemberUpdate::Joined { room_id, user_id } => {
                    debug!("{user_id} joined {room_id}");
                    state.stale.insert(user_id);
                }
                MemberUpdate::Left { room_id, user_id } => {
                    debug!("{user_id} left {room_id}");
                    state.devices.remove(&user_id);
                    state.stale.insert(user_id.clone());

                    self.load_slot(state, &room_id).await?;
                    let holds_key = matches!(
                        state.rooms.get(&room_id),
                        Some(GroupSlot::Active(session)) if session.is_shared_with_user(&user_id)
                    );
                    if holds_key {
                        info!("{user_id} left {room_id} holding the room key");
                        self.retire(state, &room_id).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Loads the persisted session of `room_id` on first access.
    async fn load_slot(&self, state: &mut ManagerState, room_id: &RoomId) -> Result<(), TrixError> {
        if state.rooms.contains_key(room_id) {
            return Ok(());
        }

        if let Some(record) = self.store.read(&active_key(room_id)).await? {
            let session = OutboundGroupSession::from_record(&record, self.store.pickle_key())?;
            debug!(
                "restored group session {} of {room_id} ({} messages)",
                session.session_id(),
                session.message_count()
            );
            state
                .rooms
                .insert(room_id.to_owned(), GroupSlot::Active(Box::new(session)));
        }

        Ok(())
    }

    async fn retire(&self, state: &mut ManagerState, room_id: &RoomId) -> Result<(), TrixError> {
        if let Some(GroupSlot::Active(session)) = state.rooms.remove(room_id) {
            info!("retire group session {} of {room_id}", session.session_id());
            let record = session.to_record(self.store.pickle_key())?;
            self.store.write(&retired_key(room_id), &record).await?;
            self.store.remove(&active_key(room_id)).await?;
        }
        state.rooms.insert(room_id.to_owned(), GroupSlot::Retired);
        Ok(())
    }

    async fn save_active(
        &self,
        room_id: &RoomId,
        session: &OutboundGroupSession,
    ) -> Result<(), TrixError> {
        let record = session.to_record(self.store.pickle_key())?;
        self.store.write(&active_key(room_id), &record).await
    }
}

impl<C: SessionClient, K: Clock> RoomEncryptor for GroupSessionManager<C, K> {
    async fn encrypt(
        &self,
        room_id: &RoomId,
        content: &Value,
    ) -> Result<EncryptOutcome, TrixError> {
        let mut state = self.state.lock().await;
        self.apply_updates(&mut state).await?;
        self.load_slot(&mut state, room_id).await?;

        let now = self.clock.now();
        let signal = match state.rooms.get(room_id) {
            Some(GroupSlot::Active(session)) if !session.is_shared() => {
                Some(SessionSignal::SessionNotShared)
            }
            Some(GroupSlot::Active(session)) if session.is_expired(&self.policy.rotation, now) => {
                Some(SessionSignal::SessionExpired)
            }
            Some(GroupSlot::Active(_)) => None,
            Some(GroupSlot::Retired) | None => Some(SessionSignal::NoGroupSession),
        };

        if let Some(signal) = signal {
            if signal == SessionSignal::SessionExpired {
                self.retire(&mut state, room_id).await?;
            }
            debug!("cannot encrypt for {room_id}: {signal}");
            return Ok(EncryptOutcome::NeedsSession(signal));
        }

        let Some(GroupSlot::Active(session)) = state.rooms.get_mut(room_id) else {
            return Ok(EncryptOutcome::NeedsSession(SessionSignal::NoGroupSession));
        };
        let encrypted = session.encrypt(
            room_id,
            content,
            self.identity.curve25519_key(),
            self.identity.device_id().as_str(),
        );
        self.save_active(room_id, session).await?;

        debug!(
            "encrypted message {} with group session {}",
            session.message_count(),
            encrypted.session_id
        );
        Ok(EncryptOutcome::Encrypted(encrypted))
    }

    async fn share_and_encrypt(
        &self,
        room_id: &RoomId,
        content: &Value,
    ) -> Result<EncryptOutcome, TrixError> {
        self.share(room_id).await?;
        self.encrypt(room_id, content).await
    }
}

fn active_key(room_id: &RoomId) -> String {
    format!("group_session:{room_id}")
}

fn retired_key(room_id: &RoomId) -> String {
    format!("retired_group_session:{room_id}")
}
