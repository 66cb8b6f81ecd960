//! End-to-end encryption of outbound room messages.
//!
//! The Olm and Megolm ratchets come from [`vodozemac`]; this module keeps the
//! state around them consistent:
//!
//! - [`olm::OlmIdentity`] is the device identity (Curve25519 + Ed25519) and the
//!   pairwise Olm sessions used to hand out room keys.
//! - [`group_session::OutboundGroupSession`] is the Megolm session of one room with
//!   its rotation bookkeeping.
//! - [`manager::GroupSessionManager`] creates, shares, rotates and retires the
//!   group session of each room.
//! - [`cross_signing`] provisions the master, self-signing and user-signing keys.
//!
//! The dispatcher only talks to the manager through the [`RoomEncryptor`] trait.

use std::{fmt, time::SystemTime};

use matrix_sdk::ruma::RoomId;
use mockall::automock;
use serde_json::Value;

use crate::{crypto::group_session::MegolmContent, error::TrixError};

pub mod cross_signing;
pub mod device;
pub mod group_session;
pub mod manager;
pub mod olm;
pub mod signing;

/// Algorithm of room events encrypted with Megolm.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
/// Algorithm of to-device events encrypted with Olm.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// Reason why a message could not be encrypted with the current group session.
///
/// A signal is not an error: the caller is expected to share a new session and
/// try again once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// The room has no group session, or the last one was retired
    NoGroupSession,
    /// A session exists but its key never reached the room members
    SessionNotShared,
    /// The session reached its age or message bound and was retired
    SessionExpired,
}

impl fmt::Display for SessionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            SessionSignal::NoGroupSession => "no group session",
            SessionSignal::SessionNotShared => "session not shared",
            SessionSignal::SessionExpired => "session expired",
        };
        f.write_str(description)
    }
}

/// Result of an encryption attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EncryptOutcome {
    /// Content ready to be sent as an `m.room.encrypted` event
    Encrypted(MegolmContent),
    /// The group session must be (re)shared first
    NeedsSession(SessionSignal),
}

/// Encryption of room message content.
#[automock]
pub trait RoomEncryptor {
    /// Encrypts `content` with the current group session of the room.
    ///
    /// Performs no network request.
    async fn encrypt(&self, room_id: &RoomId, content: &Value)
    -> Result<EncryptOutcome, TrixError>;

    /// Creates and shares a fresh group session, then encrypts `content` with it.
    async fn share_and_encrypt(
        &self,
        room_id: &RoomId,
        content: &Value,
    ) -> Result<EncryptOutcome, TrixError>;
}

/// Source of the current time for the rotation policy.
#[automock]
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// [`Clock`] reading the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
