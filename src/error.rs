//! Error taxonomy for trix.
//!
//! Every fatal failure of the send path is a [`TrixError`]. The variants carry the
//! operation and the identifiers needed to diagnose the failure from the final
//! error message alone. Session-state signals are not errors: they live in
//! [`crate::crypto::SessionSignal`] and only become a [`TrixError::SessionRepair`]
//! when the single repair attempt did not help.

use std::fmt::Display;

use thiserror::Error;

use crate::crypto::SessionSignal;

/// Boxed error used as the source of wrapped failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fatal errors surfaced to the caller of the send path.
#[derive(Debug, Error)]
pub enum TrixError {
    /// The homeserver rejected the credentials, or the session has no access token.
    #[error("authentication failed for {user}: {source}")]
    Authentication {
        /// User that tried to log in
        user: String,
        /// Underlying failure
        #[source]
        source: BoxError,
    },

    /// Credential store I/O or (de)serialization failure.
    #[error("credential store failure for {account} during {operation}: {source}")]
    Storage {
        /// Account key of the store
        account: String,
        /// Store operation that failed
        operation: String,
        /// Underlying failure
        #[source]
        source: BoxError,
    },

    /// The credential store was used after being closed.
    #[error("credential store for {account} is closed")]
    StoreClosed {
        /// Account key of the store
        account: String,
    },

    /// A request to the homeserver failed.
    #[error("{operation} failed for {target}: {source}")]
    Network {
        /// Wire operation that failed
        operation: String,
        /// Room, user or endpoint the operation targeted
        target: String,
        /// Underlying failure
        #[source]
        source: BoxError,
    },

    /// The room is neither a room id nor a room alias.
    #[error("invalid room {0}: expected a room id (!) or an alias (#)")]
    InvalidRoom(String),

    /// The homeserver url cannot be used.
    #[error("invalid homeserver {0}")]
    InvalidHost(String),

    /// The group session could not be repaired by one share.
    #[error("could not establish a group session in {room}: {signal}")]
    SessionRepair {
        /// Room the message was meant for
        room: String,
        /// Signal returned after the retry
        signal: SessionSignal,
    },

    /// Key material could not be decoded, pickled or unpickled.
    #[error("crypto failure during {operation}: {reason}")]
    Crypto {
        /// Crypto operation that failed
        operation: String,
        /// Description of the failure
        reason: String,
    },
}

impl TrixError {
    /// Wraps a failed homeserver request.
    pub fn network(operation: &str, target: impl Display, source: impl Into<BoxError>) -> Self {
        TrixError::Network {
            operation: operation.to_owned(),
            target: target.to_string(),
            source: source.into(),
        }
    }

    /// Wraps a failed credential store operation.
    pub fn storage(account: &str, operation: &str, source: impl Into<BoxError>) -> Self {
        TrixError::Storage {
            account: account.to_owned(),
            operation: operation.to_owned(),
            source: source.into(),
        }
    }

    pub fn crypto(operation: &str, reason: impl Display) -> Self {
        TrixError::Crypto {
            operation: operation.to_owned(),
            reason: reason.to_string(),
        }
    }
}
