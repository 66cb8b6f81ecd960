//! Durable storage of the sender's key material.
//!
//! The [`CredentialStore`] is the only component that touches the files holding
//! identity keys, pairwise Olm sessions and outbound group sessions. Every other
//! component reads and writes through its operations.

mod credential_store;

pub use crate::store::credential_store::CredentialStore;
