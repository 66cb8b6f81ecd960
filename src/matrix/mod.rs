//! Matrix protocol integration.
//!
//! This module provides the wire side of trix:
//! - Identity bootstrap: login, device keys and cross-signing
//! - The [`client::SessionClient`] operations used by the send path
//! - Background synchronization forwarding membership changes
//!
//! # Architecture
//!
//! The module is structured around the [`client::MatrixClient`] which combines:
//! - **Matrix SDK**: login, logout, room aliases, joins, members and sync
//! - **Requester**: typed ruma requests sent through the SDK client for the key
//!   and send endpoints carrying key material and ciphertext
//!
//! # Examples
//!
//! ```no_run
//! use trix::matrix::{UserCredentials, encryption::bootstrap};
//! use trix::store::CredentialStore;
//!
//! # async fn example() -> Result<(), trix::error::TrixError> {
//! let credentials = UserCredentials {
//!     host: "https://matrix.example.org".to_owned(),
//!     user: "bot".to_owned(),
//!     password: "password".to_owned(),
//! };
//! let store = CredentialStore::open("./data", "@bot:matrix.example.org", "passphrase").await?;
//! let identity = bootstrap(&credentials, &store, "passphrase", Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod encryption;
pub mod requester;
pub mod sync;

pub use crate::matrix::client::MatrixClient;

/// User credentials for a Matrix account
#[derive(Debug, Clone)]
pub struct UserCredentials {
    /// Homeserver url, e.g. `http://localhost:8008`
    pub host: String,
    /// Local part or full user id of the matrix account
    pub user: String,
    /// Password of the matrix account
    pub password: String,
}
