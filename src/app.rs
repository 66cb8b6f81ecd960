//! One run of trix: bootstrap, send, shut down.
//!
//! The [`App`] drives the foreground of a run:
//!
//! ```text
//! open store → bootstrap identity → resolve + join room → spawn sync
//!            → check the stored session against the members
//!            → encrypt + send → stop sync → logout → close store
//! ```
//!
//! Shutdown steps run whether the send succeeded or not. A failed logout is only
//! logged, the outcome of the send is what the caller gets back.

use std::sync::Arc;

use log::{info, warn};
use matrix_sdk::ruma::OwnedEventId;
use tokio::sync::mpsc::unbounded_channel;

use crate::{
    config::{Config, Message},
    crypto::{SystemClock, manager::GroupSessionManager, olm::OlmIdentity},
    dispatcher::{MessageDispatcher, resolve_room},
    error::TrixError,
    matrix::{
        MatrixClient,
        client::SessionClient,
        encryption::{Identity, bootstrap},
        sync::MatrixSync,
    },
    store::CredentialStore,
    utils::account_id,
};

/// A single send.
pub struct App {
    config: Config,
    /// Remove the credential store of the account at exit
    ephemeral: bool,
}

impl App {
    pub fn new(config: Config, ephemeral: bool) -> Self {
        App { config, ephemeral }
    }

    /// Sends `message` encrypted and returns its event id.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`TrixError`] of the run. The store is closed in
    /// every case; with `ephemeral` it is removed as well.
    pub async fn run(&self, message: &Message) -> Result<OwnedEventId, TrixError> {
        let account = account_id(&self.config.matrix.user, &self.config.matrix.host)?;
        let store = Arc::new(
            CredentialStore::open(
                &self.config.store.path,
                &account,
                &self.config.store.passphrase,
            )
            .await?,
        );

        let result = self.login_and_send(&store, message).await;

        if let Err(e) = store.close().await {
            warn!("failed to close the credential store: {e}");
        }
        if self.ephemeral {
            match Arc::try_unwrap(store) {
                Ok(store) => {
                    if let Err(e) = store.destroy().await {
                        warn!("failed to remove the credential store: {e}");
                    }
                }
                Err(_) => warn!("credential store still in use, not removed"),
            }
        }

        result
    }

    async fn login_and_send(
        &self,
        store: &Arc<CredentialStore>,
        message: &Message,
    ) -> Result<OwnedEventId, TrixError> {
        let Identity {
            client,
            olm,
            cross_signing,
        } = bootstrap(
            &self.config.credentials(),
            store,
            &self.config.store.passphrase,
            self.config.encryption.blocked_devices.clone(),
        )
        .await?;
        info!("device ready, cross-signing {cross_signing}");

        let client = Arc::new(client);
        let result = self.send(&client, olm, store, message).await;

        if let Err(e) = client.logout().await {
            warn!("{e}");
        }

        result
    }

    async fn send(
        &self,
        client: &Arc<MatrixClient>,
        olm: OlmIdentity,
        store: &Arc<CredentialStore>,
        message: &Message,
    ) -> Result<OwnedEventId, TrixError> {
        let room_id = resolve_room(client.as_ref(), &message.room).await?;
        client.join_room(&room_id).await?;

        let (updates_sender, updates) = unbounded_channel();
        let sync = MatrixSync::new(client.sdk(), updates_sender).spawn();

        let manager = GroupSessionManager::new(
            Arc::clone(client),
            Arc::new(olm),
            Arc::clone(store),
            SystemClock,
            self.config.encryption.policy(),
            updates,
        );
        let result = match manager.reconcile(&room_id).await {
            Ok(()) => {
                let dispatcher = MessageDispatcher::new(Arc::clone(client), manager);
                dispatcher.send(room_id.as_str(), &message.text).await
            }
            Err(e) => Err(e),
        };
        if let Ok(event_id) = &result {
            info!("sent {event_id} to {room_id}");
        }

        sync.stop().await;
        result
    }
}
