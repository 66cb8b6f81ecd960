//! Background synchronization with the homeserver.
//!
//! This module provides the [`MatrixSync`] struct. It runs the Matrix SDK sync
//! loop in a tokio task and forwards the membership changes it sees to the group
//! session manager over an unbounded channel, in the order they arrive.
//!
//! # Example
//!
//! ```no_run
//! use trix::matrix::sync::MatrixSync;
//! use matrix_sdk::Client;
//!
//! # async fn example(client: Client) {
//! let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
//! let handle = MatrixSync::new(&client, sender).spawn();
//! // ... encrypt and send ...
//! handle.stop().await;
//! # }
//! ```

use log::{debug, error, info, warn};
use matrix_sdk::{
    Client, LoopCtrl, Room,
    config::SyncSettings,
    ruma::{
        RoomId, UserId,
        api::client::filter::FilterDefinition,
        events::room::member::{MembershipState, SyncRoomMemberEvent},
    },
};
use tokio::{
    sync::{mpsc::UnboundedSender, oneshot},
    task::JoinHandle,
};

use crate::crypto::manager::MemberUpdate;

/// Sync loop forwarding membership changes.
pub struct MatrixSync {
    /// The matrix client
    client: Client,
    /// Sending half of the membership channel
    updates: UnboundedSender<MemberUpdate>,
}

/// Running sync task.
pub struct SyncHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MatrixSync {
    /// Creates a new MatrixSync instance.
    ///
    /// This does not start the synchronization; call [`MatrixSync::spawn`].
    pub fn new(client: &Client, updates: UnboundedSender<MemberUpdate>) -> Self {
        MatrixSync {
            client: client.to_owned(),
            updates,
        }
    }

    /// Starts the sync loop in a background task.
    pub fn spawn(self) -> SyncHandle {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(self.run(stopped));
        SyncHandle { stop, task }
    }

    async fn run(self, stopped: oneshot::Receiver<()>) {
        info!("start syncing");

        let updates = self.updates.clone();
        self.client
            .add_event_handler(move |event: SyncRoomMemberEvent, room: Room| {
                let updates = updates.clone();
                async move { on_member_event(event, room, &updates) }
            });

        // Enable room members lazy-loading
        // See <https://spec.matrix.org/v1.6/client-server-api/#lazy-loading-room-members>.
        let filter = FilterDefinition::with_lazy_loading();
        let sync_settings = SyncSettings::default().filter(filter.into());

        let sync = self
            .client
            .sync_with_result_callback(sync_settings, |sync_result| async move {
                let response = sync_result?;
                debug!("synced up to {}", response.next_batch);
                Ok(LoopCtrl::Continue)
            });

        tokio::select! {
            result = sync => match result {
                Ok(()) => info!("matrix sync ended"),
                Err(e) => error!("matrix sync ended with error: {e}"),
            },
            _ = stopped => debug!("matrix sync stopped"),
        }
    }
}

impl SyncHandle {
    /// Stops the sync loop and waits for the task to finish.
    pub async fn stop(self) {
        // The task may have ended on its own already.
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!("sync task did not end cleanly: {e}");
        }
    }
}

fn on_member_event(
    event: SyncRoomMemberEvent,
    room: Room,
    updates: &UnboundedSender<MemberUpdate>,
) {
    let Some(update) = member_update(room.room_id(), event.state_key(), event.membership()) else {
        return;
    };

    if updates.send(update).is_err() {
        debug!("membership channel closed, dropping update");
    }
}

/// Maps a membership change to the update the group session manager cares about.
fn member_update(
    room_id: &RoomId,
    user_id: &UserId,
    membership: &MembershipState,
) -> Option<MemberUpdate> {
    match membership {
        MembershipState::Join => Some(MemberUpdate::Joined {
            room_id: room_id.to_owned(),
            user_id: user_id.to_owned(),
        }),
        MembershipState::Leave | MembershipState::Ban => Some(MemberUpdate::Left {
            room_id: room_id.to_owned(),
            user_id: user_id.to_owned(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_sdk::ruma::{room_id, user_id};

    #[test]
    fn test_join_is_forwarded() {
        let update = member_update(
            room_id!("!room:localhost"),
            user_id!("@bob:localhost"),
            &MembershipState::Join,
        );
        assert_eq!(
            update,
            Some(MemberUpdate::Joined {
                room_id: room_id!("!room:localhost").to_owned(),
                user_id: user_id!("@bob:localhost").to_owned(),
            })
        );
    }

    #[test]
    fn test_leave_and_ban_are_forwarded_as_left() {
        for membership in [MembershipState::Leave, MembershipState::Ban] {
            let update = member_update(
                room_id!("!room:localhost"),
                user_id!("@bob:localhost"),
                &membership,
            );
            assert!(matches!(update, Some(MemberUpdate::Left { .. })));
        }
    }

    #[test]
    fn test_invite_is_ignored() {
        let update = member_update(
            room_id!("!room:localhost"),
            user_id!("@bob:localhost"),
            &MembershipState::Invite,
        );
        assert_eq!(update, None);
    }
}
