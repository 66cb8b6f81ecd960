//! Encrypt-and-send of one text message.
//!
//! The [`MessageDispatcher`] never sends plaintext: the content is encrypted with
//! the room's group session, and a missing, unshared or expired session is
//! repaired exactly once before giving up with [`TrixError::SessionRepair`].

use std::sync::Arc;

use log::{debug, info};
use matrix_sdk::ruma::{
    OwnedEventId, OwnedRoomId, RoomAliasId, RoomId,
    events::room::message::RoomMessageEventContent,
};
use serde_json::Value;

use crate::{
    crypto::{EncryptOutcome, RoomEncryptor},
    error::TrixError,
    matrix::client::SessionClient,
};

/// Resolves a room alias (`#alias:server`) or passes a room id (`!id:server`)
/// through.
///
/// # Errors
///
/// Returns [`TrixError::InvalidRoom`] for anything else, and the error of the
/// alias lookup if it fails.
pub async fn resolve_room<C: SessionClient>(client: &C, room: &str) -> Result<OwnedRoomId, TrixError> {
    if room.starts_with('#') {
        let alias =
            RoomAliasId::parse(room).map_err(|_| TrixError::InvalidRoom(room.to_owned()))?;
        client.resolve_alias(&alias).await
    } else if room.starts_with('!') {
        RoomId::parse(room).map_err(|_| TrixError::InvalidRoom(room.to_owned()))
    } else {
        Err(TrixError::InvalidRoom(room.to_owned()))
    }
}

/// Content of an `m.room.message` text event, with an HTML rendition of `text`.
pub fn message_content(text: &str) -> Result<Value, TrixError> {
    let html = escape_html(text).replace('\n', "<br>");
    let content = RoomMessageEventContent::text_html(text, html);
    serde_json::to_value(&content).map_err(|e| TrixError::crypto("encode message content", e))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Sends encrypted text messages.
pub struct MessageDispatcher<C: SessionClient, E: RoomEncryptor> {
    client: Arc<C>,
    encryptor: E,
}

impl<C: SessionClient, E: RoomEncryptor> MessageDispatcher<C, E> {
    pub fn new(client: Arc<C>, encryptor: E) -> Self {
        MessageDispatcher { client, encryptor }
    }

    /// Encrypts `text` for `room` and sends it, returning the event id.
    ///
    /// The room is resolved before anything is encrypted, so an unknown alias
    /// never triggers a key share.
    pub async fn send(&self, room: &str, text: &str) -> Result<OwnedEventId, TrixError> {
        let room_id = resolve_room(self.client.as_ref(), room).await?;
        let content = message_content(text)?;

        let encrypted = match self.encryptor.encrypt(&room_id, &content).await? {
            EncryptOutcome::Encrypted(encrypted) => encrypted,
            EncryptOutcome::NeedsSession(signal) => {
                info!("{signal} in {room_id}, sharing a new group session");
                match self.encryptor.share_and_encrypt(&room_id, &content).await? {
                    EncryptOutcome::Encrypted(encrypted) => encrypted,
                    EncryptOutcome::NeedsSession(signal) => {
                        return Err(TrixError::SessionRepair {
                            room: room_id.to_string(),
                            signal,
                        });
                    }
                }
            }
        };

        debug!("sending with group session {}", encrypted.session_id);
        self.client.send_encrypted(&room_id, &encrypted).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::{
        crypto::{
            MockRoomEncryptor, SessionSignal, SystemClock,
            group_session::MegolmContent,
            manager::{EncryptionPolicy, GroupSessionManager},
            olm::OlmIdentity,
        },
        matrix::client::MockSessionClient,
        store::CredentialStore,
    };
    use matrix_sdk::ruma::{device_id, event_id, room_id, user_id};
    use tempfile::TempDir;
    use tokio::sync::mpsc::unbounded_channel;

    fn ciphertext() -> MegolmContent {
        MegolmContent {
            algorithm: "m.megolm.v1.aes-sha2".to_owned(),
            sender_key: "sender".to_owned(),
            ciphertext: "AwgAEhAB".to_owned(),
            session_id: "session".to_owned(),
            device_id: "TRIX".to_owned(),
        }
    }

    fn client_sending() -> MockSessionClient {
        let mut client = MockSessionClient::new();
        client
            .expect_send_encrypted()
            .times(1)
            .returning(|_, _| Ok(event_id!("$event:localhost").to_owned()));
        client
    }

    #[test]
    fn test_message_content() {
        let content = message_content("a < b & \"c\"\nnext line").unwrap();

        assert_eq!(content["msgtype"], "m.text");
        assert_eq!(content["body"], "a < b & \"c\"\nnext line");
        assert_eq!(content["format"], "org.matrix.custom.html");
        assert_eq!(
            content["formatted_body"],
            "a &lt; b &amp; &quot;c&quot;<br>next line"
        );
    }

    #[tokio::test]
    async fn test_invalid_room() {
        let client = MockSessionClient::new();

        let result = resolve_room(&client, "room:localhost").await;

        assert!(matches!(result, Err(TrixError::InvalidRoom(_))));
    }

    #[tokio::test]
    async fn test_room_id_passes_through() {
        let client = MockSessionClient::new();

        let room_id = resolve_room(&client, "!room:localhost").await.unwrap();

        assert_eq!(room_id, room_id!("!room:localhost"));
    }

    #[tokio::test]
    async fn test_send_with_current_session() {
        let mut encryptor = MockRoomEncryptor::new();
        encryptor
            .expect_encrypt()
            .times(1)
            .returning(|_, _| Ok(EncryptOutcome::Encrypted(ciphertext())));
        encryptor.expect_share_and_encrypt().times(0);
        let dispatcher = MessageDispatcher::new(Arc::new(client_sending()), encryptor);

        let event_id = dispatcher.send("!room:localhost", "hello").await.unwrap();

        assert_eq!(event_id, event_id!("$event:localhost"));
    }

    #[tokio::test]
    async fn test_missing_session_is_repaired_once() {
        let mut encryptor = MockRoomEncryptor::new();
        encryptor
            .expect_encrypt()
            .times(1)
            .returning(|_, _| Ok(EncryptOutcome::NeedsSession(SessionSignal::NoGroupSession)));
        encryptor
            .expect_share_and_encrypt()
            .times(1)
            .returning(|_, _| Ok(EncryptOutcome::Encrypted(ciphertext())));
        let dispatcher = MessageDispatcher::new(Arc::new(client_sending()), encryptor);

        dispatcher.send("!room:localhost", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_second_signal_is_fatal() {
        let mut encryptor = MockRoomEncryptor::new();
        encryptor
            .expect_encrypt()
            .times(1)
            .returning(|_, _| Ok(EncryptOutcome::NeedsSession(SessionSignal::SessionExpired)));
        encryptor
            .expect_share_and_encrypt()
            .times(1)
            .returning(|_, _| Ok(EncryptOutcome::NeedsSession(SessionSignal::SessionNotShared)));
        let mut client = MockSessionClient::new();
        client.expect_send_encrypted().times(0);
        let dispatcher = MessageDispatcher::new(Arc::new(client), encryptor);

        let error = dispatcher.send("!room:localhost", "hello").await.unwrap_err();

        assert!(matches!(
            error,
            TrixError::SessionRepair {
                signal: SessionSignal::SessionNotShared,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_alias_is_resolved_first() {
        let mut client = client_sending();
        client
            .expect_resolve_alias()
            .withf(|alias| alias.as_str() == "#team:localhost")
            .times(1)
            .returning(|_| Ok(room_id!("!team:localhost").to_owned()));
        let mut encryptor = MockRoomEncryptor::new();
        encryptor
            .expect_encrypt()
            .withf(|room_id, _| room_id.as_str() == "!team:localhost")
            .times(1)
            .returning(|_, _| Ok(EncryptOutcome::Encrypted(ciphertext())));
        let dispatcher = MessageDispatcher::new(Arc::new(client), encryptor);

        dispatcher.send("#team:localhost", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_alias_failure_stops_before_encryption() {
        let mut client = MockSessionClient::new();
        client
            .expect_resolve_alias()
            .times(1)
            .returning(|alias| Err(TrixError::network("resolve alias", alias, "M_NOT_FOUND")));
        client.expect_send_encrypted().times(0);
        let mut encryptor = MockRoomEncryptor::new();
        encryptor.expect_encrypt().times(0);
        encryptor.expect_share_and_encrypt().times(0);
        let dispatcher = MessageDispatcher::new(Arc::new(client), encryptor);

        let error = dispatcher.send("#team:localhost", "hello").await.unwrap_err();

        assert_eq!(
            error.to_string(),
            "resolve alias failed for #team:localhost: M_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_plaintext_never_reaches_the_wire() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().to_string_lossy().to_string();
        let store = Arc::new(
            CredentialStore::open(&data_dir, "@trix:localhost", "passphrase")
                .await
                .unwrap(),
        );
        let identity = Arc::new(
            OlmIdentity::load_or_create(
                &store,
                user_id!("@trix:localhost").to_owned(),
                device_id!("TRIX").to_owned(),
            )
            .await
            .unwrap(),
        );

        let wire: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let mut client = MockSessionClient::new();
        client
            .expect_joined_members()
            .returning(|_| Ok(vec![user_id!("@trix:localhost").to_owned()]));
        client.expect_query_devices().returning(|_| Ok(vec![]));
        let sent = Arc::clone(&wire);
        client.expect_send_encrypted().times(1).returning(move |_, content| {
            sent.lock()
                .unwrap()
                .push(serde_json::to_string(content).unwrap());
            Ok(event_id!("$event:localhost").to_owned())
        });
        let client = Arc::new(client);

        let (_sender, updates) = unbounded_channel();
        let manager = GroupSessionManager::new(
            Arc::clone(&client),
            identity,
            store,
            SystemClock,
            EncryptionPolicy::default(),
            updates,
        );
        let dispatcher = MessageDispatcher::new(client, manager);

        dispatcher
            .send("!room:localhost", "top secret text")
            .await
            .unwrap();

        let wire = wire.lock().unwrap();
        assert_eq!(wire.len(), 1);
        assert!(wire[0].contains("m.megolm.v1.aes-sha2"));
        assert!(!wire[0].contains("top secret text"));
    }
}
