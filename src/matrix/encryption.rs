//! Identity bootstrap: login, device keys and cross-signing.
//!
//! This module handles the start of every run:
//! - Login with the persisted device id, so the device keeps its identity
//! - Restoration or creation of the Olm account bound to that device
//! - Publication of the device keys and top-up of the one-time keys
//! - Provisioning of the cross-signing keys
//!
//! # Overview
//!
//! The Matrix SDK is only used for login and room state. The device keys belong
//! to the [`OlmIdentity`] stored in the [`CredentialStore`], and are published
//! through the [`KeysRequester`]. Cross-signing is best effort: any failure other
//! than a storage failure is reported as [`CrossSigningOutcome::Skipped`] and the
//! message is still sent.

use std::collections::BTreeSet;

use log::{debug, error, info, warn};
use matrix_sdk::{
    Client,
    ruma::api::client::{
        keys::get_keys,
        uiaa::{AuthData, Password, UserIdentifier},
    },
};
use serde_json::Map;

use crate::{
    crypto::{
        cross_signing::{CROSS_SIGNING_KEY, CrossSigningBundle, CrossSigningOutcome, SkipReason},
        device::BlockedDevice,
        olm::OlmIdentity,
        signing::verify_json,
    },
    error::TrixError,
    matrix::{
        UserCredentials,
        client::MatrixClient,
        requester::{KeysRequester, SigningUpload, raw_json},
    },
    store::CredentialStore,
};

/// Store key of the device id returned at the first login.
const DEVICE_ID_KEY: &str = "device_id";
/// Display name of the device created at login.
const DEVICE_DISPLAY_NAME: &str = "trix";

/// Everything the send path needs once bootstrapped.
pub struct Identity {
    pub client: MatrixClient,
    pub olm: OlmIdentity,
    pub cross_signing: CrossSigningOutcome,
}

/// Logs in and makes the device ready to send encrypted messages.
///
/// # Arguments
///
/// * `credentials` - Homeserver, user and password
/// * `store` - Credential store of the account
/// * `store_passphrase` - Passphrase of the Matrix SDK state store
/// * `blocked_devices` - Devices that never receive room keys
///
/// # Errors
///
/// Returns [`TrixError::Authentication`] if the login is rejected, and
/// [`TrixError::Network`], [`TrixError::Storage`] or [`TrixError::Crypto`] if
/// the device keys cannot be restored or published.
///
/// # Examples
///
/// ```no_run
/// use trix::matrix::{UserCredentials, encryption::bootstrap};
/// use trix::store::CredentialStore;
///
/// # async fn example() -> Result<(), trix::error::TrixError> {
/// let credentials = UserCredentials {
///     host: "http://localhost:8008".to_owned(),
///     user: "bot".to_owned(),
///     password: "bot".to_owned(),
/// };
/// let store = CredentialStore::open("/tmp/trix", "@bot:localhost:8008", "passphrase").await?;
/// let identity = bootstrap(&credentials, &store, "passphrase", Default::default()).await?;
/// println!("cross-signing {}", identity.cross_signing);
/// # Ok(())
/// # }
/// ```
pub async fn bootstrap(
    credentials: &UserCredentials,
    store: &CredentialStore,
    store_passphrase: &str,
    blocked_devices: BTreeSet<BlockedDevice>,
) -> Result<Identity, TrixError> {
    info!("bootstrapping {} on {}", credentials.user, credentials.host);

    let client = Client::builder()
        .homeserver_url(&credentials.host)
        .sqlite_store(store.dir().join("sqlite"), Some(store_passphrase))
        .build()
        .await
        .map_err(|e| TrixError::network("build client", &credentials.host, e))?;
    debug!("matrix client created");

    let stored_device_id = match store.read(DEVICE_ID_KEY).await? {
        Some(bytes) => Some(
            String::from_utf8(bytes)
                .map_err(|e| TrixError::storage(store.account(), "decode device_id", e))?,
        ),
        None => None,
    };

    let mut login = client
        .matrix_auth()
        .login_username(&credentials.user, &credentials.password)
        .initial_device_display_name(DEVICE_DISPLAY_NAME);
    if let Some(device_id) = &stored_device_id {
        debug!("reusing device {device_id}");
        login = login.device_id(device_id);
    }
    let response = login.send().await.map_err(|e| {
        error!("login of {} failed", credentials.user);
        TrixError::Authentication {
            user: credentials.user.clone(),
            source: e.into(),
        }
    })?;
    info!("logged in as {} with device {}", response.user_id, response.device_id);

    store
        .write(DEVICE_ID_KEY, response.device_id.as_str().as_bytes())
        .await?;

    let requester = KeysRequester::new(client.clone());

    let mut olm = OlmIdentity::load_or_create(store, response.user_id, response.device_id).await?;
    publish_keys(&requester, &mut olm, store).await?;

    let cross_signing = setup_cross_signing(&requester, &olm, store, &credentials.password).await?;
    info!("cross-signing {cross_signing}");

    Ok(Identity {
        client: MatrixClient::new(client, requester, blocked_devices),
        olm,
        cross_signing,
    })
}

/// Uploads the device keys when the server copy is missing or stale, then tops
/// up the one-time keys to half of what the account can hold.
async fn publish_keys(
    requester: &KeysRequester,
    olm: &mut OlmIdentity,
    store: &CredentialStore,
) -> Result<(), TrixError> {
    let user_id = olm.user_id().clone();
    let device_id = olm.device_id().to_owned();
    let device_keys = olm.device_keys()?;

    let published = requester.query_keys(&[user_id.clone()]).await?;
    let published_keys = published
        .device_keys
        .get(&user_id)
        .and_then(|devices| devices.get(&device_id))
        .and_then(raw_json);

    let upload_device_keys =
        published_keys.as_ref().and_then(|keys| keys.get("keys")) != device_keys.get("keys");
    if upload_device_keys {
        info!("publishing device keys of {device_id}");
    }

    let count = requester
        .upload_keys(upload_device_keys.then_some(&device_keys), &Map::new())
        .await?;

    let target = (olm.max_one_time_keys() / 2) as u64;
    debug!("{count} one-time keys on the server, target {target}");

    if count < target {
        let one_time_keys = olm.generate_one_time_keys((target - count) as usize)?;
        requester.upload_keys(None, &one_time_keys).await?;
        olm.mark_keys_as_published();
        olm.persist(store).await?;
    }

    Ok(())
}

/// Provisions cross-signing, turning every non-storage failure into a skip.
async fn setup_cross_signing(
    requester: &KeysRequester,
    olm: &OlmIdentity,
    store: &CredentialStore,
    password: &str,
) -> Result<CrossSigningOutcome, TrixError> {
    match provision_cross_signing(requester, olm, store, password).await {
        Ok(outcome) => Ok(outcome),
        Err(e @ (TrixError::Storage { .. } | TrixError::StoreClosed { .. })) => Err(e),
        Err(e) => {
            warn!("cross-signing skipped: {e}");
            Ok(CrossSigningOutcome::Skipped(SkipReason::Failed(
                e.to_string(),
            )))
        }
    }
}

async fn provision_cross_signing(
    requester: &KeysRequester,
    olm: &OlmIdentity,
    store: &CredentialStore,
    password: &str,
) -> Result<CrossSigningOutcome, TrixError> {
    let user_id = olm.user_id().as_str();
    let local = match store.read(CROSS_SIGNING_KEY).await? {
        Some(record) => Some(CrossSigningBundle::from_record(&record)?),
        None => None,
    };

    let keys = requester.query_keys(&[olm.user_id().clone()]).await?;

    let master_key = keys.master_keys.get(olm.user_id()).and_then(raw_json);

    match (local, master_key) {
        (Some(bundle), Some(master_key)) if bundle.matches_remote(&master_key) => {
            if !is_device_signed(&keys, olm, &bundle) {
                debug!("signing device {} again", olm.device_id());
                sign_device(requester, olm, &bundle).await?;
            }
            Ok(CrossSigningOutcome::AlreadyPresent)
        }
        (_, Some(_)) => {
            info!("{user_id} already has a master key created by another device");
            Ok(CrossSigningOutcome::Skipped(SkipReason::RemoteExists))
        }
        (local, None) => {
            let bundle = local.unwrap_or_else(CrossSigningBundle::generate);
            upload_signing_keys(requester, &bundle, user_id, password).await?;
            store.write(CROSS_SIGNING_KEY, &bundle.to_record()?).await?;
            sign_device(requester, olm, &bundle).await?;
            Ok(CrossSigningOutcome::Published)
        }
    }
}

/// Uploads the cross-signing keys, answering a user-interactive auth request
/// with the account password.
async fn upload_signing_keys(
    requester: &KeysRequester,
    bundle: &CrossSigningBundle,
    user_id: &str,
    password: &str,
) -> Result<(), TrixError> {
    debug!("setting up cross signing");
    let body = bundle.upload_body(user_id)?;

    let SigningUpload::AuthRequired { session } = requester.upload_signing_keys(&body, None).await?
    else {
        return Ok(());
    };

    let mut auth = Password::new(
        UserIdentifier::UserIdOrLocalpart(user_id.to_owned()),
        password.to_owned(),
    );
    auth.session = session;
    match requester
        .upload_signing_keys(&body, Some(AuthData::Password(auth)))
        .await? {
        SigningUpload::Done => {
            debug!("cross signing set up");
            Ok(())
        }
        SigningUpload::AuthRequired { .. } => Err(TrixError::Authentication {
            user: user_id.to_owned(),
            source: "password rejected for the cross-signing upload".into(),
        }),
    }
}

async fn sign_device(
    requester: &KeysRequester,
    olm: &OlmIdentity,
    bundle: &CrossSigningBundle,
) -> Result<(), TrixError> {
    let signatures = bundle.sign_device(
        olm.user_id().as_str(),
        olm.device_id().as_str(),
        &olm.device_keys()?,
    )?;
    requester.upload_signatures(&signatures).await
}

/// Whether the server copy of our device keys carries a self-signing signature.
fn is_device_signed(
    keys: &get_keys::v3::Response,
    olm: &OlmIdentity,
    bundle: &CrossSigningBundle,
) -> bool {
    let self_signing_key = bundle.self_signing_key();

    keys.device_keys
        .get(olm.user_id())
        .and_then(|devices| devices.get(olm.device_id()))
        .and_then(raw_json)
        .is_some_and(|device_keys| {
            verify_json(
                &device_keys,
                olm.user_id().as_str(),
                &format!("ed25519:{}", self_signing_key.to_base64()),
                &self_signing_key,
            )
            .is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::requester::tests::logged_in_client;
    use matrix_sdk::ruma::{device_id, user_id};
    use mockito::{Matcher, Server};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup(server: &Server) -> (TempDir, CredentialStore, OlmIdentity, KeysRequester) {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().to_string_lossy().to_string();
        let store = CredentialStore::open(&data_dir, "@trix:localhost", "passphrase")
            .await
            .unwrap();
        let olm = OlmIdentity::load_or_create(
            &store,
            user_id!("@trix:localhost").to_owned(),
            device_id!("TRIX").to_owned(),
        )
        .await
        .unwrap();
        let requester = KeysRequester::new(logged_in_client(server).await);
        (temp_dir, store, olm, requester)
    }

    #[tokio::test]
    async fn test_publish_uploads_device_keys_and_one_time_keys() {
        let mut server = Server::new_async().await;
        let (_temp_dir, store, mut olm, requester) = setup(&server).await;

        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let device_keys_upload = server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .match_body(Matcher::PartialJson(json!({
                "device_keys": {"device_id": "TRIX", "user_id": "@trix:localhost"},
            })))
            .with_status(200)
            .with_body(r#"{"one_time_key_counts": {}}"#)
            .expect(1)
            .create_async()
            .await;
        let one_time_keys_upload = server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .with_status(200)
            .with_body(r#"{"one_time_key_counts": {"signed_curve25519": 50}}"#)
            .expect(1)
            .create_async()
            .await;

        publish_keys(&requester, &mut olm, &store).await.unwrap();

        device_keys_upload.assert_async().await;
        one_time_keys_upload.assert_async().await;
        assert!(olm.generate_one_time_keys(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_skips_current_keys() {
        let mut server = Server::new_async().await;
        let (_temp_dir, store, mut olm, requester) = setup(&server).await;
        let published = json!({
            "device_keys": {"@trix:localhost": {"TRIX": olm.device_keys().unwrap()}},
        });
        let full = olm.max_one_time_keys() / 2;

        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_body(published.to_string())
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/_matrix/client/v3/keys/upload")
            .match_body(Matcher::Json(json!({})))
            .with_status(200)
            .with_body(json!({"one_time_key_counts": {"signed_curve25519": full}}).to_string())
            .expect(1)
            .create_async()
            .await;

        publish_keys(&requester, &mut olm, &store).await.unwrap();

        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_cross_signing_published_after_password_auth() {
        let mut server = Server::new_async().await;
        let (_temp_dir, store, olm, requester) = setup(&server).await;

        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        server
            .mock("POST", "/_matrix/client/v3/keys/device_signing/upload")
            .with_status(401)
            .with_body(r#"{"session": "uia", "flows": [{"stages": ["m.login.password"]}]}"#)
            .expect(1)
            .create_async()
            .await;
        let authenticated = server
            .mock("POST", "/_matrix/client/v3/keys/device_signing/upload")
            .match_body(Matcher::PartialJson(json!({
                "auth": {"type": "m.login.password", "password": "secret", "session": "uia"},
            })))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;
        let signatures = server
            .mock("POST", "/_matrix/client/v3/keys/signatures/upload")
            .match_body(Matcher::PartialJson(json!({
                "@trix:localhost": {"TRIX": {"device_id": "TRIX"}},
            })))
            .with_status(200)
            .with_body(r#"{"failures": {}}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = setup_cross_signing(&requester, &olm, &store, "secret")
            .await
            .unwrap();

        assert_eq!(outcome, CrossSigningOutcome::Published);
        authenticated.assert_async().await;
        signatures.assert_async().await;
        assert!(store.read(CROSS_SIGNING_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cross_signing_skipped_when_remote_exists() {
        let mut server = Server::new_async().await;
        let (_temp_dir, store, olm, requester) = setup(&server).await;

        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_body(
                r#"{"master_keys": {"@trix:localhost": {"user_id": "@trix:localhost", "usage": ["master"], "keys": {"ed25519:abc": "abc"}}}}"#,
            )
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/_matrix/client/v3/keys/device_signing/upload")
            .expect(0)
            .create_async()
            .await;

        let outcome = setup_cross_signing(&requester, &olm, &store, "secret")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CrossSigningOutcome::Skipped(SkipReason::RemoteExists)
        );
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_cross_signing_failure_is_not_fatal() {
        let mut server = Server::new_async().await;
        let (_temp_dir, store, olm, requester) = setup(&server).await;

        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        server
            .mock("POST", "/_matrix/client/v3/keys/device_signing/upload")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let outcome = setup_cross_signing(&requester, &olm, &store, "secret")
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            CrossSigningOutcome::Skipped(SkipReason::Failed(_))
        ));
        assert!(store.read(CROSS_SIGNING_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cross_signing_already_present() {
        let mut server = Server::new_async().await;
        let (_temp_dir, store, olm, requester) = setup(&server).await;
        let bundle = CrossSigningBundle::generate();
        store
            .write(CROSS_SIGNING_KEY, &bundle.to_record().unwrap())
            .await
            .unwrap();
        let signed_device = bundle
            .sign_device("@trix:localhost", "TRIX", &olm.device_keys().unwrap())
            .unwrap();
        let body = json!({
            "master_keys": {
                "@trix:localhost": bundle.upload_body("@trix:localhost").unwrap()["master_key"],
            },
            "device_keys": signed_device,
        });

        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;
        let signatures = server
            .mock("POST", "/_matrix/client/v3/keys/signatures/upload")
            .expect(0)
            .create_async()
            .await;

        let outcome = setup_cross_signing(&requester, &olm, &store, "secret")
            .await
            .unwrap();

        assert_eq!(outcome, CrossSigningOutcome::AlreadyPresent);
        signatures.assert_async().await;
    }

    #[tokio::test]
    async fn test_closed_store_is_fatal() {
        let server = Server::new_async().await;
        let (_temp_dir, store, olm, requester) = setup(&server).await;
        store.close().await.unwrap();

        let result = setup_cross_signing(&requester, &olm, &store, "secret").await;

        assert!(matches!(result, Err(TrixError::StoreClosed { .. })));
    }
}
