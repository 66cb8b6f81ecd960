use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use hkdf::Hkdf;
use log::{debug, info, trace};
use sha2::Sha256;
use tokio::{fs, sync::Mutex};

use crate::{error::TrixError, utils::account_dir_name};

/// Name of the records file inside the account directory.
const RECORDS_FILE: &str = "credentials.json";
/// HKDF info label for the pickle key.
const PICKLE_KEY_INFO: &[u8] = b"trix pickle key";

/// Key-value store for the key material of one account.
///
/// Each account owns a directory under the data directory, named from the
/// account key (see [`account_dir_name`]). The directory holds a JSON map of
/// base64 encoded records and, beside it, the Matrix SDK state store.
///
/// Every write is flushed to disk with a temp-file-and-rename, so a record written
/// before [`CredentialStore::close`] is visible to the next
/// [`CredentialStore::open`] of the same account. Reads and writes go through an
/// async mutex and can be issued concurrently from several tasks.
///
/// # Examples
///
/// ```no_run
/// use trix::store::CredentialStore;
///
/// # async fn example() -> Result<(), trix::error::TrixError> {
/// let store = CredentialStore::open("/tmp/trix", "@bot:localhost", "passphrase").await?;
/// store.write("device_id", b"TRIXDEVICE").await?;
/// assert_eq!(store.read("device_id").await?, Some(b"TRIXDEVICE".to_vec()));
/// store.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct CredentialStore {
    /// Account key, e.g. `@bot:localhost:8008`
    account: String,
    /// Directory of the account: `data_dir/<encoded account>`
    dir: PathBuf,
    /// Path of the records file: `dir/credentials.json`
    records_path: PathBuf,
    /// Key used to encrypt pickled Olm and Megolm state
    pickle_key: [u8; 32],
    /// Records, `None` once the store is closed
    records: Mutex<Option<BTreeMap<String, String>>>,
}

impl CredentialStore {
    /// Opens the store of `account`, creating its directory on first use.
    ///
    /// # Errors
    ///
    /// Returns [`TrixError::Storage`] if the directory cannot be created or the
    /// records file exists but cannot be read or parsed.
    pub async fn open(data_dir: &str, account: &str, passphrase: &str) -> Result<Self, TrixError> {
        let dir: PathBuf = [data_dir, &account_dir_name(account)].iter().collect();
        debug!("open credential store at {}", dir.display());

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TrixError::storage(account, "create store directory", e))?;

        let records_path = dir.join(RECORDS_FILE);
        let records: BTreeMap<String, String> = match fs::read_to_string(&records_path).await {
            Ok(serialized) => serde_json::from_str(&serialized)
                .map_err(|e| TrixError::storage(account, "parse records", e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("no credentials found for {account}, starting with an empty store");
                BTreeMap::new()
            }
            Err(e) => return Err(TrixError::storage(account, "read records", e)),
        };

        let pickle_key = derive_pickle_key(account, passphrase)?;

        Ok(CredentialStore {
            account: account.to_owned(),
            dir,
            records_path,
            pickle_key,
            records: Mutex::new(Some(records)),
        })
    }

    /// Returns the account key the store belongs to.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns the account directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the key protecting pickled Olm and Megolm state.
    pub fn pickle_key(&self) -> &[u8; 32] {
        &self.pickle_key
    }

    /// Reads the record stored under `key`.
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, TrixError> {
        let records = self.records.lock().await;
        let records = records.as_ref().ok_or_else(|| self.closed())?;

        let Some(encoded) = records.get(key) else {
            return Ok(None);
        };

        vodozemac::base64_decode(encoded)
            .map(Some)
            .map_err(|e| TrixError::storage(&self.account, &format!("decode {key}"), e))
    }

    /// Writes `value` under `key` and flushes the store to disk.
    pub async fn write(&self, key: &str, value: &[u8]) -> Result<(), TrixError> {
        trace!("write {key} to the credential store of {}", self.account);

        let mut records = self.records.lock().await;
        let records = records.as_mut().ok_or_else(|| self.closed())?;

        records.insert(key.to_owned(), vodozemac::base64_encode(value));
        self.flush(records, &format!("write {key}")).await
    }

    /// Removes the record stored under `key`, if any.
    pub async fn remove(&self, key: &str) -> Result<(), TrixError> {
        let mut records = self.records.lock().await;
        let records = records.as_mut().ok_or_else(|| self.closed())?;

        if records.remove(key).is_some() {
            self.flush(records, &format!("remove {key}")).await?;
        }
        Ok(())
    }

    /// Flushes and closes the store. Later operations fail with
    /// [`TrixError::StoreClosed`].
    pub async fn close(&self) -> Result<(), TrixError> {
        let mut records = self.records.lock().await;
        if let Some(open_records) = records.as_ref() {
            self.flush(open_records, "close").await?;
        }
        *records = None;

        debug!("credential store of {} closed", self.account);
        Ok(())
    }

    /// Closes the store and deletes the account directory.
    ///
    /// Stores of other accounts under the same data directory are untouched.
    pub async fn destroy(self) -> Result<(), TrixError> {
        *self.records.lock().await = None;

        fs::remove_dir_all(&self.dir)
            .await
            .map_err(|e| TrixError::storage(&self.account, "remove store directory", e))?;

        info!("credential store of {} removed", self.account);
        Ok(())
    }

    async fn flush(
        &self,
        records: &BTreeMap<String, String>,
        operation: &str,
    ) -> Result<(), TrixError> {
        let serialized = serde_json::to_string(records)
            .map_err(|e| TrixError::storage(&self.account, operation, e))?;

        let tmp_path = self.records_path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized)
            .await
            .map_err(|e| TrixError::storage(&self.account, operation, e))?;
        fs::rename(&tmp_path, &self.records_path)
            .await
            .map_err(|e| TrixError::storage(&self.account, operation, e))
    }

    fn closed(&self) -> TrixError {
        TrixError::StoreClosed {
            account: self.account.clone(),
        }
    }
}

/// Derives the pickle key from the store passphrase, salted with the account key.
fn derive_pickle_key(account: &str, passphrase: &str) -> Result<[u8; 32], TrixError> {
    let hkdf = Hkdf::<Sha256>::new(Some(account.as_bytes()), passphrase.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(PICKLE_KEY_INFO, &mut key)
        .map_err(|e| TrixError::crypto("derive pickle key", e))?;
    Ok(key)
}
