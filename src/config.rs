//! Configuration of trix.
//!
//! The configuration is loaded with [`figment`] from three layers, the last one
//! winning:
//!
//! 1. Built-in defaults
//! 2. An optional YAML file given with `--config`
//! 3. Environment variables prefixed with `TRIX_`, `__` separating sections
//!
//! Command line values are applied on top with [`Config::apply`].
//!
//! # Configuration File Format
//!
//! ```yaml
//! matrix:
//!   host: "http://localhost:8008"
//!   user: "bot"
//!   password: "bot"
//!
//! encryption:
//!   # Share room keys with devices lacking a cross-signing chain
//!   allow_unverified_devices: true
//!   # A group session is replaced after a week or 100 messages
//!   rotation_period_secs: 604800
//!   rotation_messages: 100
//!   # Devices that never receive room keys
//!   blocked_devices:
//!     - user_id: "@alice:localhost"
//!       device_id: "OLDPHONE"
//!
//! store:
//!   path: "/home/bot/tmp/trix"
//!   passphrase: "trix_is_for_kids"
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export TRIX_MATRIX__PASSWORD="secret-from-env"
//! export TRIX_STORE__PASSPHRASE="phrase-from-env"
//! ```

use std::{collections::BTreeSet, path::Path, time::Duration};

use anyhow::{Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{device::BlockedDevice, group_session::RotationPolicy, manager::EncryptionPolicy},
    matrix::UserCredentials,
    utils::get_path,
};

/// Passphrase of the stores when none is configured.
const DEFAULT_PASSPHRASE: &str = "trix_is_for_kids";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Matrix account
    pub matrix: Matrix,
    /// Key sharing policy
    pub encryption: Encryption,
    /// Credential store location
    pub store: Store,
}

/// Matrix account configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Matrix {
    /// Homeserver url, e.g. `https://matrix.example.org`
    pub host: String,
    /// Local part or full user id of the account
    pub user: String,
    /// Password of the account
    pub password: String,
}

/// Key sharing and group session rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Encryption {
    /// Share room keys with devices that are not cross-signed.
    ///
    /// Most clients never verify a bot, so refusing them would leave the
    /// message unreadable.
    pub allow_unverified_devices: bool,

    /// Maximum age of a group session, in seconds.
    pub rotation_period_secs: u64,

    /// Maximum number of messages encrypted with one group session.
    pub rotation_messages: u64,

    /// Devices that never receive room keys, as user and device id pairs.
    pub blocked_devices: BTreeSet<BlockedDevice>,
}

impl Default for Encryption {
    fn default() -> Self {
        let rotation = RotationPolicy::default();
        Encryption {
            allow_unverified_devices: true,
            rotation_period_secs: rotation.max_age.as_secs(),
            rotation_messages: rotation.max_messages,
            blocked_devices: BTreeSet::new(),
        }
    }
}

impl Encryption {
    pub fn policy(&self) -> EncryptionPolicy {
        EncryptionPolicy {
            rotation: RotationPolicy {
                max_age: Duration::from_secs(self.rotation_period_secs),
                max_messages: self.rotation_messages,
            },
            allow_unverified: self.allow_unverified_devices,
        }
    }
}

/// Credential store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Store {
    /// Directory holding one sub-directory per account.
    pub path: String,
    /// Passphrase the store keys are derived from.
    pub passphrase: String,
}

impl Default for Store {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());
        Store {
            path: get_path(&home, "tmp/trix"),
            passphrase: DEFAULT_PASSPHRASE.to_owned(),
        }
    }
}

/// Values given on the command line, overriding the configuration.
#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub data: Option<String>,
}

/// A validated message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub room: String,
    pub text: String,
}

impl Config {
    /// Loads the configuration from the defaults, the optional YAML file at
    /// `path` and the `TRIX_` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` does not exist or if a value has the wrong type.
    pub fn load(path: Option<&str>) -> Result<Config> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !Path::new(path).is_file() {
                bail!("config file {path} not found");
            }
            figment = figment.merge(Yaml::file(path));
        }

        let config = figment
            .merge(Env::prefixed("TRIX_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Applies the command line values.
    pub fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            host,
            user,
            password,
            data,
        } = overrides;

        if let Some(host) = host {
            self.matrix.host = host;
        }
        if let Some(user) = user {
            self.matrix.user = user;
        }
        if let Some(password) = password {
            self.matrix.password = password;
        }
        if let Some(data) = data {
            self.store.path = data;
        }
    }

    /// Checks the account settings and the message, reporting every problem at
    /// once.
    ///
    /// # Errors
    ///
    /// Returns an error listing the missing or invalid values.
    pub fn validate(&self, room: Option<String>, text: Option<String>) -> Result<Message> {
        let mut errors = Vec::new();

        if self.matrix.user.is_empty() {
            errors.push("missing user".to_owned());
        }
        if self.matrix.password.is_empty() {
            errors.push("missing password".to_owned());
        }

        let host = if self.matrix.host.is_empty() {
            errors.push("missing host".to_owned());
            None
        } else {
            match validate_host(&self.matrix.host) {
                Ok(url) => Some(url),
                Err(e) => {
                    errors.push(e);
                    None
                }
            }
        };

        let room = room.unwrap_or_default();
        if room.is_empty() {
            errors.push("missing room".to_owned());
        } else if let Some(host) = &host {
            if let Err(e) = validate_room(&room, host) {
                errors.push(e);
            }
        }

        let text = text.unwrap_or_default();
        if text.is_empty() {
            errors.push("missing text".to_owned());
        }

        if !errors.is_empty() {
            bail!("{}", errors.join(", "));
        }

        Ok(Message { room, text })
    }

    pub fn credentials(&self) -> UserCredentials {
        UserCredentials {
            host: self.matrix.host.clone(),
            user: self.matrix.user.clone(),
            password: self.matrix.password.clone(),
        }
    }
}

/// Checks that `host` is an absolute http(s) url with a host part.
fn validate_host(host: &str) -> Result<Url, String> {
    let url = Url::parse(host).map_err(|e| format!("invalid host {host}: {e}"))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("invalid host {host}: scheme must be http or https"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(format!("invalid host {host}: no host part"));
    }

    Ok(url)
}

/// Checks that `room` is a room id or alias living on the homeserver of `host`.
fn validate_room(room: &str, host: &Url) -> Result<(), String> {
    if !room.starts_with('#') && !room.starts_with('!') {
        return Err(format!("invalid room {room}: must start with # or !"));
    }

    // Url::host_str never includes the port
    let server = host.host_str().unwrap_or_default();
    if !room.ends_with(&format!(":{server}")) {
        return Err(format!("invalid room {room}: must end with :{server}"));
    }

    Ok(())
}
