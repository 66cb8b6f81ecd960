//! Utility functions for path handling and account naming.

use std::path::PathBuf;

use reqwest::Url;

use crate::error::TrixError;

/// Constructs a file system path by joining a directory path with a subdirectory.
///
/// # Examples
///
/// ```
/// # use trix::utils::get_path;
/// let path = get_path("/home/user", "tmp");
/// assert_eq!(path, "/home/user/tmp");
/// ```
pub fn get_path(dir_path: &str, subdir_path: &str) -> String {
    let path_buf: PathBuf = [dir_path, subdir_path].iter().collect();
    path_buf.to_string_lossy().into_owned()
}

/// Derives the account key of a (user, homeserver) pair.
///
/// The key is the fully qualified Matrix user id `@user:server`, where `server`
/// is the host part of the homeserver url, including its port when one is given.
/// A user that is already fully qualified is kept as is.
///
/// # Errors
///
/// Returns [`TrixError::InvalidHost`] if the homeserver is not an absolute url.
pub fn account_id(user: &str, host: &str) -> Result<String, TrixError> {
    if user.starts_with('@') && user.contains(':') {
        return Ok(user.to_owned());
    }

    let url = Url::parse(host).map_err(|_| TrixError::InvalidHost(host.to_owned()))?;
    let Some(server) = url.host_str() else {
        return Err(TrixError::InvalidHost(host.to_owned()));
    };

    Ok(match url.port() {
        Some(port) => format!("@{user}:{server}:{port}"),
        None => format!("@{user}:{server}"),
    })
}

/// Encodes an account key into a directory name.
///
/// Alphanumeric characters, `-` and `.` are kept; every other byte becomes `_`
/// followed by its two hex digits, so two distinct accounts never share a
/// directory.
pub fn account_dir_name(account: &str) -> String {
    account
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
                (b as char).to_string()
            } else {
                format!("_{b:02x}")
            }
        })
        .collect()
}
