//! On-disk user store.
//!
//! One directory per local user under the data dir:
//!
//! ```text
//! <datadir>/<username>/user.conf     # "password = <verifier>"
//! <datadir>/<username>/roster.xml    # roster document
//! <datadir>/<username>/offline/      # queued message stanzas
//! ```
//!
//! The credential file is a tiny `key = value` record; everything above
//! this module treats the stored password as an opaque verifier.
//! Directory existence is the account-existence test.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::util::valid_username;
use crate::XmppError;

/// Outcome of an account-creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateUserError {
    /// The account already exists.
    Conflict,
    /// The username contains characters outside `[A-Za-z0-9._-]`.
    InvalidUsername,
    /// Filesystem failure.
    Io,
}

/// Path of a user's directory.
pub fn user_dir(datadir: &Path, username: &str) -> PathBuf {
    datadir.join(username)
}

/// Path of a user's offline-message directory.
pub fn offline_dir(datadir: &Path, username: &str) -> PathBuf {
    user_dir(datadir, username).join("offline")
}

/// Path of a user's roster document.
pub fn roster_path(datadir: &Path, username: &str) -> PathBuf {
    user_dir(datadir, username).join("roster.xml")
}

fn conf_path(datadir: &Path, username: &str) -> PathBuf {
    user_dir(datadir, username).join("user.conf")
}

/// Whether an account exists.
pub fn user_exists(datadir: &Path, username: &str) -> bool {
    valid_username(username) && conf_path(datadir, username).is_file()
}

/// Create an account: user directory, credential file, empty roster,
/// offline directory.
pub fn create_user(datadir: &Path, username: &str, password: &str) -> Result<(), CreateUserError> {
    if !valid_username(username) {
        return Err(CreateUserError::InvalidUsername);
    }
    if user_exists(datadir, username) {
        return Err(CreateUserError::Conflict);
    }

    let dir = user_dir(datadir, username);
    let create = || -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        std::fs::write(conf_path(datadir, username), format!("password = {}\n", password))?;
        std::fs::write(
            roster_path(datadir, username),
            "<?xml version=\"1.0\"?>\n<roster xmlns=\"jabber:iq:roster\"/>\n",
        )?;
        std::fs::create_dir_all(offline_dir(datadir, username))?;
        Ok(())
    };
    create().map_err(|e| {
        warn!(username, error = %e, "Failed to create user directory");
        CreateUserError::Io
    })
}

/// Replace an account's password.
pub fn change_password(datadir: &Path, username: &str, password: &str) -> Result<(), XmppError> {
    std::fs::write(conf_path(datadir, username), format!("password = {}\n", password)).map_err(
        |e| {
            warn!(username, error = %e, "Failed to write credential file");
            XmppError::Io(e)
        },
    )?;
    debug!(username, "Password updated");
    Ok(())
}

/// Delete an account directory: offline messages, credential file,
/// roster, then the directories themselves.
pub fn delete_user(datadir: &Path, username: &str) -> Result<(), XmppError> {
    if !valid_username(username) {
        return Err(XmppError::internal("invalid username"));
    }
    let offline = offline_dir(datadir, username);
    if let Ok(entries) = std::fs::read_dir(&offline) {
        for entry in entries.flatten() {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    let _ = std::fs::remove_dir(&offline);
    let _ = std::fs::remove_file(conf_path(datadir, username));
    let _ = std::fs::remove_file(roster_path(datadir, username));
    std::fs::remove_dir(user_dir(datadir, username)).map_err(|e| {
        warn!(username, error = %e, "Failed to remove user directory");
        XmppError::Io(e)
    })?;
    debug!(username, "Account deleted");
    Ok(())
}

/// Verify a password against the stored credential.
///
/// Unknown users and unreadable credential files verify as false.
pub fn check_password(datadir: &Path, username: &str, password: &str) -> bool {
    if !valid_username(username) {
        return false;
    }
    let Ok(contents) = std::fs::read_to_string(conf_path(datadir, username)) else {
        debug!(username, "Credential file not found");
        return false;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() == "password" {
            return value.trim() == password;
        }
    }
    false
}
