//! Deployment of authorized SSH keys into user homes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use constel_core::constants::SSH_KEYS_RELATIVE_PATH;
use constel_core::fs::FileSystem;
use serde_json::Value;
use tracing::{debug, info};

use crate::user::{LinuxUser, LinuxUserManager};

/// A public key granted to a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub username: String,
    pub public_key: String,
}

impl UserKey {
    pub fn new(username: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            public_key: public_key.into(),
        }
    }
}

/// Path of the managed key file inside a home directory.
pub fn key_file(home: &Path) -> PathBuf {
    home.join(SSH_KEYS_RELATIVE_PATH)
}

/// Parse a `{"user": "ssh-... key"}` JSON object.
pub fn parse_key_map(json: &str) -> Result<Vec<UserKey>> {
    let value: Value = serde_json::from_str(json).context("Failed to parse SSH key map")?;
    let object = value
        .as_object()
        .context("SSH key map must be a JSON object")?;
    object
        .iter()
        .map(|(user, key)| {
            let key = key
                .as_str()
                .with_context(|| format!("SSH key for {} must be a string", user))?;
            Ok(UserKey::new(user.clone(), key))
        })
        .collect()
}

/// Writes authorized keys and remembers what it wrote.
///
/// All deployments go through [`SshAccess::lock`], so a reconcile pass holds
/// the same lock for its whole duration.
pub struct SshAccess {
    users: LinuxUserManager,
    deployed: Mutex<HashSet<UserKey>>,
}

impl SshAccess {
    pub fn new(users: LinuxUserManager) -> Self {
        Self {
            users,
            deployed: Mutex::new(HashSet::new()),
        }
    }

    pub fn users(&self) -> &LinuxUserManager {
        &self.users
    }

    pub fn lock(&self) -> SshAccessGuard<'_> {
        SshAccessGuard {
            users: &self.users,
            deployed: self.deployed.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Deploy a single key, creating the user if needed.
    pub fn deploy_authorized_key(&self, key: &UserKey) -> Result<()> {
        self.lock().deploy_authorized_key(key)
    }
}

pub struct SshAccessGuard<'a> {
    users: &'a LinuxUserManager,
    deployed: MutexGuard<'a, HashSet<UserKey>>,
}

impl SshAccessGuard<'_> {
    pub fn deploy_authorized_key(&mut self, key: &UserKey) -> Result<()> {
        if self.deployed.contains(key) {
            debug!(user = %key.username, "Key already deployed");
            return Ok(());
        }
        let user = self.users.ensure_user_exists(&key.username)?;
        write_key_file(self.users.fs().as_ref(), &user, &key.public_key)?;
        self.deployed.insert(key.clone());
        info!(user = %key.username, "Deployed authorized key");
        Ok(())
    }

    /// Drop remembered deployments of `username` so the next deploy rewrites the file.
    pub fn forget(&mut self, username: &str) {
        self.deployed.retain(|k| k.username != username);
    }
}

fn write_key_file(fs: &dyn FileSystem, user: &LinuxUser, public_key: &str) -> Result<()> {
    let file = key_file(&user.home);
    let dir = file
        .parent()
        .context("SSH key path has no parent directory")?;
    fs.create_dir_all(dir, 0o700)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    // .ssh and authorized_keys.d
    for path in [dir.parent().unwrap_or(dir), dir] {
        fs.chown(path, user.uid, user.gid)
            .with_context(|| format!("Failed to chown {}", path.display()))?;
    }
    match fs.remove_file(&file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", file.display()));
        }
    }
    fs.write(&file, format!("{}\n", public_key).as_bytes(), 0o644)
        .with_context(|| format!("Failed to write {}", file.display()))?;
    fs.chown(&file, user.uid, user.gid)
        .with_context(|| format!("Failed to chown {}", file.display()))
}
