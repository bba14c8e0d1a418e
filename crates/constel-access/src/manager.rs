//! Reconciles host users and SSH keys against a declared key set.
//!
//! Every directory below `/var/home` is a managed user. Users with a declared
//! key get (or keep) their account and a freshly written key file. Users
//! without one are evicted: their home moves to `/var/evicted` and is handed
//! to root. `root` itself is never evicted; only its managed key file is
//! removed when it has no declared key.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use constel_core::constants::{EVICTED_DIR, HOME_DIR};
use constel_core::fs::{FileSystem, is_cross_device};
use tracing::{error, info, warn};

use crate::ssh::{SshAccess, SshAccessGuard, UserKey, key_file};
use crate::user::{LinuxUserManager, UserCreator};

/// Interval between reconcile passes of the daemon.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

const ROOT: &str = "root";

/// Owner of an existing home directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Outcome of one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub deployed: Vec<String>,
    pub evicted: Vec<String>,
    pub failed: Vec<String>,
}

pub struct AccessManager {
    fs: Arc<dyn FileSystem>,
    ssh: SshAccess,
    home_dir: PathBuf,
    evicted_dir: PathBuf,
}

impl AccessManager {
    pub fn new(fs: Arc<dyn FileSystem>, creator: Arc<dyn UserCreator>) -> Self {
        let users = LinuxUserManager::new(fs.clone(), creator);
        Self {
            fs,
            ssh: SshAccess::new(users),
            home_dir: PathBuf::from(HOME_DIR),
            evicted_dir: PathBuf::from(EVICTED_DIR),
        }
    }

    fn users(&self) -> &LinuxUserManager {
        self.ssh.users()
    }

    /// Existing users: every entry below the home directory plus `root` (0/0).
    /// Entries that cannot be stat'ed are skipped with a warning.
    pub fn generate_user_map(&self) -> Result<BTreeMap<String, Ownership>> {
        let mut map = BTreeMap::new();
        map.insert(ROOT.to_string(), Ownership { uid: 0, gid: 0 });

        let entries = match self.fs.read_dir(&self.home_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(map),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.home_dir.display()));
            }
        };
        for path in entries {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            match self.fs.metadata(&path) {
                Ok(meta) => {
                    map.insert(
                        name,
                        Ownership {
                            uid: meta.uid,
                            gid: meta.gid,
                        },
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat home directory, skipping");
                }
            }
        }
        Ok(map)
    }

    /// Run one reconcile pass. Per-user failures are logged and collected in the summary.
    pub fn reconcile(&self, declared: &[UserKey]) -> Result<ReconcileSummary> {
        let mut guard = self.ssh.lock();
        let existing = self.generate_user_map()?;
        let declared: BTreeMap<&str, &UserKey> = declared
            .iter()
            .map(|k| (k.username.as_str(), k))
            .collect();
        let mut summary = ReconcileSummary::default();

        for (username, owner) in &existing {
            let result = if declared.contains_key(username.as_str()) {
                if username == ROOT {
                    continue;
                }
                self.recreate_user(username, *owner)
            } else if username == ROOT {
                self.remove_key_file(&mut guard, ROOT)
            } else {
                self.evict_user(username).map(|target| {
                    info!(user = %username, target = %target.display(), "Evicted user");
                    summary.evicted.push(username.clone());
                })
            };
            if let Err(e) = result {
                error!(user = %username, error = %format!("{:#}", e), "Failed to reconcile existing user");
                summary.failed.push(username.clone());
            }
        }

        for (username, key) in &declared {
            if summary.failed.iter().any(|f| f == username) {
                continue;
            }
            match self.deploy(&mut guard, &existing, key) {
                Ok(()) => summary.deployed.push(username.to_string()),
                Err(e) => {
                    error!(user = %username, error = %format!("{:#}", e), "Failed to deploy key");
                    summary.failed.push(username.to_string());
                }
            }
        }
        Ok(summary)
    }

    /// Make sure an existing home's owner is a passwd user with the same ids.
    fn recreate_user(&self, username: &str, owner: Ownership) -> Result<()> {
        self.users()
            .creator()
            .create_user_with_specific_uid_and_gid(username, owner.uid, owner.gid)
            .with_context(|| format!("Failed to recreate user {}", username))
    }

    fn deploy(
        &self,
        guard: &mut SshAccessGuard<'_>,
        existing: &BTreeMap<String, Ownership>,
        key: &UserKey,
    ) -> Result<()> {
        if !existing.contains_key(&key.username) {
            self.users()
                .creator()
                .create_user(&key.username)
                .with_context(|| format!("Failed to create user {}", key.username))?;
        }
        self.remove_key_file(guard, &key.username)?;
        guard.deploy_authorized_key(key)
    }

    /// Remove the managed key file of a passwd user. A missing file is fine.
    fn remove_key_file(&self, guard: &mut SshAccessGuard<'_>, username: &str) -> Result<()> {
        let user = self.users().get_linux_user(username)?;
        let file = key_file(&user.home);
        guard.forget(username);
        match self.fs.remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", file.display())),
        }
    }

    /// Move a user's home below the evicted directory and hand it to root.
    /// Refuses to evict users that still exist in passwd.
    pub fn evict_user(&self, username: &str) -> Result<PathBuf> {
        if self.users().get_linux_user(username).is_ok() {
            bail!("user '{}' still seems to exist", username);
        }
        self.fs
            .create_dir_all(&self.evicted_dir, 0o700)
            .with_context(|| format!("Failed to create {}", self.evicted_dir.display()))?;

        let source = self.home_dir.join(username);
        let target = self.eviction_target(username);
        match self.fs.rename(&source, &target) {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                self.fs
                    .copy_dir_all(&source, &target)
                    .with_context(|| format!("Failed to copy {}", source.display()))?;
                self.fs
                    .remove_dir_all(&source)
                    .with_context(|| format!("Failed to remove {}", source.display()))?;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to move {} to {}", source.display(), target.display())
                });
            }
        }

        for path in self
            .fs
            .walk(&target)
            .with_context(|| format!("Failed to walk {}", target.display()))?
        {
            self.fs
                .chown(&path, 0, 0)
                .with_context(|| format!("Failed to chown {}", path.display()))?;
        }
        Ok(target)
    }

    /// `<user>_<unix seconds>`, with a `.N` suffix if that name is taken.
    fn eviction_target(&self, username: &str) -> PathBuf {
        let base = format!("{}_{}", username, chrono::Utc::now().timestamp());
        let mut candidate = self.evicted_dir.join(&base);
        let mut n = 1;
        while self.fs.exists(&candidate) {
            candidate = self.evicted_dir.join(format!("{}.{}", base, n));
            n += 1;
        }
        candidate
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }
}
