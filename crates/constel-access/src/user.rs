//! Linux users as seen through `/etc/passwd`, and creation of missing ones.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use constel_core::constants::{HOME_DIR, PASSWD_PATH};
use constel_core::fs::FileSystem;
use thiserror::Error;
use tracing::{debug, info};

use crate::passwd::{Passwd, PasswdError};

/// `useradd`/`groupadd` exit status for "name already in use".
const EXIT_NAME_IN_USE: i32 = 9;

/// First uid/gid handed out to regular users.
const FIRST_REGULAR_ID: u32 = 1000;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user or group already exists")]
    AlreadyExists,
    #[error("command failed (exit {code}): {command}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A resolved Linux user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxUser {
    pub username: String,
    pub home: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

/// Creates Linux users. Creating a user that already exists is not an error.
pub trait UserCreator: Send + Sync {
    /// Create a user with auto-assigned uid/gid.
    fn create_user(&self, username: &str) -> Result<(), UserError>;

    /// Create a user (and its primary group) with fixed ids.
    fn create_user_with_specific_uid_and_gid(
        &self,
        username: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(), UserError>;
}

/// Map a `useradd`/`groupadd` exit status onto a result.
fn check_exit(command: &str, code: Option<i32>, stderr: &[u8]) -> Result<(), UserError> {
    match code {
        Some(0) => Ok(()),
        Some(EXIT_NAME_IN_USE) => Err(UserError::AlreadyExists),
        other => Err(UserError::CommandFailed {
            command: command.to_string(),
            code: other.unwrap_or(-1),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }),
    }
}

/// Treat "already exists" as success.
fn tolerate_existing(username: &str, result: Result<(), UserError>) -> Result<(), UserError> {
    match result {
        Err(UserError::AlreadyExists) => {
            debug!(user = %username, "User already exists");
            Ok(())
        }
        other => other,
    }
}

/// Creates users with the shadow-utils binaries of the (possibly chrooted) host.
#[derive(Debug, Default, Clone)]
pub struct ShellUserCreator;

impl ShellUserCreator {
    fn run(cmd: &str, args: &[&str]) -> Result<(), UserError> {
        let command = format!("{} {}", cmd, args.join(" "));
        let output = Command::new(cmd)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run: {}", command))?;
        check_exit(&command, output.status.code(), &output.stderr)
    }
}

impl UserCreator for ShellUserCreator {
    fn create_user(&self, username: &str) -> Result<(), UserError> {
        let home = format!("{}/{}", HOME_DIR, username);
        tolerate_existing(
            username,
            Self::run("useradd", &["-m", "-U", "-d", &home, username]),
        )?;
        info!(user = %username, "Created user");
        Ok(())
    }

    fn create_user_with_specific_uid_and_gid(
        &self,
        username: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(), UserError> {
        let home = format!("{}/{}", HOME_DIR, username);
        let (uid, gid) = (uid.to_string(), gid.to_string());
        tolerate_existing(username, Self::run("groupadd", &["-g", &gid, username]))?;
        tolerate_existing(
            username,
            Self::run(
                "useradd",
                &["-m", "-d", &home, "-u", &uid, "-g", &gid, username],
            ),
        )?;
        info!(user = %username, uid = %uid, gid = %gid, "Created user with fixed ids");
        Ok(())
    }
}

/// Edits `/etc/passwd` on a [`FileSystem`] directly. Used by tests and dry runs.
pub struct FakeUserCreator {
    fs: Arc<dyn FileSystem>,
}

impl FakeUserCreator {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    fn add(&self, username: &str, ids: Option<(u32, u32)>) -> Result<(), UserError> {
        let path = Path::new(PASSWD_PATH);
        let content = match self.fs.read(path) {
            Ok(data) => String::from_utf8_lossy(&data).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(anyhow::Error::from(e).context("Failed to read passwd").into()),
        };
        let passwd = Passwd::parse(&content).context("Failed to parse passwd")?;
        if passwd.contains(username) {
            return Ok(());
        }

        let (uid, gid) = ids.unwrap_or_else(|| {
            let next = passwd
                .iter()
                .map(|(_, e)| e.uid)
                .filter(|uid| *uid >= FIRST_REGULAR_ID && *uid < u32::MAX - 1)
                .max()
                .map_or(FIRST_REGULAR_ID, |max| max + 1);
            (next, next)
        });
        let home = format!("{}/{}", HOME_DIR, username);

        let mut updated = content;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!(
            "{}:x:{}:{}::{}:/bin/bash\n",
            username, uid, gid, home
        ));
        self.fs
            .write(path, updated.as_bytes(), 0o644)
            .context("Failed to write passwd")?;

        let home = Path::new(&home);
        if !self.fs.exists(home) {
            self.fs
                .create_dir_all(home, 0o700)
                .context("Failed to create home directory")?;
            self.fs
                .chown(home, uid, gid)
                .context("Failed to chown home directory")?;
        }
        Ok(())
    }
}

impl UserCreator for FakeUserCreator {
    fn create_user(&self, username: &str) -> Result<(), UserError> {
        self.add(username, None)
    }

    fn create_user_with_specific_uid_and_gid(
        &self,
        username: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(), UserError> {
        self.add(username, Some((uid, gid)))
    }
}

/// Resolves users from `/etc/passwd` and creates missing ones.
#[derive(Clone)]
pub struct LinuxUserManager {
    fs: Arc<dyn FileSystem>,
    creator: Arc<dyn UserCreator>,
}

impl LinuxUserManager {
    pub fn new(fs: Arc<dyn FileSystem>, creator: Arc<dyn UserCreator>) -> Self {
        Self { fs, creator }
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn creator(&self) -> &Arc<dyn UserCreator> {
        &self.creator
    }

    fn passwd(&self) -> Result<Passwd> {
        let data = self
            .fs
            .read(Path::new(PASSWD_PATH))
            .with_context(|| format!("Failed to read {}", PASSWD_PATH))?;
        Passwd::parse(&String::from_utf8_lossy(&data))
            .with_context(|| format!("Failed to parse {}", PASSWD_PATH))
    }

    /// Look up a user. Fails with [`PasswdError::UserDoesNotExist`] in the chain if absent.
    pub fn get_linux_user(&self, username: &str) -> Result<LinuxUser> {
        let passwd = self.passwd()?;
        let entry = passwd.get(username)?;
        Ok(LinuxUser {
            username: username.to_string(),
            home: entry.home.clone(),
            uid: entry.uid,
            gid: entry.gid,
        })
    }

    /// Look up a user, creating it with auto-assigned ids if absent.
    /// An existing user's uid/gid are never changed.
    pub fn ensure_user_exists(&self, username: &str) -> Result<LinuxUser> {
        match self.get_linux_user(username) {
            Ok(user) => return Ok(user),
            Err(e) if !is_missing_user(&e) => return Err(e),
            Err(_) => {}
        }
        self.creator
            .create_user(username)
            .with_context(|| format!("Failed to create user {}", username))?;
        self.get_linux_user(username)
    }
}

/// Whether `err` reports a user absent from passwd.
pub fn is_missing_user(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PasswdError>(),
            Some(PasswdError::UserDoesNotExist(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use constel_core::fs::MemFs;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000::/var/home/alice:/bin/bash\n";

    fn manager(fs: MemFs) -> (Arc<MemFs>, LinuxUserManager) {
        let fs = Arc::new(fs);
        let creator = Arc::new(FakeUserCreator::new(fs.clone()));
        (fs.clone(), LinuxUserManager::new(fs, creator))
    }

    #[test]
    fn test_get_linux_user() {
        let (_, users) = manager(MemFs::new().with_file(PASSWD_PATH, PASSWD, 0o644, 0, 0));
        let alice = users.get_linux_user("alice").unwrap();
        assert_eq!(
            alice,
            LinuxUser {
                username: "alice".to_string(),
                home: PathBuf::from("/var/home/alice"),
                uid: 1000,
                gid: 1000,
            }
        );
        let err = users.get_linux_user("bob").unwrap_err();
        assert!(is_missing_user(&err));
    }

    #[test]
    fn test_ensure_user_exists_creates_missing() {
        let (fs, users) = manager(MemFs::new().with_file(PASSWD_PATH, PASSWD, 0o644, 0, 0));
        let bob = users.ensure_user_exists("bob").unwrap();
        assert_eq!((bob.uid, bob.gid), (1001, 1001));
        assert_eq!(bob.home, PathBuf::from("/var/home/bob"));
        let home = fs.metadata(Path::new("/var/home/bob")).unwrap();
        assert!(home.is_dir);
        assert_eq!((home.uid, home.gid), (1001, 1001));
    }

    #[test]
    fn test_ensure_user_exists_keeps_existing_ids() {
        let (_, users) = manager(MemFs::new().with_file(PASSWD_PATH, PASSWD, 0o644, 0, 0));
        let alice = users.ensure_user_exists("alice").unwrap();
        assert_eq!((alice.uid, alice.gid), (1000, 1000));
    }

    #[test]
    fn test_fake_creator_specific_ids() {
        let fs = Arc::new(MemFs::new().with_file(PASSWD_PATH, PASSWD, 0o644, 0, 0));
        let creator = FakeUserCreator::new(fs.clone());
        creator
            .create_user_with_specific_uid_and_gid("carol", 1234, 2345)
            .unwrap();
        // Second call is a no-op.
        creator
            .create_user_with_specific_uid_and_gid("carol", 1, 1)
            .unwrap();
        let passwd = Passwd::parse(&fs.contents(PASSWD_PATH).unwrap()).unwrap();
        let carol = passwd.get("carol").unwrap();
        assert_eq!((carol.uid, carol.gid), (1234, 2345));
    }

    #[test]
    fn test_check_exit_codes() {
        assert!(check_exit("useradd x", Some(0), b"").is_ok());
        assert!(matches!(
            check_exit("useradd x", Some(9), b"exists"),
            Err(UserError::AlreadyExists)
        ));
        match check_exit("useradd x", Some(1), b"boom\n") {
            Err(UserError::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(tolerate_existing("x", Err(UserError::AlreadyExists)).is_ok());
    }
}
