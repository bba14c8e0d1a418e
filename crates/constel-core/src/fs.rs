//! Filesystem port used by node state persistence and the access manager.
//!
//! [`OsFs`] maps absolute paths below a configurable root onto the host.
//! [`MemFs`] is an in-memory tree that tracks owners and modes, so ownership
//! changes can be asserted in tests without root privileges.

use std::collections::BTreeMap;
use std::fs::{DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Type and ownership of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub is_dir: bool,
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Atomically replace `path` with `data`.
    fn write(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    /// Atomically create `path`. Fails with `AlreadyExists` if it is present.
    fn create_new(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    /// Create a directory and missing parents. Existing directories are left untouched.
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Rename within one mount. Crossing mounts fails with `EXDEV`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Metadata of `path` without following symlinks.
    fn metadata(&self, path: &Path) -> io::Result<FileMeta>;

    /// Direct children of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_ok()
    }

    /// `root` and everything below it, parents before children.
    fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = vec![root.to_path_buf()];
        let mut idx = 0;
        while idx < out.len() {
            let current = out[idx].clone();
            idx += 1;
            if self.metadata(&current)?.is_dir {
                let mut children = self.read_dir(&current)?;
                children.sort();
                out.extend(children);
            }
        }
        Ok(out)
    }

    /// Copy a tree preserving modes and owners.
    fn copy_dir_all(&self, from: &Path, to: &Path) -> io::Result<()> {
        for src in self.walk(from)? {
            let rel = src.strip_prefix(from).map_err(io::Error::other)?;
            let dst = if rel.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rel)
            };
            let meta = self.metadata(&src)?;
            if meta.is_dir {
                self.create_dir_all(&dst, meta.mode)?;
            } else {
                let data = self.read(&src)?;
                self.write(&dst, &data, meta.mode)?;
            }
            self.chown(&dst, meta.uid, meta.gid)?;
        }
        Ok(())
    }
}

/// Whether an error is a cross-device rename failure.
pub fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

/// The host filesystem, optionally rooted below a directory (e.g. `/host`).
#[derive(Debug, Clone)]
pub struct OsFs {
    root: PathBuf,
}

impl Default for OsFs {
    fn default() -> Self {
        Self::new()
    }
}

impl OsFs {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Resolve every absolute path below `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(path),
        }
    }

    fn write_temp(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<tempfile::NamedTempFile> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().set_permissions(Permissions::from_mode(mode))?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

impl FileSystem for OsFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }

    fn write(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let target = self.resolve(path);
        let tmp = self.write_temp(&target, data, mode)?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    fn create_new(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let target = self.resolve(path);
        let tmp = self.write_temp(&target, data, mode)?;
        tmp.persist_noclobber(&target).map_err(|e| e.error)?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let target = self.resolve(path);
        if target.is_dir() {
            return Ok(());
        }
        DirBuilder::new().recursive(true).mode(mode).create(&target)?;
        std::fs::set_permissions(&target, Permissions::from_mode(mode))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(self.resolve(path))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(self.resolve(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(self.resolve(from), self.resolve(to))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::lchown(self.resolve(path), Some(uid), Some(gid))
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let meta = std::fs::symlink_metadata(self.resolve(path))?;
        Ok(FileMeta {
            is_dir: meta.is_dir(),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.resolve(path))? {
            out.push(path.join(entry?.file_name()));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    mode: u32,
    uid: u32,
    gid: u32,
}

impl Entry {
    fn dir(mode: u32) -> Self {
        Self {
            node: Node::Dir,
            mode,
            uid: 0,
            gid: 0,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.node, Node::Dir)
    }
}

/// In-memory filesystem. New entries are owned by root, like files written by the daemon.
#[derive(Debug)]
pub struct MemFs {
    entries: Mutex<BTreeMap<PathBuf, Entry>>,
    mounts: Mutex<Vec<PathBuf>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{}: file exists", path.display()),
    )
}

impl MemFs {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(PathBuf::from("/"), Entry::dir(0o755));
        Self {
            entries: Mutex::new(entries),
            mounts: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a directory (and root-owned parents) owned by `uid:gid`.
    pub fn with_dir(self, path: &str, mode: u32, uid: u32, gid: u32) -> Self {
        {
            let mut entries = self.lock();
            Self::ensure_parents(&mut entries, Path::new(path));
            entries.insert(
                PathBuf::from(path),
                Entry {
                    node: Node::Dir,
                    mode,
                    uid,
                    gid,
                },
            );
        }
        self
    }

    /// Add a file (and root-owned parents) owned by `uid:gid`.
    pub fn with_file(self, path: &str, content: &str, mode: u32, uid: u32, gid: u32) -> Self {
        {
            let mut entries = self.lock();
            Self::ensure_parents(&mut entries, Path::new(path));
            entries.insert(
                PathBuf::from(path),
                Entry {
                    node: Node::File(content.as_bytes().to_vec()),
                    mode,
                    uid,
                    gid,
                },
            );
        }
        self
    }

    /// Treat `path` as a separate mount; renames across it fail with `EXDEV`.
    pub fn with_mount(self, path: &str) -> Self {
        self.mounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PathBuf::from(path));
        self
    }

    /// File content as UTF-8, if the file exists.
    pub fn contents(&self, path: &str) -> Option<String> {
        match self.lock().get(Path::new(path)).map(|e| &e.node) {
            Some(Node::File(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }

    fn ensure_parents(entries: &mut BTreeMap<PathBuf, Entry>, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            entries
                .entry(ancestor.to_path_buf())
                .or_insert_with(|| Entry::dir(0o755));
        }
    }

    fn mount_of(&self, path: &Path) -> PathBuf {
        self.mounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| path.starts_with(m))
            .max_by_key(|m| m.components().count())
            .cloned()
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn check_parent(entries: &BTreeMap<PathBuf, Entry>, path: &Path) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        match entries.get(parent) {
            Some(e) if e.is_dir() => Ok(()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{}: not a directory", parent.display()),
            )),
            None => Err(not_found(parent)),
        }
    }

    fn insert_file(&self, path: &Path, data: &[u8], mode: u32, clobber: bool) -> io::Result<()> {
        let mut entries = self.lock();
        Self::check_parent(&entries, path)?;
        match entries.get(path) {
            Some(e) if e.is_dir() => {
                return Err(io::Error::new(
                    io::ErrorKind::IsADirectory,
                    format!("{}: is a directory", path.display()),
                ));
            }
            Some(_) if !clobber => return Err(already_exists(path)),
            _ => {}
        }
        entries.insert(
            path.to_path_buf(),
            Entry {
                node: Node::File(data.to_vec()),
                mode,
                uid: 0,
                gid: 0,
            },
        );
        Ok(())
    }
}

impl FileSystem for MemFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.lock().get(path) {
            Some(Entry {
                node: Node::File(data),
                ..
            }) => Ok(data.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{}: is a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn write(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        self.insert_file(path, data, mode, true)
    }

    fn create_new(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        self.insert_file(path, data, mode, false)
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut entries = self.lock();
        let mut missing = Vec::new();
        for ancestor in path.ancestors() {
            match entries.get(ancestor) {
                Some(e) if e.is_dir() => break,
                Some(_) => return Err(already_exists(ancestor)),
                None => missing.push(ancestor.to_path_buf()),
            }
        }
        for dir in missing {
            entries.insert(dir, Entry::dir(mode));
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut entries = self.lock();
        match entries.get(path) {
            Some(e) if e.is_dir() => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{}: is a directory", path.display()),
            )),
            Some(_) => {
                entries.remove(path);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut entries = self.lock();
        if !entries.contains_key(path) {
            return Err(not_found(path));
        }
        entries.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.mount_of(from) != self.mount_of(to) {
            return Err(io::Error::from_raw_os_error(libc::EXDEV));
        }
        let mut entries = self.lock();
        let source = entries.get(from).cloned().ok_or_else(|| not_found(from))?;
        Self::check_parent(&entries, to)?;
        if source.is_dir() && entries.contains_key(to) {
            return Err(already_exists(to));
        }

        let moved: Vec<(PathBuf, Entry)> = entries
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        entries.retain(|p, _| !p.starts_with(from));
        for (p, e) in moved {
            let rel = p.strip_prefix(from).map_err(io::Error::other)?;
            let dst = if rel.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rel)
            };
            entries.insert(dst, e);
        }
        Ok(())
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        let mut entries = self.lock();
        let entry = entries.get_mut(path).ok_or_else(|| not_found(path))?;
        entry.uid = uid;
        entry.gid = gid;
        Ok(())
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        self.lock()
            .get(path)
            .map(|e| FileMeta {
                is_dir: e.is_dir(),
                mode: e.mode,
                uid: e.uid,
                gid: e.gid,
            })
            .ok_or_else(|| not_found(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = self.lock();
        match entries.get(path) {
            Some(e) if e.is_dir() => Ok(entries
                .keys()
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{}: not a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfs_write_and_read() {
        let fs = MemFs::new().with_dir("/etc", 0o755, 0, 0);
        fs.write(Path::new("/etc/passwd"), b"root:x:0:0::/root:/bin/sh\n", 0o644)
            .unwrap();
        assert_eq!(
            fs.contents("/etc/passwd").unwrap(),
            "root:x:0:0::/root:/bin/sh\n"
        );
        assert_eq!(fs.metadata(Path::new("/etc/passwd")).unwrap().mode, 0o644);
    }

    #[test]
    fn test_memfs_write_requires_parent() {
        let fs = MemFs::new();
        let err = fs.write(Path::new("/missing/file"), b"x", 0o644).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memfs_create_new_refuses_existing() {
        let fs = MemFs::new().with_file("/run/state", "first", 0o600, 0, 0);
        let err = fs
            .create_new(Path::new("/run/state"), b"second", 0o600)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs.contents("/run/state").unwrap(), "first");
    }

    #[test]
    fn test_memfs_create_dir_all_keeps_existing() {
        let fs = MemFs::new().with_dir("/var/home/alice", 0o750, 1000, 1000);
        fs.create_dir_all(Path::new("/var/home/alice/.ssh/authorized_keys.d"), 0o700)
            .unwrap();
        let home = fs.metadata(Path::new("/var/home/alice")).unwrap();
        assert_eq!((home.uid, home.mode), (1000, 0o750));
        let ssh = fs.metadata(Path::new("/var/home/alice/.ssh")).unwrap();
        assert!(ssh.is_dir);
        assert_eq!(ssh.mode, 0o700);
    }

    #[test]
    fn test_memfs_rename_moves_subtree() {
        let fs = MemFs::new()
            .with_dir("/var/evicted", 0o700, 0, 0)
            .with_file("/var/home/bob/notes.txt", "hi", 0o640, 1001, 1001);
        fs.rename(Path::new("/var/home/bob"), Path::new("/var/evicted/bob_1"))
            .unwrap();
        assert!(!fs.exists(Path::new("/var/home/bob")));
        assert_eq!(fs.contents("/var/evicted/bob_1/notes.txt").unwrap(), "hi");
        let meta = fs.metadata(Path::new("/var/evicted/bob_1/notes.txt")).unwrap();
        assert_eq!((meta.uid, meta.mode), (1001, 0o640));
    }

    #[test]
    fn test_memfs_rename_across_mounts() {
        let fs = MemFs::new()
            .with_mount("/var/evicted")
            .with_dir("/var/evicted", 0o700, 0, 0)
            .with_dir("/var/home/bob", 0o700, 1001, 1001);
        let err = fs
            .rename(Path::new("/var/home/bob"), Path::new("/var/evicted/bob_1"))
            .unwrap_err();
        assert!(is_cross_device(&err));
    }

    #[test]
    fn test_walk_and_copy_dir_all() {
        let fs = MemFs::new()
            .with_dir("/dst", 0o755, 0, 0)
            .with_file("/src/a/b.txt", "b", 0o600, 7, 8)
            .with_file("/src/c.txt", "c", 0o644, 7, 8);
        let walked = fs.walk(Path::new("/src")).unwrap();
        assert_eq!(walked[0], PathBuf::from("/src"));
        assert_eq!(walked.len(), 4);

        fs.copy_dir_all(Path::new("/src"), Path::new("/dst/copy")).unwrap();
        assert_eq!(fs.contents("/dst/copy/a/b.txt").unwrap(), "b");
        let meta = fs.metadata(Path::new("/dst/copy/a/b.txt")).unwrap();
        assert_eq!((meta.uid, meta.gid, meta.mode), (7, 8, 0o600));
    }

    #[test]
    fn test_memfs_read_dir() {
        let fs = MemFs::new()
            .with_dir("/var/home/alice", 0o700, 1000, 1000)
            .with_dir("/var/home/bob", 0o700, 1001, 1001)
            .with_file("/var/home/bob/x", "", 0o600, 1001, 1001);
        let mut children = fs.read_dir(Path::new("/var/home")).unwrap();
        children.sort();
        assert_eq!(
            children,
            vec![
                PathBuf::from("/var/home/alice"),
                PathBuf::from("/var/home/bob")
            ]
        );
    }

    #[test]
    fn test_osfs_rooted_create_new() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::with_root(dir.path());
        fs.create_dir_all(Path::new("/run/state"), 0o755).unwrap();
        fs.create_new(Path::new("/run/state/file"), b"one", 0o600)
            .unwrap();
        let err = fs
            .create_new(Path::new("/run/state/file"), b"two", 0o600)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs.read(Path::new("/run/state/file")).unwrap(), b"one");
        assert_eq!(fs.metadata(Path::new("/run/state/file")).unwrap().mode, 0o600);
        assert!(dir.path().join("run/state/file").exists());
    }

    #[test]
    fn test_osfs_read_dir_returns_virtual_paths() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::with_root(dir.path());
        fs.create_dir_all(Path::new("/var/home/alice"), 0o700).unwrap();
        let children = fs.read_dir(Path::new("/var/home")).unwrap();
        assert_eq!(children, vec![PathBuf::from("/var/home/alice")]);
    }
}
