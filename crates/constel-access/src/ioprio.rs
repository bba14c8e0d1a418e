//! Raise the I/O scheduling priority of the local etcd process.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

const IOPRIO_CLASS_SHIFT: u32 = 13;
const IOPRIO_CLASS_RT: u32 = 1;
const IOPRIO_WHO_PROCESS: libc::c_int = 1;
/// Highest priority level within a class.
const IOPRIO_LEVEL_HIGHEST: u32 = 0;

const ETCD_BINARY: &str = "etcd";

#[derive(Debug, Error)]
pub enum IoprioError {
    #[error("no etcd process found")]
    NoEtcdProcess,
    #[error("multiple etcd processes found")]
    MultipleEtcdProcesses,
    #[error("failed to scan {path}: {source}")]
    Scan { path: PathBuf, source: io::Error },
    #[error("ioprio_set failed for pid {pid}: {source}")]
    Syscall { pid: i32, source: io::Error },
}

/// Encoded `ioprio` value for `class` and `level`.
pub fn ioprio_value(class: u32, level: u32) -> u32 {
    (class << IOPRIO_CLASS_SHIFT) | level
}

pub struct EtcdIoPrioritizer {
    proc_root: PathBuf,
}

impl Default for EtcdIoPrioritizer {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl EtcdIoPrioritizer {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Find the single process whose executable is named `etcd`.
    pub fn find_etcd_pid(&self) -> Result<i32, IoprioError> {
        let scan_err = |source| IoprioError::Scan {
            path: self.proc_root.clone(),
            source,
        };
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.proc_root).map_err(scan_err)? {
            let entry = entry.map_err(scan_err)?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            if is_etcd(&entry.path().join("exe")) {
                found.push(pid);
            }
        }
        match found.as_slice() {
            [] => Err(IoprioError::NoEtcdProcess),
            [pid] => Ok(*pid),
            _ => Err(IoprioError::MultipleEtcdProcesses),
        }
    }

    /// Put etcd in the real-time I/O class at the highest level.
    pub fn prioritize(&self) -> Result<i32, IoprioError> {
        let pid = self.find_etcd_pid()?;
        let prio = ioprio_value(IOPRIO_CLASS_RT, IOPRIO_LEVEL_HIGHEST);
        // SAFETY: ioprio_set takes plain integer arguments and touches no memory of ours.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_ioprio_set,
                IOPRIO_WHO_PROCESS,
                pid,
                prio as libc::c_int,
            )
        };
        if ret != 0 {
            return Err(IoprioError::Syscall {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        info!(pid, prio, "Raised etcd I/O priority");
        Ok(pid)
    }
}

// Processes we may not inspect are not etcd for our purposes.
fn is_etcd(exe: &Path) -> bool {
    match std::fs::read_link(exe) {
        Ok(target) => target.file_name().is_some_and(|name| name == ETCD_BINARY),
        Err(e) => {
            debug!(path = %exe.display(), error = %e, "Skipping unreadable process");
            false
        }
    }
}
