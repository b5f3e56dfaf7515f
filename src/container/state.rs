// Persisted container record: {root}/{id}/state.json
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{ContainerId, ContainerStatus};
use crate::config::ContainerConfig;
use crate::error::{Error, Result};

pub const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "restore.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: ContainerId,
    pub config: ContainerConfig,
    pub status: ContainerStatus,
    /// Pid of the restored init process, once there is one.
    pub init_pid: Option<i32>,
    /// Seconds since the epoch.
    pub created: u64,
}

impl State {
    pub fn new(id: ContainerId, config: ContainerConfig) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        State {
            id,
            config,
            status: ContainerStatus::Created,
            init_pid: None,
            created,
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(STATE_FILE)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).is_file()
    }

    /// Read the record stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let data = fs::read(Self::path(dir))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write the record to `dir`, replacing any previous one atomically.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!(".{}.tmp", STATE_FILE));
        let mut file = File::create(&tmp)?;
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, Self::path(dir))?;
        Ok(())
    }
}

/// Exclusive advisory lock on a container record.
///
/// Held from the status check until the backend returns, so two
/// invocations cannot both observe "not running" and restore the same
/// container. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: Option<File>,
}

impl StateLock {
    /// Take the lock on `dir` without blocking.
    pub fn acquire(dir: &Path, id: &ContainerId) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(Error::Locked {
                    id: id.to_string(),
                });
            }
            return Err(err.into());
        }

        log::debug!("Locked container {} at {}", id, dir.display());
        Ok(StateLock { file: Some(file) })
    }

    /// A lock that guards nothing, for records with no on-disk presence.
    pub fn unlocked() -> Self {
        StateLock { file: None }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}
