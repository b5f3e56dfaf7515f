//! Container records and the operations restore consumes from them
//!
//! A container lives under `{root}/{id}/`. The factory reconstructs it from
//! that directory or creates a fresh record there; the container itself
//! answers status queries, performs the CRIU restore and destroys its
//! persisted state.

pub mod linux;
pub mod state;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::OwnedFd;

use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::restore::RestoreOptions;

pub use linux::{LinuxContainer, LinuxFactory};
pub use state::{State, StateLock};

/// Container identifier, unique within one root directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Validate `id` so it can be used as a single path component.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id == "." || id == ".." {
            Some("must not be a relative path component")
        } else if id.contains('/') || id.contains('\0') {
            Some("must not contain '/' or NUL")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidId {
                id,
                reason: reason.to_string(),
            }),
            None => Ok(ContainerId(id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Checkpointed,
    Destroyed,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Checkpointed => "checkpointed",
            ContainerStatus::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// The process being restored, scoped to a single restore call.
///
/// Unset stdio slots are inherited from the caller. `pid` is filled in by
/// the container once the backend has revived the process tree.
#[derive(Debug, Default)]
pub struct Process {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    pub wants_terminal: bool,
    pub pid: Option<Pid>,
}

impl Process {
    pub fn new(wants_terminal: bool) -> Self {
        Process {
            wants_terminal,
            ..Default::default()
        }
    }

    /// Drop whatever stdio ends were never handed to the backend.
    pub fn close_stdio(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}

/// Operations the restore path needs from a container record.
pub trait Container {
    fn id(&self) -> &ContainerId;

    /// Current status, derived from persisted state and process liveness.
    fn status(&self) -> Result<ContainerStatus>;

    /// Claim the record for this invocation.
    ///
    /// Fails with [`Error::Locked`] while another invocation holds it.
    fn lock(&self) -> Result<StateLock>;

    /// Revive the checkpointed process tree. On success `process.pid` is set
    /// and the status becomes Running.
    fn restore(&mut self, process: &mut Process, options: &RestoreOptions) -> Result<()>;

    /// Remove the persisted state. Destroyed is terminal.
    fn destroy(&mut self) -> Result<()>;
}

pub trait ContainerFactory {
    fn load(&self, id: &ContainerId) -> Result<Box<dyn Container>>;

    fn create(&self, id: &ContainerId, config: &ContainerConfig) -> Result<Box<dyn Container>>;
}
