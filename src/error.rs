use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Invalid container state: {0}")]
    State(#[from] serde_json::Error),

    #[error("Invalid container id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Container {id} does not exist")]
    NotFound { id: String },

    #[error("Container {id} already exists")]
    AlreadyExists { id: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to create images directory {path}: {source}")]
    DirectoryCreate {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Container with id {id} already running")]
    AlreadyRunning { id: String },

    #[error("Container {id} is locked by another invocation")]
    Locked { id: String },

    #[error("Failed to query status of container {id}: {reason}")]
    StatusQuery { id: String, reason: String },

    #[error("Restore of container {id} failed: {source}")]
    BackendRestore {
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("CRIU failed: {reason}")]
    Criu { reason: String },

    #[error("Terminal setup failed: {0}")]
    Terminal(String),

    #[error("Supervision failed: {0}")]
    Supervisor(String),

    #[error("Logger already installed: {0}")]
    Logger(#[from] log::SetLoggerError),
}

/// Coarse classification used by the CLI to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller asked for something the container's state forbids.
    User,
    /// Failed while preparing, before any container state was touched.
    Setup,
    /// The restore itself failed; cleanup has already run.
    Backend,
    /// Everything else.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyRunning { .. } | Error::Locked { .. } => ErrorKind::User,
            Error::Config(_) | Error::DirectoryCreate { .. } | Error::InvalidId { .. } => {
                ErrorKind::Setup
            }
            Error::BackendRestore { .. } | Error::Criu { .. } => ErrorKind::Backend,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
