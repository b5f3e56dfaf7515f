// Restore options and images directory staging
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::container::ContainerId;
use crate::error::{Error, Result};

/// Directory name for checkpoint images inside a container's state dir.
pub const CHECKPOINT_DIR: &str = "checkpoint";

/// Flags as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct RestoreParams {
    pub image_path: Option<PathBuf>,
    pub work_path: Option<PathBuf>,
    pub tcp_established: bool,
    pub ext_unix_sk: bool,
    pub shell_job: bool,
    pub file_locks: bool,
    pub leave_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    pub images_directory: PathBuf,
    /// Outermost directory that staging had to create, if any.
    pub staged_root: Option<PathBuf>,
    pub work_directory: Option<PathBuf>,
    pub tcp_established: bool,
    pub external_unix_sockets: bool,
    pub shell_job: bool,
    pub file_locks: bool,
    pub leave_running: bool,
}

/// Where images live when no `--image-path` is given.
pub fn default_image_path(root: &Path, id: &ContainerId) -> PathBuf {
    root.join(id.as_str()).join(CHECKPOINT_DIR)
}

/// Explicit override, else the default under `{root}/{id}`.
pub fn resolve_image_path(params: &RestoreParams, root: &Path, id: &ContainerId) -> PathBuf {
    match &params.image_path {
        Some(path) if !path.as_os_str().is_empty() => path.clone(),
        _ => default_image_path(root, id),
    }
}

/// Outermost ancestor of `path` (or `path` itself) that does not exist yet.
fn outermost_missing(path: &Path) -> Option<PathBuf> {
    let mut missing = None;
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() || ancestor.symlink_metadata().is_ok() {
            break;
        }
        missing = Some(ancestor.to_path_buf());
    }
    missing
}

impl RestoreOptions {
    /// Build the options for one restore call, creating `images` on disk.
    ///
    /// This is the only side effect; the caller must not touch any container
    /// state when it fails.
    pub fn stage(images: PathBuf, params: &RestoreParams) -> Result<Self> {
        let staged_root = outermost_missing(&images);
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&images)
            .map_err(|source| Error::DirectoryCreate {
                path: images.display().to_string(),
                source,
            })?;
        log::debug!("Staged images directory {}", images.display());

        Ok(RestoreOptions {
            images_directory: images,
            staged_root,
            work_directory: params
                .work_path
                .clone()
                .filter(|p| !p.as_os_str().is_empty()),
            tcp_established: params.tcp_established,
            external_unix_sockets: params.ext_unix_sk,
            shell_job: params.shell_job,
            file_locks: params.file_locks,
            leave_running: params.leave_running,
        })
    }
}
