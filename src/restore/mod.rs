//! Restore orchestration
//!
//! Sequences one `restore` invocation: stage the images directory, obtain
//! the container record, claim it, wire up stdio, start signal supervision,
//! run the backend and either wait for the restored process or undo what
//! this call left behind.

pub mod guard;
pub mod options;

use log::{Level, Log};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use guard::RestoreGuard;
pub use options::{default_image_path, resolve_image_path, RestoreOptions, RestoreParams};

use crate::config::ContainerConfig;
use crate::container::{ContainerFactory, ContainerId, ContainerStatus, Process};
use crate::error::{Error, Result};
use crate::logging::emit;
use crate::signals::{Supervisor, SupervisorFactory};
use crate::terminal::Terminal;

/// Everything one invocation asks for.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub id: ContainerId,
    /// Directory holding all container records.
    pub root: PathBuf,
    /// Used only when no record exists yet.
    pub config: ContainerConfig,
    pub params: RestoreParams,
}

pub struct Restorer<'a> {
    factory: &'a dyn ContainerFactory,
    supervisors: &'a dyn SupervisorFactory,
    logger: &'a dyn Log,
}

impl<'a> Restorer<'a> {
    pub fn new(
        factory: &'a dyn ContainerFactory,
        supervisors: &'a dyn SupervisorFactory,
        logger: &'a dyn Log,
    ) -> Self {
        Restorer {
            factory,
            supervisors,
            logger,
        }
    }

    /// Restore the container and wait for its process to exit.
    ///
    /// Returns the restored process's exit code. Exiting with it is up to
    /// the caller.
    pub fn restore(&self, request: &RestoreRequest) -> Result<i32> {
        let RestoreRequest {
            id,
            root,
            config,
            params,
        } = request;

        // Staging comes first: a call that cannot stage its images must not
        // touch any container state.
        let images = resolve_image_path(params, root, id);
        let options = RestoreOptions::stage(images, params)?;

        let mut guard = match self.obtain(id, config, &options) {
            Ok(guard) => guard,
            Err(e) => {
                self.unstage(&options);
                return Err(e);
            }
        };

        let claim = match guard.container().lock() {
            Ok(claim) => claim,
            Err(e @ Error::Locked { .. }) => {
                guard.commit();
                return Err(e);
            }
            Err(e) => return Err(guard.rollback(e)),
        };

        match guard.container().status() {
            Ok(ContainerStatus::Running) => {
                drop(claim);
                guard.commit();
                return Err(Error::AlreadyRunning { id: id.to_string() });
            }
            Ok(status) => emit(
                self.logger,
                Level::Debug,
                format_args!("Container {} is {}", id, status),
            ),
            Err(e) => emit(
                self.logger,
                Level::Error,
                format_args!("Status query for {} failed: {}", id, e),
            ),
        }

        let mut process = Process::new(config.terminal);
        let terminal =
            match Terminal::attach(process.wants_terminal, &mut process, config.owner_uid) {
                Ok(terminal) => terminal,
                Err(e) => {
                    let err = guard.rollback(e);
                    drop(claim);
                    return Err(err);
                }
            };

        let mut supervisor = match self.supervisors.start(terminal) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                let err = guard.rollback(e);
                drop(claim);
                return Err(err);
            }
        };

        if let Err(e) = guard.container_mut().restore(&mut process, &options) {
            process.close_stdio();
            self.close(supervisor.as_mut(), id);
            self.remove_destroyed(&guard, root, id);
            let err = guard.rollback(Error::BackendRestore {
                id: id.to_string(),
                source: Box::new(e),
            });
            drop(claim);
            return Err(err);
        }

        emit(
            self.logger,
            Level::Info,
            format_args!(
                "Restored container {}{}",
                id,
                if guard.created() { " (new record)" } else { "" }
            ),
        );
        guard.commit();
        drop(claim);

        let result = supervisor.forward(&process);
        process.close_stdio();
        self.close(supervisor.as_mut(), id);
        result
    }

    /// Load the record, or create it when there is none.
    fn obtain(
        &self,
        id: &ContainerId,
        config: &ContainerConfig,
        options: &RestoreOptions,
    ) -> Result<RestoreGuard<'a>> {
        let (container, created) = match self.factory.load(id) {
            Ok(container) => (container, false),
            Err(e) if e.is_not_found() => {
                emit(
                    self.logger,
                    Level::Debug,
                    format_args!("No record for {}, creating one", id),
                );
                (self.factory.create(id, config)?, true)
            }
            Err(e) => return Err(e),
        };

        Ok(RestoreGuard::new(
            container,
            options.images_directory.clone(),
            created,
            self.logger,
        ))
    }

    /// Remove what staging created when no container could be obtained.
    fn unstage(&self, options: &RestoreOptions) {
        let Some(dir) = &options.staged_root else {
            return;
        };
        match fs::remove_dir_all(dir) {
            Ok(()) => emit(
                self.logger,
                Level::Debug,
                format_args!("Removed staged {}", dir.display()),
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => emit(
                self.logger,
                Level::Error,
                format_args!("Failed to remove staged {}: {}", dir.display(), e),
            ),
        }
    }

    fn close(&self, supervisor: &mut dyn Supervisor, id: &ContainerId) {
        if let Err(e) = supervisor.close() {
            emit(
                self.logger,
                Level::Error,
                format_args!("Failed to stop supervising {}: {}", id, e),
            );
        }
    }

    /// Drop `{root}/{id}` when the backend already tore the container down.
    fn remove_destroyed(&self, guard: &RestoreGuard<'_>, root: &Path, id: &ContainerId) {
        match guard.container().status() {
            Ok(ContainerStatus::Destroyed) => {
                let dest = root.join(id.as_str());
                match fs::remove_dir_all(&dest) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => emit(
                        self.logger,
                        Level::Error,
                        format_args!("Failed to remove {}: {}", dest.display(), e),
                    ),
                }
            }
            Ok(_) => {}
            Err(e) => emit(
                self.logger,
                Level::Error,
                format_args!("Status query for {} failed: {}", id, e),
            ),
        }
    }
}
