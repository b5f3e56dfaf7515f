// Scoped ownership of a container obtained for one restore call
use log::{Level, Log};
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::container::{Container, ContainerStatus};
use crate::error::Error;
use crate::logging::emit;

/// A container obtained for one restore call, together with the images
/// directory staged for it.
///
/// Exactly one of [`commit`](Self::commit) or [`rollback`](Self::rollback)
/// settles it. Dropping it unsettled rolls back.
pub struct RestoreGuard<'a> {
    container: Box<dyn Container>,
    images: PathBuf,
    created: bool,
    settled: bool,
    logger: &'a dyn Log,
}

impl<'a> RestoreGuard<'a> {
    pub fn new(
        container: Box<dyn Container>,
        images: PathBuf,
        created: bool,
        logger: &'a dyn Log,
    ) -> Self {
        RestoreGuard {
            container,
            images,
            created,
            settled: false,
            logger,
        }
    }

    pub fn container(&self) -> &dyn Container {
        self.container.as_ref()
    }

    pub fn container_mut(&mut self) -> &mut dyn Container {
        self.container.as_mut()
    }

    /// Whether this call created the record rather than loading it.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Keep the container and the images as they are.
    pub fn commit(mut self) {
        self.settled = true;
    }

    /// Undo what the failed call left behind and hand back `primary`.
    ///
    /// Nothing that goes wrong in here replaces `primary`; it is logged.
    pub fn rollback(mut self, primary: Error) -> Error {
        self.settled = true;
        emit(
            self.logger,
            Level::Debug,
            format_args!("Rolling back restore of {}: {}", self.container.id(), primary),
        );
        self.clean_up();
        primary
    }

    fn clean_up(&mut self) {
        let id = self.container.id().clone();
        match self.container.status() {
            Ok(ContainerStatus::Checkpointed) => {
                emit(
                    self.logger,
                    Level::Info,
                    format_args!(
                        "Container {} is still checkpointed, keeping {}",
                        id,
                        self.images.display()
                    ),
                );
                return;
            }
            Ok(_) => {}
            Err(e) => emit(
                self.logger,
                Level::Error,
                format_args!("Status of {} unknown during cleanup: {}", id, e),
            ),
        }

        if !self.created {
            emit(
                self.logger,
                Level::Warn,
                format_args!("Destroying pre-existing container {} after failed restore", id),
            );
        }
        if let Err(e) = self.container.destroy() {
            emit(
                self.logger,
                Level::Error,
                format_args!("Failed to destroy container {}: {}", id, e),
            );
        }
        match fs::remove_dir_all(&self.images) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => emit(
                self.logger,
                Level::Error,
                format_args!("Failed to remove {}: {}", self.images.display(), e),
            ),
        }
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            emit(
                self.logger,
                Level::Warn,
                format_args!("Restore of {} abandoned, cleaning up", self.container.id()),
            );
            self.clean_up();
        }
    }
}
