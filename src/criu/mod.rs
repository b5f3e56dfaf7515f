//! CRIU backend
//!
//! Restores a process tree by running the external `criu` binary against a
//! staged images directory. The tree is restored detached, so its init
//! process is reparented to the nearest subreaper and its pid is reported
//! through a pidfile.

use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::container::Process;
use crate::error::{Error, Result};
use crate::images::ImageDir;
use crate::restore::RestoreOptions;

pub const DEFAULT_BINARY: &str = "criu";
pub const RESTORE_LOG: &str = "restore.log";

#[derive(Debug, Clone)]
pub struct Criu {
    binary: PathBuf,
}

impl Default for Criu {
    fn default() -> Self {
        Criu::new(DEFAULT_BINARY)
    }
}

impl Criu {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Criu {
            binary: binary.into(),
        }
    }

    /// Where CRIU writes its restore log for `options`.
    pub fn log_path(options: &RestoreOptions) -> PathBuf {
        options
            .work_directory
            .as_deref()
            .unwrap_or(&options.images_directory)
            .join(RESTORE_LOG)
    }

    pub fn restore_args(
        &self,
        rootfs: &Path,
        options: &RestoreOptions,
        pidfile: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "restore".into(),
            "-D".into(),
            options.images_directory.clone().into(),
        ];
        if let Some(work) = &options.work_directory {
            args.push("-W".into());
            args.push(work.clone().into());
        }
        args.push("--root".into());
        args.push(rootfs.into());
        args.push("--restore-detached".into());
        args.push("--pidfile".into());
        args.push(pidfile.into());
        args.push("-v4".into());
        args.push("-o".into());
        args.push(RESTORE_LOG.into());

        // leave_running has no meaning on the restore side.
        let flags = [
            (options.tcp_established, "--tcp-established"),
            (options.external_unix_sockets, "--ext-unix-sk"),
            (options.shell_job, "--shell-job"),
            (options.file_locks, "--file-locks"),
        ];
        for (enabled, flag) in flags {
            if enabled {
                args.push(flag.into());
            }
        }
        args
    }

    /// Run `criu restore` and return the pid of the restored init process.
    ///
    /// The process's stdio are handed to CRIU; whatever is unset is
    /// inherited from the caller.
    pub fn restore(
        &self,
        rootfs: &Path,
        options: &RestoreOptions,
        process: &mut Process,
        pidfile: &Path,
    ) -> Result<Pid> {
        ImageDir::open(&options.images_directory)?.require_checkpoint()?;

        if let Err(err) = fs::remove_file(pidfile) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        let args = self.restore_args(rootfs, options, pidfile);
        log::info!("Running {} {:?}", self.binary.display(), args);

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(take_stdio(&mut process.stdin))
            .stdout(take_stdio(&mut process.stdout))
            .stderr(take_stdio(&mut process.stderr));

        let status = cmd.status().map_err(|e| Error::Criu {
            reason: format!("failed to run {}: {}", self.binary.display(), e),
        })?;
        if !status.success() {
            return Err(Error::Criu {
                reason: format!(
                    "{} restore {}, see {}",
                    self.binary.display(),
                    status,
                    Self::log_path(options).display()
                ),
            });
        }

        let pid = read_pidfile(pidfile)?;
        log::info!("CRIU restored init process {}", pid);
        Ok(pid)
    }
}

fn take_stdio(slot: &mut Option<std::os::fd::OwnedFd>) -> Stdio {
    match slot.take() {
        Some(fd) => Stdio::from(fd),
        None => Stdio::inherit(),
    }
}

fn read_pidfile(path: &Path) -> Result<Pid> {
    let contents = fs::read_to_string(path).map_err(|e| Error::Criu {
        reason: format!("cannot read pidfile {}: {}", path.display(), e),
    })?;
    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
        _ => Err(Error::Criu {
            reason: format!(
                "pidfile {} holds no valid pid: {:?}",
                path.display(),
                contents.trim()
            ),
        }),
    }
}
