// Filesystem-backed container records restored through CRIU
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{getpgid, getpgrp, Pid};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::state::{State, StateLock};
use super::{Container, ContainerFactory, ContainerId, ContainerStatus, Process};
use crate::config::ContainerConfig;
use crate::criu::Criu;
use crate::error::{Error, Result};
use crate::restore::RestoreOptions;

const PIDFILE: &str = "restore.pid";

/// Loads and creates container records under one root directory.
#[derive(Debug, Clone)]
pub struct LinuxFactory {
    root: PathBuf,
    criu: Criu,
}

impl LinuxFactory {
    pub fn new(root: impl Into<PathBuf>, criu: Criu) -> Self {
        LinuxFactory {
            root: root.into(),
            criu,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl ContainerFactory for LinuxFactory {
    fn load(&self, id: &ContainerId) -> Result<Box<dyn Container>> {
        let dir = self.container_dir(id);
        if !State::exists(&dir) {
            return Err(Error::NotFound { id: id.to_string() });
        }

        let state = State::load(&dir)?;
        // Leftover of a failed restore whose cleanup did not finish.
        if state.status == ContainerStatus::Destroyed {
            return Err(Error::NotFound { id: id.to_string() });
        }
        if &state.id != id {
            return Err(Error::Config(format!(
                "record in {} belongs to container {}",
                dir.display(),
                state.id
            )));
        }
        log::debug!("Loaded container {} ({})", id, state.status);

        Ok(Box::new(LinuxContainer {
            dir,
            state,
            criu: self.criu.clone(),
        }))
    }

    fn create(&self, id: &ContainerId, config: &ContainerConfig) -> Result<Box<dyn Container>> {
        config.validate()?;

        let dir = self.container_dir(id);
        if State::exists(&dir) {
            let previous = State::load(&dir)?;
            if previous.status != ContainerStatus::Destroyed {
                return Err(Error::AlreadyExists { id: id.to_string() });
            }
            log::warn!("Replacing destroyed record of container {}", id);
        }
        // The directory may already hold staged checkpoint images.
        fs::create_dir_all(&dir)?;

        let state = State::new(id.clone(), config.clone());
        state.save(&dir)?;
        log::info!("Created container {} in {}", id, dir.display());

        Ok(Box::new(LinuxContainer {
            dir,
            state,
            criu: self.criu.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct LinuxContainer {
    dir: PathBuf,
    state: State,
    criu: Criu,
}

impl LinuxContainer {
    fn persist(&mut self, status: ContainerStatus) -> Result<()> {
        self.state.status = status;
        self.state.save(&self.dir)
    }
}

fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Kill a restored tree that cannot be recorded, so no live process is
/// left behind a record that is about to be destroyed.
fn kill_restored(pid: Pid) {
    let result = match getpgid(Some(pid)) {
        Ok(group) if group != getpgrp() => killpg(group, Signal::SIGKILL),
        _ => kill(pid, Signal::SIGKILL),
    };
    if let Err(e) = result {
        if e != Errno::ESRCH {
            log::error!("Failed to kill restored process {}: {}", pid, e);
        }
        return;
    }
    // Ours to reap once reparented to this subreaper.
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(_) | Err(Errno::ECHILD) => break,
            Err(e) => {
                log::warn!("Failed to reap restored process {}: {}", pid, e);
                break;
            }
        }
    }
}

/// Status as seen from disk: a running record whose init is gone is dead.
fn derive_status(state: &State) -> ContainerStatus {
    match state.status {
        ContainerStatus::Running | ContainerStatus::Paused => match state.init_pid {
            Some(pid) if is_alive(pid) => state.status,
            _ => ContainerStatus::Destroyed,
        },
        status => status,
    }
}

impl Container for LinuxContainer {
    fn id(&self) -> &ContainerId {
        &self.state.id
    }

    fn status(&self) -> Result<ContainerStatus> {
        if !State::exists(&self.dir) {
            return Ok(ContainerStatus::Destroyed);
        }
        let state = State::load(&self.dir).map_err(|e| Error::StatusQuery {
            id: self.state.id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(derive_status(&state))
    }

    fn lock(&self) -> Result<StateLock> {
        if !self.dir.is_dir() {
            return Ok(StateLock::unlocked());
        }
        StateLock::acquire(&self.dir, &self.state.id)
    }

    fn restore(&mut self, process: &mut Process, options: &RestoreOptions) -> Result<()> {
        let prior = self.status()?;
        match prior {
            ContainerStatus::Running => {
                return Err(Error::AlreadyRunning {
                    id: self.state.id.to_string(),
                })
            }
            ContainerStatus::Destroyed if !State::exists(&self.dir) => {
                return Err(Error::NotFound {
                    id: self.state.id.to_string(),
                })
            }
            _ => {}
        }

        let pidfile = self.dir.join(PIDFILE);
        match self
            .criu
            .restore(&self.state.config.rootfs, options, process, &pidfile)
        {
            Ok(pid) => {
                self.state.init_pid = Some(pid.as_raw());
                if let Err(e) = self.persist(ContainerStatus::Running) {
                    log::error!(
                        "Cannot record {} as running, killing restored process {}: {}",
                        self.state.id,
                        pid,
                        e
                    );
                    kill_restored(pid);
                    self.state.init_pid = None;
                    self.state.status = prior;
                    return Err(e);
                }
                process.pid = Some(pid);
                log::info!("Container {} restored, init pid {}", self.state.id, pid);
                Ok(())
            }
            Err(err) => {
                // A checkpointed record keeps its images for another try;
                // anything else was torn down by the failed restore.
                if prior != ContainerStatus::Checkpointed {
                    self.state.init_pid = None;
                    if let Err(e) = self.persist(ContainerStatus::Destroyed) {
                        log::error!("Failed to record {} as destroyed: {}", self.state.id, e);
                    }
                }
                Err(err)
            }
        }
    }

    fn destroy(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.state.status = ContainerStatus::Destroyed;
        log::info!("Destroyed container {}", self.state.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::restore::RestoreParams;
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::Duration;

    // Restores a `sleep` and then makes the state file impossible to write.
    const UNRECORDABLE_CRIU: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    [ "$1" = --pidfile ] && pidfile="$2"
    shift
done
sleep 30 &
echo $! > "$pidfile"
mkdir "$(dirname "$pidfile")/.state.json.tmp"
"#;

    /// Gone, or a zombie nobody has reaped yet.
    fn is_dead(pid: i32) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map_or(false, |(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    fn id(s: &str) -> ContainerId {
        ContainerId::new(s).unwrap()
    }

    fn options(images: &Path) -> RestoreOptions {
        RestoreOptions::stage(images.to_path_buf(), &RestoreParams::default()).unwrap()
    }

    #[test]
    fn test_create_then_load() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());

        let created = factory.create(&id("c1"), &sample_config()).unwrap();
        assert_eq!(created.status().unwrap(), ContainerStatus::Created);
        assert!(root.path().join("c1/state.json").is_file());

        let loaded = factory.load(&id("c1")).unwrap();
        assert_eq!(loaded.id().as_str(), "c1");
        assert_eq!(loaded.status().unwrap(), ContainerStatus::Created);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());
        let err = factory.load(&id("ghost")).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_twice_fails() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());
        factory.create(&id("c1"), &sample_config()).unwrap();

        match factory.create(&id("c1"), &sample_config()) {
            Err(Error::AlreadyExists { id }) => assert_eq!(id, "c1"),
            Err(other) => panic!("expected AlreadyExists, got {:?}", other),
            Ok(_) => panic!("second create succeeded"),
        }
    }

    #[test]
    fn test_destroyed_leftover_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());
        factory.create(&id("c1"), &sample_config()).unwrap();

        let dir = root.path().join("c1");
        let mut state = State::load(&dir).unwrap();
        state.status = ContainerStatus::Destroyed;
        state.save(&dir).unwrap();

        assert!(factory.load(&id("c1")).err().unwrap().is_not_found());
        let container = factory.create(&id("c1"), &sample_config()).unwrap();
        assert_eq!(container.status().unwrap(), ContainerStatus::Created);
    }

    #[test]
    fn test_create_tolerates_staged_images() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("c1/checkpoint")).unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());
        assert!(factory.create(&id("c1"), &sample_config()).is_ok());
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());
        let mut config = sample_config();
        config.rootfs = PathBuf::from("relative");
        assert!(matches!(
            factory.create(&id("c1"), &config),
            Err(Error::Config(_))
        ));
        assert!(!root.path().join("c1").exists());
    }

    #[test]
    fn test_running_record_with_dead_pid_is_destroyed() {
        let mut state = State::new(id("c1"), sample_config());
        state.status = ContainerStatus::Running;
        state.init_pid = None;
        assert_eq!(derive_status(&state), ContainerStatus::Destroyed);

        state.init_pid = Some(std::process::id() as i32);
        assert_eq!(derive_status(&state), ContainerStatus::Running);

        state.status = ContainerStatus::Checkpointed;
        assert_eq!(derive_status(&state), ContainerStatus::Checkpointed);
    }

    #[test]
    fn test_destroy_removes_record() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());
        let mut container = factory.create(&id("c1"), &sample_config()).unwrap();

        container.destroy().unwrap();
        assert!(!root.path().join("c1").exists());
        assert_eq!(container.status().unwrap(), ContainerStatus::Destroyed);
        // Destroying twice is harmless.
        container.destroy().unwrap();
    }

    #[test]
    fn test_failed_restore_of_created_record_marks_destroyed() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::new("false"));
        let mut container = factory.create(&id("c1"), &sample_config()).unwrap();

        let images = root.path().join("c1/checkpoint");
        let opts = options(&images);
        fs::write(images.join("inventory.img"), [0u8; 16]).unwrap();

        let mut process = Process::new(false);
        let err = container.restore(&mut process, &opts).unwrap_err();
        assert!(matches!(err, Error::Criu { .. }));
        assert!(process.pid.is_none());
        assert_eq!(container.status().unwrap(), ContainerStatus::Destroyed);
    }

    #[test]
    fn test_failed_restore_keeps_checkpointed_record() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::new("false"));
        factory.create(&id("c1"), &sample_config()).unwrap();

        let dir = root.path().join("c1");
        let mut state = State::load(&dir).unwrap();
        state.status = ContainerStatus::Checkpointed;
        state.save(&dir).unwrap();

        let mut container = factory.load(&id("c1")).unwrap();
        let opts = options(&dir.join("checkpoint"));
        let mut process = Process::new(false);
        assert!(container.restore(&mut process, &opts).is_err());
        assert_eq!(container.status().unwrap(), ContainerStatus::Checkpointed);
    }

    #[test]
    fn test_lock_is_exclusive_per_record() {
        let root = tempfile::tempdir().unwrap();
        let factory = LinuxFactory::new(root.path(), Criu::default());
        let container = factory.create(&id("c1"), &sample_config()).unwrap();

        let held = container.lock().unwrap();
        assert!(held.is_held());
        assert!(matches!(container.lock(), Err(Error::Locked { .. })));
        drop(held);
        assert!(container.lock().is_ok());
    }

    #[test]
    fn test_unrecordable_restore_kills_restored_process() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("criu");
        fs::write(&script, UNRECORDABLE_CRIU).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let factory = LinuxFactory::new(tmp.path().join("root"), Criu::new(&script));
        let mut container = factory.create(&id("c1"), &sample_config()).unwrap();
        let dir = tmp.path().join("root/c1");
        let opts = options(&dir.join("checkpoint"));
        fs::write(dir.join("checkpoint/inventory.img"), [0u8; 16]).unwrap();

        let mut process = Process::new(false);
        let err = container.restore(&mut process, &opts).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(process.pid.is_none());

        let pid: i32 = fs::read_to_string(dir.join(PIDFILE))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let dead = (0..100).any(|_| {
            if is_dead(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
            false
        });
        assert!(dead, "restored process {} survived", pid);
    }
}
