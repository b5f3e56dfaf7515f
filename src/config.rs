//! OCI runtime spec loading and the container configuration derived from it

use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::container::ContainerId;
use crate::error::{Error, Result};

pub const DEFAULT_SPEC_FILE: &str = "config.json";

/// Read an OCI runtime spec from `path`.
pub fn load_spec(path: &Path) -> Result<Spec> {
    if !path.is_file() {
        return Err(Error::Config(format!(
            "spec file {} not found",
            path.display()
        )));
    }
    Spec::load(path).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Configuration owned by a container record. Never changes once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Absolute path of the root filesystem.
    pub rootfs: PathBuf,
    pub readonly: bool,
    pub hostname: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub terminal: bool,
    pub uid: u32,
    pub gid: u32,
    /// Host uid that container uid 0 maps to; owns the console.
    pub owner_uid: u32,
}

impl ContainerConfig {
    /// Derive the configuration for container `id` from `spec`.
    ///
    /// A relative root path is resolved against `bundle`, the directory the
    /// spec was loaded from.
    pub fn build(id: &ContainerId, spec: &Spec, bundle: &Path) -> Result<Self> {
        let root = spec
            .root()
            .as_ref()
            .ok_or_else(|| Error::Config(format!("spec for {} has no root", id)))?;
        let process = spec
            .process()
            .as_ref()
            .ok_or_else(|| Error::Config(format!("spec for {} has no process", id)))?;

        let args = process.args().clone().unwrap_or_default();
        if args.is_empty() {
            return Err(Error::Config(format!(
                "spec for {} has an empty process.args",
                id
            )));
        }

        let rootfs = if root.path().is_absolute() {
            root.path().clone()
        } else {
            bundle.join(root.path())
        };

        let owner_uid = spec
            .linux()
            .as_ref()
            .and_then(|linux| linux.uid_mappings().as_ref())
            .and_then(|mappings| mappings.iter().find(|m| m.container_id() == 0))
            .map(|m| m.host_id())
            .unwrap_or(0);

        let config = ContainerConfig {
            rootfs,
            readonly: root.readonly().unwrap_or(false),
            hostname: spec.hostname().clone(),
            args,
            env: process.env().clone().unwrap_or_default(),
            cwd: process.cwd().clone(),
            terminal: process.terminal().unwrap_or(false),
            uid: process.user().uid(),
            gid: process.user().gid(),
            owner_uid,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.rootfs.is_absolute() {
            return Err(Error::Config(format!(
                "rootfs {} is not an absolute path",
                self.rootfs.display()
            )));
        }
        if !self.cwd.as_os_str().is_empty() && !self.cwd.is_absolute() {
            return Err(Error::Config(format!(
                "cwd {} is not an absolute path",
                self.cwd.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn sample_config() -> ContainerConfig {
        ContainerConfig {
            rootfs: PathBuf::from("/var/lib/crest/rootfs"),
            readonly: false,
            hostname: Some("sample".to_string()),
            args: vec!["sh".to_string()],
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            cwd: PathBuf::from("/"),
            terminal: false,
            uid: 0,
            gid: 0,
            owner_uid: 0,
        }
    }

    const SPEC: &str = r#"{
        "ociVersion": "1.0.2",
        "root": { "path": "rootfs", "readonly": true },
        "hostname": "restored",
        "process": {
            "terminal": true,
            "user": { "uid": 1000, "gid": 100 },
            "args": ["sleep", "infinity"],
            "env": ["TERM=xterm"],
            "cwd": "/srv"
        },
        "linux": {
            "uidMappings": [{ "containerID": 0, "hostID": 100000, "size": 65536 }],
            "gidMappings": [{ "containerID": 0, "hostID": 100000, "size": 65536 }]
        }
    }"#;

    fn write_spec(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join(DEFAULT_SPEC_FILE);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_build_from_spec() {
        let bundle = tempfile::tempdir().unwrap();
        let spec = load_spec(&write_spec(bundle.path(), SPEC)).unwrap();
        let id = ContainerId::new("c1").unwrap();

        let config = ContainerConfig::build(&id, &spec, bundle.path()).unwrap();
        assert_eq!(config.rootfs, bundle.path().join("rootfs"));
        assert!(config.readonly);
        assert!(config.terminal);
        assert_eq!(config.hostname.as_deref(), Some("restored"));
        assert_eq!(config.args, vec!["sleep", "infinity"]);
        assert_eq!(config.cwd, PathBuf::from("/srv"));
        assert_eq!((config.uid, config.gid), (1000, 100));
        assert_eq!(config.owner_uid, 100000);
    }

    #[test]
    fn test_build_rejects_spec_without_args() {
        let bundle = tempfile::tempdir().unwrap();
        let no_args = SPEC.replace(r#""args": ["sleep", "infinity"],"#, "");
        let spec = load_spec(&write_spec(bundle.path(), &no_args)).unwrap();
        let id = ContainerId::new("c1").unwrap();

        match ContainerConfig::build(&id, &spec, bundle.path()) {
            Err(Error::Config(msg)) => assert!(msg.contains("process.args")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_spec_file_is_config_error() {
        let bundle = tempfile::tempdir().unwrap();
        let err = load_spec(&bundle.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_relative_rootfs_fails_validation() {
        let mut config = sample_config();
        config.rootfs = PathBuf::from("rootfs");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
