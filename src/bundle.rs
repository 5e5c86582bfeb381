//! OCI bundle loading and VM transformations.
//!
//! The shim receives a standard OCI bundle from containerd and must reshape
//! it before it can run inside a VM:
//!
//! - Bind mounts whose source lives in the bundle directory are inlined as
//!   extra files so the guest can materialize them; the mount source becomes
//!   a bare filename.
//! - The network namespace entry is removed; the VM boundary replaces it.
//! - The rootfs path is resolved on the host and normalized to `rootfs` in
//!   the spec, which is where the guest mounts the root filesystem.
//!
//! The guest applies a second round of relaxation at create time (see
//! [`relax_for_guest`]): seccomp and masked/readonly paths are host-side
//! hardening that does not apply inside a dedicated VM, and the devices
//! cgroup is opened up because the guest owns all of its devices.
//!
//! Spec parsing preserves unknown fields through flattened maps, so fields
//! this shim does not interpret survive the host→guest round trip intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

// =============================================================================
// OCI Runtime Spec (interpreted subset)
// =============================================================================

/// OCI runtime spec; fields the shim rewrites are typed, everything else is
/// carried verbatim in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciSpec {
    /// Process to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<OciProcess>,
    /// Root filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<OciRoot>,
    /// Hostname inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Mount table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<OciMount>,
    /// Linux-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
    /// Uninterpreted fields, preserved on re-marshal.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Process section of the spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciProcess {
    /// Allocate a terminal.
    #[serde(default)]
    pub terminal: bool,
    /// Argument vector.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    /// Uninterpreted fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Root filesystem section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciRoot {
    /// Path to the root filesystem, relative to the bundle or absolute.
    pub path: String,
    /// Mount the rootfs read-only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
    /// Uninterpreted fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One mount entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciMount {
    /// Mount point inside the container.
    pub destination: String,
    /// Filesystem type.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
    /// Mount source.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Uninterpreted fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Linux section of the spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciLinux {
    /// Namespaces to create or join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<OciNamespace>,
    /// Seccomp profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<serde_json::Value>,
    /// Paths masked inside the container.
    #[serde(
        rename = "maskedPaths",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub masked_paths: Vec<String>,
    /// Paths made read-only inside the container.
    #[serde(
        rename = "readonlyPaths",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub readonly_paths: Vec<String>,
    /// Resource limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<OciResources>,
    /// Uninterpreted fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One namespace entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciNamespace {
    /// Namespace type (pid, network, mount, ...).
    #[serde(rename = "type")]
    pub ns_type: String,
    /// Existing namespace path to join.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// Resources section; only the devices cgroup is interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciResources {
    /// Device cgroup rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<OciDeviceCgroup>,
    /// Uninterpreted fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One device cgroup rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciDeviceCgroup {
    /// Allow or deny.
    pub allow: bool,
    /// Device type (c, b, a).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub dev_type: Option<String>,
    /// Major number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    /// Minor number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    /// Access string (rwm).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

// =============================================================================
// Bundle
// =============================================================================

/// A transform mutates a bundle before it is sent to the VM.
pub type Transform = fn(&mut Bundle) -> Result<()>;

/// An OCI bundle plus the extra files the VM needs to set containers up.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Bundle directory on the host.
    pub path: PathBuf,
    /// Parsed (and possibly transformed) spec.
    pub spec: OciSpec,
    /// Absolute host path of the root filesystem.
    pub rootfs: PathBuf,

    // Extra files are private so consumers go through files(), which always
    // includes the re-marshaled spec.
    extra_files: HashMap<String, Vec<u8>>,
}

impl Bundle {
    /// Loads an OCI bundle and applies transforms, turning the host-side
    /// bundle into a VM-side bundle.
    pub fn load(path: impl AsRef<Path>, transforms: &[Transform]) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("bundle path cannot be empty".into()));
        }

        let config_path = path.join("config.json");
        let spec_bytes = std::fs::read(&config_path).map_err(|e| Error::InvalidBundle {
            path: path.to_path_buf(),
            reason: format!("failed to read config.json: {e}"),
        })?;
        let spec: OciSpec =
            serde_json::from_slice(&spec_bytes).map_err(|e| Error::InvalidBundle {
                path: path.to_path_buf(),
                reason: format!("failed to parse spec: {e}"),
            })?;

        let mut bundle = Self {
            path: path.to_path_buf(),
            spec,
            rootfs: PathBuf::new(),
            extra_files: HashMap::new(),
        };

        resolve_rootfs_path(&mut bundle)?;
        for transform in transforms {
            transform(&mut bundle)?;
        }

        Ok(bundle)
    }

    /// Loads a bundle with the standard create-time transforms applied.
    pub fn load_for_create(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(path, &[transform_bind_mounts, disable_network_namespace])
    }

    /// Adds a file that is not part of the OCI spec but must be placed in
    /// the VM alongside it.
    pub fn add_extra_file(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("file name cannot be empty".into()));
        }
        if name == "config.json" {
            return Err(Error::InvalidArgument(
                "cannot override config.json".into(),
            ));
        }
        // Extra files land in a flat directory in the guest; path components
        // would escape it.
        let as_path = Path::new(name);
        if as_path.components().count() != 1 || name == "." || name == ".." {
            return Err(Error::InvalidArgument(format!(
                "file name {name:?} must not contain path separators or relative components"
            )));
        }

        self.extra_files.insert(name.to_string(), data);
        Ok(())
    }

    /// All files to set up inside the VM: the extra files plus the
    /// re-marshaled spec as `config.json`. Returns a deep copy.
    pub fn files(&self) -> Result<HashMap<String, Vec<u8>>> {
        let mut files = HashMap::with_capacity(self.extra_files.len() + 1);
        for (name, data) in &self.extra_files {
            files.insert(name.clone(), data.clone());
        }
        files.insert("config.json".to_string(), serde_json::to_vec(&self.spec)?);
        Ok(files)
    }

    /// Whether the spec requests a terminal.
    #[must_use]
    pub fn wants_terminal(&self) -> bool {
        self.spec.process.as_ref().is_some_and(|p| p.terminal)
    }
}

/// Resolves the absolute rootfs path on the host and normalizes the spec's
/// root to `rootfs`, which is where the guest expects it.
fn resolve_rootfs_path(b: &mut Bundle) -> Result<()> {
    let root = b.spec.root.as_mut().ok_or_else(|| Error::InvalidBundle {
        path: b.path.clone(),
        reason: "root path not specified".into(),
    })?;

    let root_path = Path::new(&root.path);
    b.rootfs = if root_path.is_absolute() {
        root_path.to_path_buf()
    } else {
        b.path.join(root_path)
    };
    root.path = "rootfs".to_string();

    Ok(())
}

// =============================================================================
// Host-Side Transforms
// =============================================================================

/// Converts bundle-local bind mounts into extra files.
///
/// Only mounts whose source parent is the bundle directory are inlined;
/// anything else is left alone (and will simply be missing in the guest,
/// matching the VM boundary semantics).
pub fn transform_bind_mounts(b: &mut Bundle) -> Result<()> {
    let bundle_base = b.path.file_name().map(|n| n.to_os_string());

    let mut inlined = Vec::new();
    for mount in &mut b.spec.mounts {
        if mount.fs_type != "bind" {
            continue;
        }
        let source = Path::new(&mount.source);
        let Some(filename) = source.file_name().map(|n| n.to_os_string()) else {
            continue;
        };
        let parent_base = source
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_os_string());
        if parent_base != bundle_base {
            debug!(source = %mount.source, "ignoring bind mount outside bundle");
            continue;
        }

        let data = std::fs::read(source).map_err(|e| Error::InvalidBundle {
            path: b.path.clone(),
            reason: format!("failed to read mount file {filename:?}: {e}"),
        })?;
        let name = filename.to_string_lossy().into_owned();
        mount.source = name.clone();
        inlined.push((name, data));
    }

    for (name, data) in inlined {
        b.add_extra_file(&name, data)?;
    }
    Ok(())
}

/// Removes the network namespace from the spec; containers share the VM's
/// network namespace.
pub fn disable_network_namespace(b: &mut Bundle) -> Result<()> {
    if let Some(linux) = b.spec.linux.as_mut() {
        linux.namespaces.retain(|ns| ns.ns_type != "network");
    }
    Ok(())
}

// =============================================================================
// Guest-Side Relaxation
// =============================================================================

/// Relaxes a spec for execution inside the VM.
///
/// Seccomp and masked/readonly paths protect a shared host kernel; inside a
/// dedicated VM they only break workloads. The devices cgroup is opened up
/// because the guest owns its devices. A read-only `/etc/resolv.conf` bind
/// mount is appended if the spec has none, so containers resolve through
/// the VM's DNS configuration.
pub fn relax_for_guest(spec: &mut OciSpec) {
    if let Some(linux) = spec.linux.as_mut() {
        linux.seccomp = None;
        linux.masked_paths.clear();
        linux.readonly_paths.clear();
        linux
            .resources
            .get_or_insert_with(OciResources::default)
            .devices = vec![OciDeviceCgroup {
            allow: true,
            dev_type: Some("a".to_string()),
            major: None,
            minor: None,
            access: Some("rwm".to_string()),
        }];
    }

    let has_resolv = spec
        .mounts
        .iter()
        .any(|m| m.destination == "/etc/resolv.conf");
    if !has_resolv {
        spec.mounts.push(OciMount {
            destination: "/etc/resolv.conf".to_string(),
            fs_type: "bind".to_string(),
            source: "/etc/resolv.conf".to_string(),
            options: vec!["rbind".to_string(), "ro".to_string()],
            extra: serde_json::Map::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> OciSpec {
        serde_json::from_value(serde_json::json!({
            "ociVersion": "1.0.2",
            "process": { "terminal": false, "args": ["/bin/sh"], "cwd": "/" },
            "root": { "path": "rootfs" },
            "linux": {
                "namespaces": [
                    { "type": "pid" },
                    { "type": "network" },
                    { "type": "mount" }
                ],
                "maskedPaths": ["/proc/kcore"],
                "readonlyPaths": ["/proc/sys"],
                "seccomp": { "defaultAction": "SCMP_ACT_ERRNO" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let spec = minimal_spec();
        assert!(spec.extra.contains_key("ociVersion"));

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ociVersion"], "1.0.2");
    }

    #[test]
    fn relax_clears_host_hardening() {
        let mut spec = minimal_spec();
        relax_for_guest(&mut spec);

        let linux = spec.linux.as_ref().unwrap();
        assert!(linux.seccomp.is_none());
        assert!(linux.masked_paths.is_empty());
        assert!(linux.readonly_paths.is_empty());

        let devices = &linux.resources.as_ref().unwrap().devices;
        assert_eq!(devices.len(), 1);
        assert!(devices[0].allow);
        assert_eq!(devices[0].access.as_deref(), Some("rwm"));
    }

    #[test]
    fn relax_appends_resolv_conf_once() {
        let mut spec = minimal_spec();
        relax_for_guest(&mut spec);
        relax_for_guest(&mut spec);

        let count = spec
            .mounts
            .iter()
            .filter(|m| m.destination == "/etc/resolv.conf")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn extra_file_name_validation() {
        let mut b = Bundle {
            path: PathBuf::from("/run/bundle/c1"),
            spec: OciSpec::default(),
            rootfs: PathBuf::new(),
            extra_files: HashMap::new(),
        };

        assert!(b.add_extra_file("hosts", b"127.0.0.1".to_vec()).is_ok());
        assert!(b.add_extra_file("", Vec::new()).is_err());
        assert!(b.add_extra_file("config.json", Vec::new()).is_err());
        assert!(b.add_extra_file("../escape", Vec::new()).is_err());
        assert!(b.add_extra_file("a/b", Vec::new()).is_err());
        assert!(b.add_extra_file(".", Vec::new()).is_err());
    }

    #[test]
    fn disable_network_namespace_keeps_others() {
        let mut b = Bundle {
            path: PathBuf::from("/run/bundle/c1"),
            spec: minimal_spec(),
            rootfs: PathBuf::new(),
            extra_files: HashMap::new(),
        };
        disable_network_namespace(&mut b).unwrap();

        let namespaces = &b.spec.linux.as_ref().unwrap().namespaces;
        assert_eq!(namespaces.len(), 2);
        assert!(namespaces.iter().all(|ns| ns.ns_type != "network"));
    }
}
