//! Filesystem locations and binary discovery.
//!
//! All paths honor an environment override first and fall back to the
//! compiled default, so packaging and tests can relocate everything.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Binaries, kernel, and config directory.
pub const SHARE_DIR: &str = "/usr/share/kvmbox";

/// State files directory (per-shim state lives underneath).
pub const STATE_DIR: &str = "/var/lib/kvmbox";

/// Logs directory.
pub const LOG_DIR: &str = "/var/log/kvmbox";

/// Kernel image name shipped in the share directory.
pub const KERNEL_NAME: &str = "kvmbox-kernel-x86_64";

/// Initrd name shipped in the share directory.
pub const INITRD_NAME: &str = "kvmbox-initrd";

fn env_or(var: &str, default: &str) -> PathBuf {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => PathBuf::from(default),
    }
}

/// Share directory, honoring `KVMBOX_SHARE_DIR`.
#[must_use]
pub fn share_dir() -> PathBuf {
    env_or("KVMBOX_SHARE_DIR", SHARE_DIR)
}

/// State directory, honoring `KVMBOX_STATE_DIR`.
#[must_use]
pub fn state_dir() -> PathBuf {
    env_or("KVMBOX_STATE_DIR", STATE_DIR)
}

/// Log directory, honoring `KVMBOX_LOG_DIR`.
#[must_use]
pub fn log_dir() -> PathBuf {
    env_or("KVMBOX_LOG_DIR", LOG_DIR)
}

/// Per-container VM state directory under the state root.
#[must_use]
pub fn vm_state_dir(container_id: &str) -> PathBuf {
    state_dir().join("vms").join(container_id)
}

/// Directories searched for the kernel and initrd: `PATH` entries first,
/// then the share directories.
#[must_use]
pub fn kernel_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(path_env) = std::env::var("PATH") {
        paths.extend(std::env::split_paths(&path_env));
    }
    paths.push(share_dir());
    paths.push(PathBuf::from(SHARE_DIR));
    paths.push(PathBuf::from("/usr/local/share/kvmbox"));
    paths
}

fn find_in_search_paths(name: &str) -> Option<PathBuf> {
    for dir in kernel_search_paths() {
        let candidate = if dir.as_os_str().is_empty() {
            Path::new(".").join(name)
        } else {
            dir.join(name)
        };
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Locates the guest kernel image.
pub fn find_kernel() -> Result<PathBuf> {
    find_in_search_paths(KERNEL_NAME).ok_or_else(|| {
        Error::HypervisorUnavailable(format!(
            "kernel {KERNEL_NAME:?} not found in search paths (set KVMBOX_SHARE_DIR or install to {SHARE_DIR})"
        ))
    })
}

/// Locates the guest initrd.
pub fn find_initrd() -> Result<PathBuf> {
    find_in_search_paths(INITRD_NAME).ok_or_else(|| {
        Error::HypervisorUnavailable(format!(
            "initrd {INITRD_NAME:?} not found in search paths (set KVMBOX_SHARE_DIR or install to {SHARE_DIR})"
        ))
    })
}

/// Locates the QEMU binary: `QEMU_PATH` override, then `PATH`, then common
/// installation locations.
pub fn find_qemu() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("QEMU_PATH") {
        if !path.is_empty() {
            let p = PathBuf::from(&path);
            if p.is_file() {
                return Ok(p);
            }
            return Err(Error::HypervisorUnavailable(format!(
                "QEMU_PATH set to {path:?} but file not found"
            )));
        }
    }

    if let Ok(path_env) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_env) {
            let candidate = dir.join("qemu-system-x86_64");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    for candidate in [
        "/usr/local/bin/qemu-system-x86_64",
        "/usr/bin/qemu-system-x86_64",
        "/usr/libexec/qemu-kvm",
    ] {
        let p = PathBuf::from(candidate);
        if p.is_file() {
            return Ok(p);
        }
    }

    Err(Error::HypervisorUnavailable(
        "qemu-system-x86_64 not found in PATH or common locations; install QEMU or set QEMU_PATH"
            .into(),
    ))
}
