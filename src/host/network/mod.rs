//! Host networking: per-container TAP and IP allocation through CNI.
//!
//! Setup runs CNI ADD, extracts the TAP device and IPAM assignment from
//! the result, and opens the TAP file descriptor so the device survives
//! until it is handed to the hypervisor. Concurrent setups for the same
//! container coordinate through an in-flight map: exactly one CNI ADD
//! runs, late callers wait for its result and are counted as conflicts.
//!
//! Release runs CNI DEL, tears down the network namespace, and then
//! verifies in the IPAM state directory that no allocation file still
//! names the container. A lingering reference is an IPAM leak: metered
//! and logged, never fatal; container delete must succeed regardless.

pub mod cni;
pub mod metrics;

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use cni::{CniDriver, NetworkAllocation};
use metrics::NetworkMetrics;

/// A container's network environment: identity in, allocation out.
#[derive(Debug)]
pub struct NetworkEnvironment {
    /// Container id the resources belong to.
    pub id: String,
    /// Allocation, populated by a successful setup.
    pub allocation: Option<NetworkAllocation>,
    /// Open TAP fd, held until handed to the hypervisor.
    pub tap_file: Option<OwnedFd>,
}

impl NetworkEnvironment {
    /// Fresh environment for a container.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            allocation: None,
            tap_file: None,
        }
    }
}

/// Aggregated release failure; each step is reported independently and
/// teardown is best-effort.
#[derive(Debug, Default)]
pub struct CleanupError {
    /// CNI DEL failure.
    pub cni_teardown: Option<String>,
    /// Network namespace removal failure.
    pub netns_delete: Option<String>,
    /// IPAM verification failure (leak detected).
    pub ipam_verify: Option<String>,
}

impl CleanupError {
    /// True when every step succeeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cni_teardown.is_none() && self.netns_delete.is_none() && self.ipam_verify.is_none()
    }
}

impl std::error::Error for CleanupError {}

impl std::fmt::Display for CleanupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(err) = &self.cni_teardown {
            parts.push(format!("CNI teardown: {err}"));
        }
        if let Some(err) = &self.netns_delete {
            parts.push(format!("netns delete: {err}"));
        }
        if let Some(err) = &self.ipam_verify {
            parts.push(format!("IPAM verify: {err}"));
        }
        if parts.is_empty() {
            f.write_str("network cleanup succeeded")
        } else {
            f.write_str(&parts.join("; "))
        }
    }
}

type SetupCell = Arc<OnceCell<std::result::Result<SharedAllocation, String>>>;

/// Allocation shared between coordinated setup callers; each caller opens
/// its own TAP fd against the device the single ADD created.
#[derive(Debug, Clone)]
struct SharedAllocation {
    allocation: NetworkAllocation,
}

/// Per-container network lifecycle through the CNI toolchain.
pub struct NetworkManager {
    driver: CniDriver,
    metrics: Arc<NetworkMetrics>,
    netns_dir: PathBuf,
    /// Coordinates concurrent setups per container id.
    in_flight: Mutex<HashMap<String, SetupCell>>,
}

impl NetworkManager {
    /// Creates a manager over the standard CNI configuration.
    #[must_use]
    pub fn new(config: cni::CniConfig, metrics: Arc<NetworkMetrics>) -> Self {
        Self {
            driver: CniDriver::new(config),
            metrics,
            netns_dir: PathBuf::from("/var/run/netns"),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The metrics instance shared with this manager.
    #[must_use]
    pub fn metrics(&self) -> Arc<NetworkMetrics> {
        Arc::clone(&self.metrics)
    }

    fn netns_path(&self, id: &str) -> PathBuf {
        self.netns_dir.join(id)
    }

    /// Allocates network resources for the environment: one CNI ADD per
    /// container id, coordinated across concurrent callers.
    pub async fn ensure_network_resources(&self, env: &mut NetworkEnvironment) -> Result<()> {
        let started = Instant::now();

        let (cell, conflict) = {
            let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            match in_flight.get(&env.id) {
                Some(cell) => (Arc::clone(cell), true),
                None => {
                    let cell: SetupCell = Arc::new(OnceCell::new());
                    in_flight.insert(env.id.clone(), Arc::clone(&cell));
                    (cell, false)
                }
            }
        };
        if conflict {
            debug!(container = %env.id, "network setup already in flight, waiting");
        }

        let id = env.id.clone();
        let netns = self.netns_path(&id);
        let result = cell
            .get_or_init(|| async {
                match self.run_setup(&id, &netns).await {
                    Ok(allocation) => Ok(SharedAllocation { allocation }),
                    Err(err) => Err(err.to_string()),
                }
            })
            .await
            .clone();

        // The in-flight entry only covers the setup window.
        self.in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(&env.id);

        match result {
            Ok(shared) => {
                let tap_file = open_tap(&shared.allocation.tap_device)?;
                env.allocation = Some(shared.allocation);
                env.tap_file = Some(tap_file);
                self.metrics
                    .record_setup(true, conflict, started.elapsed());
                info!(
                    container = %env.id,
                    tap = %env.allocation.as_ref().map(|a| a.tap_device.as_str()).unwrap_or(""),
                    "network resources allocated"
                );
                Ok(())
            }
            Err(message) => {
                self.metrics
                    .record_setup(false, conflict, started.elapsed());
                Err(Error::Internal(format!(
                    "network setup for '{}' failed: {message}",
                    env.id
                )))
            }
        }
    }

    async fn run_setup(&self, id: &str, netns: &PathBuf) -> Result<NetworkAllocation> {
        let result = self.driver.add(id, &netns.display().to_string()).await?;
        cni::parse_result(&result)
    }

    /// Releases the environment's network resources. Best-effort: every
    /// step runs, failures are aggregated into the returned
    /// [`CleanupError`], and a detected IPAM leak is metered.
    pub async fn release_network_resources(
        &self,
        env: &mut NetworkEnvironment,
    ) -> std::result::Result<(), CleanupError> {
        let started = Instant::now();
        let mut cleanup = CleanupError::default();

        // Drop our TAP handle first so the device can be removed.
        env.tap_file = None;

        let netns = self.netns_path(&env.id);
        if let Err(err) = self.driver.del(&env.id, &netns.display().to_string()).await {
            cleanup.cni_teardown = Some(err.to_string());
        }

        if let Err(err) = remove_netns(&netns) {
            cleanup.netns_delete = Some(err.to_string());
        }

        if let Err(err) = self.verify_ipam_cleanup(&env.id).await {
            self.metrics.record_ipam_leak();
            cleanup.ipam_verify = Some(err.to_string());
        }

        env.allocation = None;
        self.metrics
            .record_teardown(cleanup.is_empty(), started.elapsed());

        if cleanup.is_empty() {
            debug!(container = %env.id, "network resources released");
            Ok(())
        } else {
            warn!(container = %env.id, error = %cleanup, "network release incomplete");
            Err(cleanup)
        }
    }

    /// Scans the IPAM state directory for allocation files still naming
    /// the container. CNI host-local IPAM stores one file per address
    /// whose content is the owning container id.
    async fn verify_ipam_cleanup(&self, id: &str) -> Result<()> {
        let state_dir = self.driver.ipam_state_dir();
        let mut networks = match tokio::fs::read_dir(state_dir).await {
            Ok(dir) => dir,
            // No IPAM state at all: nothing to leak.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        while let Some(network) = networks.next_entry().await? {
            if !network.path().is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(network.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Ok(contents) = tokio::fs::read_to_string(entry.path()).await else {
                    continue;
                };
                if contents.lines().next().map(str::trim) == Some(id) {
                    return Err(Error::Internal(format!(
                        "IP allocation {:?} still references container {id}",
                        entry.path()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Removes a network namespace mount point; missing namespaces are fine.
fn remove_netns(path: &PathBuf) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Opens a TAP device fd via /dev/net/tun + TUNSETIFF, keeping the device
/// alive across the hypervisor hand-off.
#[cfg(target_os = "linux")]
pub fn open_tap(name: &str) -> Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    if name.len() >= libc::IFNAMSIZ {
        return Err(Error::InvalidArgument(format!(
            "TAP device name too long: {name:?}"
        )));
    }

    // No O_CLOEXEC: the fd must be inheritable by the hypervisor child.
    // SAFETY: open(2) with a constant path; the fd is owned immediately.
    let fd = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: fd is a freshly opened, unowned descriptor.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    #[repr(C)]
    struct Ifreq {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
        _pad: [u8; 22],
    }

    let mut req = Ifreq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
        _pad: [0; 22],
    };
    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: TUNSETIFF with a properly initialized ifreq for an owned fd.
    let rc = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&owned),
            libc::TUNSETIFF,
            &mut req,
        )
    };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(owned)
}

/// TAP devices are Linux-only; other hosts report unsupported so
/// cross-platform tooling still builds.
#[cfg(not(target_os = "linux"))]
pub fn open_tap(name: &str) -> Result<OwnedFd> {
    let _ = name;
    Err(Error::Internal(
        "TAP devices are only supported on Linux".into(),
    ))
}
