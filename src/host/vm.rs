//! Per-container VM lifecycle.
//!
//! One [`VmInstance`] owns one QEMU child process. The state machine is a
//! single monotonic atomic (`New -> Starting -> Running -> Shutdown`), so
//! state checks never take a lock; the pending command line is guarded by
//! a mutex that only matters between `begin_start` and `launch`.
//!
//! # Shutdown ladder
//!
//! Shutdown escalates through bounded steps, graceful first:
//!
//! 1. `system_powerdown` over the QMP socket (≤ 2 s)
//! 2. wait for ACPI-initiated guest exit (500 ms)
//! 3. `quit` over QMP (≤ 1 s), wait for the process (≤ 2 s)
//! 4. SIGKILL, wait for the process (≤ 2 s)
//!
//! The whole ladder is bounded at ~10 s. After the process is gone the
//! control connection, console FIFO, and background monitors are closed.
//! Shutdown is idempotent; a second call returns immediately.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    GUEST_READY_TIMEOUT, SHUTDOWN_ACPI_WAIT, SHUTDOWN_KILL_WAIT, SHUTDOWN_POWERDOWN_TIMEOUT,
    SHUTDOWN_QUIT_TIMEOUT, SHUTDOWN_QUIT_WAIT,
};
use crate::error::{Error, Result};
use crate::paths;

// =============================================================================
// VM State
// =============================================================================

/// Monotonic VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmState {
    /// Created, nothing launched.
    New = 0,
    /// Command line being assembled, launch in progress.
    Starting = 1,
    /// Guest reachable.
    Running = 2,
    /// Shut down (terminal).
    Shutdown = 3,
}

impl VmState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Shutdown,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Shutdown => "shutdown",
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Virtio-blk device.
#[derive(Debug)]
pub struct DiskConfig {
    /// Device id.
    pub id: String,
    /// Backing file or block device on the host.
    pub path: PathBuf,
    /// Attach read-only.
    pub readonly: bool,
}

/// Virtio-net device backed by a TAP fd.
///
/// The fd is opened by the network manager in the sandbox netns and handed
/// to QEMU; keeping it here keeps the device alive across the hand-off.
#[derive(Debug)]
pub struct TapNicConfig {
    /// Device id.
    pub id: String,
    /// TAP device name (stays in the sandbox netns).
    pub tap_name: String,
    /// Open TAP fd passed to QEMU.
    pub tap_file: OwnedFd,
    /// Guest MAC address.
    pub mac: String,
}

/// CPU and memory sizing.
#[derive(Debug, Clone, Copy)]
pub struct VmResourceConfig {
    /// Virtual CPUs.
    pub vcpus: u32,
    /// Memory in MiB.
    pub memory_mib: u32,
}

impl Default for VmResourceConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mib: 512,
        }
    }
}

/// Kernel `ip=` parameter pieces derived from the CNI allocation; the
/// guest parses DNS servers back out of this.
#[derive(Debug, Clone, Default)]
pub struct GuestIpConfig {
    /// Guest address.
    pub client_ip: String,
    /// Gateway.
    pub gateway: String,
    /// Netmask.
    pub netmask: String,
    /// Guest hostname.
    pub hostname: String,
    /// Primary DNS server.
    pub dns0: String,
    /// Secondary DNS server.
    pub dns1: String,
}

impl GuestIpConfig {
    /// Renders the kernel `ip=` parameter:
    /// `ip=<client>:<server>:<gw>:<netmask>:<hostname>:<dev>:<autoconf>:<dns0>:<dns1>`.
    #[must_use]
    pub fn kernel_param(&self) -> String {
        format!(
            "ip={}::{}:{}:{}:eth0:off:{}:{}",
            self.client_ip, self.gateway, self.netmask, self.hostname, self.dns0, self.dns1
        )
    }
}

/// Pending launch configuration, mutated only between `begin_start` and
/// `launch`.
#[derive(Default)]
struct PendingLaunch {
    disks: Vec<DiskConfig>,
    nics: Vec<TapNicConfig>,
    ip: Option<GuestIpConfig>,
}

// =============================================================================
// Instance
// =============================================================================

/// One QEMU-backed VM for one container.
pub struct VmInstance {
    container_id: String,
    state_dir: PathBuf,
    binary: PathBuf,
    kernel: PathBuf,
    initrd: PathBuf,
    resources: VmResourceConfig,
    cid: u32,

    state: Arc<AtomicU8>,
    pending: Mutex<PendingLaunch>,

    child_pid: AtomicI32,
    /// Flips to true when the child has been reaped.
    child_exited: watch::Sender<bool>,
    qmp: tokio::sync::Mutex<Option<QmpClient>>,
    console: Mutex<Option<std::fs::File>>,
    /// Cancels the child monitor on shutdown.
    monitor_cancel: CancellationToken,
    /// Fired by the monitor when QEMU dies outside of shutdown.
    died: CancellationToken,
}

impl VmInstance {
    /// Prepares a VM: allocates the state directory and locates the
    /// hypervisor, kernel, and initrd. Nothing is launched.
    pub fn new(
        container_id: impl Into<String>,
        state_dir: impl Into<PathBuf>,
        cid: u32,
        resources: VmResourceConfig,
    ) -> Result<Self> {
        let container_id = container_id.into();
        let state_dir = state_dir.into();
        let binary = paths::find_qemu()?;
        let kernel = paths::find_kernel()?;
        let initrd = paths::find_initrd()?;

        std::fs::create_dir_all(&state_dir)?;

        let (child_exited, _) = watch::channel(false);
        Ok(Self {
            container_id,
            state_dir,
            binary,
            kernel,
            initrd,
            resources,
            cid,
            state: Arc::new(AtomicU8::new(VmState::New as u8)),
            pending: Mutex::new(PendingLaunch::default()),
            child_pid: AtomicI32::new(0),
            child_exited,
            qmp: tokio::sync::Mutex::new(None),
            console: Mutex::new(None),
            monitor_cancel: CancellationToken::new(),
            died: CancellationToken::new(),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Guest CID for vsock dialing.
    #[must_use]
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Fired if QEMU dies unexpectedly; the task service watches this to
    /// fail the container.
    #[must_use]
    pub fn died_token(&self) -> CancellationToken {
        self.died.clone()
    }

    fn transition(&self, from: VmState, to: VmState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|observed| Error::InvalidVmTransition {
                from: VmState::from_u8(observed).name().into(),
                to: to.name().into(),
            })?;
        Ok(())
    }

    /// Enters `Starting`; device registration is only legal after this.
    pub fn begin_start(&self) -> Result<()> {
        self.transition(VmState::New, VmState::Starting)
    }

    fn ensure_starting(&self) -> Result<()> {
        let state = self.state();
        if state != VmState::Starting {
            return Err(Error::InvalidVmTransition {
                from: state.name().into(),
                to: "device attach".into(),
            });
        }
        Ok(())
    }

    /// Registers a virtio-blk device; only legal in `Starting`.
    pub fn add_disk(&self, disk: DiskConfig) -> Result<()> {
        self.ensure_starting()?;
        self.pending
            .lock()
            .expect("pending launch poisoned")
            .disks
            .push(disk);
        Ok(())
    }

    /// Registers a virtio-net device backed by a TAP fd; only legal in
    /// `Starting`.
    pub fn add_tap_nic(&self, nic: TapNicConfig) -> Result<()> {
        self.ensure_starting()?;
        self.pending
            .lock()
            .expect("pending launch poisoned")
            .nics
            .push(nic);
        Ok(())
    }

    /// Sets the guest network parameters embedded in the kernel cmdline;
    /// only legal in `Starting`.
    pub fn set_guest_ip(&self, ip: GuestIpConfig) -> Result<()> {
        self.ensure_starting()?;
        self.pending
            .lock()
            .expect("pending launch poisoned")
            .ip = Some(ip);
        Ok(())
    }

    fn qmp_socket_path(&self) -> PathBuf {
        self.state_dir.join("qmp.sock")
    }

    fn console_path(&self) -> PathBuf {
        self.state_dir.join("console.log")
    }

    /// Builds the full QEMU argument vector from the pending config.
    fn build_args(&self) -> Vec<String> {
        let pending = self.pending.lock().expect("pending launch poisoned");

        let mut kernel_cmdline =
            String::from("console=hvc0 reboot=k panic=1 quiet init=/usr/bin/vminit");
        if let Some(ip) = &pending.ip {
            kernel_cmdline.push(' ');
            kernel_cmdline.push_str(&ip.kernel_param());
        }

        let mut args: Vec<String> = vec![
            "-machine".into(),
            "microvm,acpi=on".into(),
            "-enable-kvm".into(),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            self.resources.vcpus.to_string(),
            "-m".into(),
            format!("{}M", self.resources.memory_mib),
            "-no-user-config".into(),
            "-nodefaults".into(),
            "-display".into(),
            "none".into(),
            "-kernel".into(),
            self.kernel.display().to_string(),
            "-initrd".into(),
            self.initrd.display().to_string(),
            "-append".into(),
            kernel_cmdline,
            "-chardev".into(),
            format!("file,id=console,path={}", self.console_path().display()),
            "-device".into(),
            "virtio-serial-device".into(),
            "-device".into(),
            "virtconsole,chardev=console".into(),
            "-qmp".into(),
            format!("unix:{},server,nowait", self.qmp_socket_path().display()),
            "-device".into(),
            format!("vhost-vsock-device,guest-cid={}", self.cid),
        ];

        for disk in &pending.disks {
            args.push("-drive".into());
            args.push(format!(
                "id={},file={},format=raw,if=none,readonly={}",
                disk.id,
                disk.path.display(),
                if disk.readonly { "on" } else { "off" }
            ));
            args.push("-device".into());
            args.push(format!("virtio-blk-device,drive={}", disk.id));
        }

        for nic in &pending.nics {
            use std::os::fd::AsRawFd;
            args.push("-netdev".into());
            args.push(format!("tap,id={},fd={}", nic.id, nic.tap_file.as_raw_fd()));
            args.push("-device".into());
            args.push(format!(
                "virtio-net-device,netdev={},mac={}",
                nic.id, nic.mac
            ));
        }

        args
    }

    /// Launches QEMU, opens the QMP socket, and waits for the guest to
    /// become reachable over vsock; transitions to `Running` on success.
    pub async fn launch(&self) -> Result<()> {
        self.ensure_starting()?;

        let args = self.build_args();
        debug!(container = %self.container_id, ?args, "launching hypervisor");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::HypervisorUnavailable(format!("failed to launch qemu: {e}")))?;

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        self.child_pid.store(pid, Ordering::SeqCst);

        // Keep a handle on the console log so cleanup tooling cannot pull
        // the file out from under the chardev; closed on shutdown.
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.console_path())
        {
            Ok(console) => {
                *self.console.lock().expect("console handle poisoned") = Some(console);
            }
            Err(err) => {
                debug!(container = %self.container_id, error = %err, "console log unavailable");
            }
        }

        // TAP fds have been handed to the child; drop our copies.
        self.pending
            .lock()
            .expect("pending launch poisoned")
            .nics
            .clear();

        // Surface hypervisor stderr into the shim log.
        if let Some(stderr) = child.stderr.take() {
            let container_id = self.container_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(container = %container_id, line = %line, "qemu stderr");
                }
            });
        }

        // Child monitor: reap the process, flag unexpected death.
        let exited_tx = self.child_exited.clone();
        let died = self.died.clone();
        let state = Arc::clone(&self.state);
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let rendered = match &status {
                Ok(s) => s.to_string(),
                Err(e) => e.to_string(),
            };
            let current = VmState::from_u8(state.load(Ordering::SeqCst));
            if current != VmState::Shutdown {
                warn!(container = %container_id, status = %rendered, "hypervisor exited unexpectedly");
                died.cancel();
            }
            let _ = exited_tx.send(true);
        });

        // Open the control socket; QEMU creates it at startup.
        let qmp = QmpClient::connect(&self.qmp_socket_path()).await?;
        *self.qmp.lock().await = Some(qmp);

        // Wait for the guest RPC port to come up.
        self.wait_guest_ready().await?;

        self.transition(VmState::Starting, VmState::Running)?;
        info!(container = %self.container_id, cid = self.cid, "VM running");
        Ok(())
    }

    /// Dials the guest RPC port with retries until `GUEST_READY_TIMEOUT`.
    async fn wait_guest_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + GUEST_READY_TIMEOUT;
        let mut delay = crate::constants::OUTPUT_RETRY_INITIAL_DELAY;
        loop {
            match super::client::dial(self.cid, crate::constants::GUEST_VSOCK_PORT).await {
                Ok(_probe) => return Ok(()),
                Err(err) if tokio::time::Instant::now() + delay < deadline => {
                    debug!(container = %self.container_id, error = %err, "guest not ready, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(crate::constants::OUTPUT_RETRY_MAX_DELAY);
                }
                Err(err) => {
                    return Err(Error::Timeout {
                        operation: format!("guest ready (last error: {err})"),
                        duration: GUEST_READY_TIMEOUT,
                    });
                }
            }
        }
    }

    /// Waits for the child to exit within the timeout.
    async fn wait_child_exit(&self, timeout: std::time::Duration) -> bool {
        if self.child_pid.load(Ordering::SeqCst) == 0 {
            return true;
        }
        let mut rx = self.child_exited.subscribe();
        tokio::time::timeout(timeout, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Runs the graceful-then-forced shutdown ladder. Idempotent.
    pub async fn shutdown(&self) {
        let prior = VmState::from_u8(
            self.state
                .swap(VmState::Shutdown as u8, Ordering::SeqCst),
        );
        if prior == VmState::Shutdown {
            return;
        }
        info!(container = %self.container_id, from = prior.name(), "shutting down VM");

        if prior == VmState::Running || prior == VmState::Starting {
            self.stop_hypervisor().await;
        }

        self.close_connections().await;
        self.monitor_cancel.cancel();
        debug!(container = %self.container_id, "VM shutdown complete");
    }

    /// Cancels background monitors without waiting for them.
    pub fn cancel_monitors(&self) {
        self.monitor_cancel.cancel();
    }

    /// Pauses the guest vCPUs (QMP `stop`). Only legal while running.
    pub async fn pause(&self) -> Result<()> {
        self.require_running("pause")?;
        self.qmp_command("stop").await
    }

    /// Resumes the guest vCPUs (QMP `cont`). Only legal while running.
    pub async fn resume(&self) -> Result<()> {
        self.require_running("resume")?;
        self.qmp_command("cont").await
    }

    fn require_running(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state != VmState::Running {
            return Err(Error::InvalidVmTransition {
                from: state.name().into(),
                to: operation.into(),
            });
        }
        Ok(())
    }

    async fn qmp_command(&self, command: &str) -> Result<()> {
        let mut qmp = self.qmp.lock().await;
        let client = qmp
            .as_mut()
            .ok_or_else(|| Error::HypervisorUnavailable("QMP connection closed".into()))?;
        client.execute(command).await
    }

    async fn stop_hypervisor(&self) {
        let mut qmp = self.qmp.lock().await;

        // Step 1: graceful ACPI powerdown.
        if let Some(client) = qmp.as_mut() {
            match tokio::time::timeout(
                SHUTDOWN_POWERDOWN_TIMEOUT,
                client.execute("system_powerdown"),
            )
            .await
            {
                Ok(Ok(())) => debug!(container = %self.container_id, "powerdown requested"),
                Ok(Err(err)) => warn!(container = %self.container_id, error = %err, "powerdown failed"),
                Err(_) => warn!(container = %self.container_id, "powerdown timed out"),
            }
        }

        // Step 2: give ACPI a moment to work.
        if self.wait_child_exit(SHUTDOWN_ACPI_WAIT).await {
            return;
        }

        // Step 3: ask the hypervisor itself to quit.
        if let Some(client) = qmp.as_mut() {
            match tokio::time::timeout(SHUTDOWN_QUIT_TIMEOUT, client.execute("quit")).await {
                Ok(Ok(())) => debug!(container = %self.container_id, "quit requested"),
                Ok(Err(err)) => warn!(container = %self.container_id, error = %err, "quit failed"),
                Err(_) => warn!(container = %self.container_id, "quit timed out"),
            }
        }
        if self.wait_child_exit(SHUTDOWN_QUIT_WAIT).await {
            return;
        }

        // Step 4: force kill.
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid > 0 {
            warn!(container = %self.container_id, pid, "killing hypervisor");
            // SAFETY: kill(2) with a concrete pid has no memory safety
            // requirements.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        if !self.wait_child_exit(SHUTDOWN_KILL_WAIT).await {
            warn!(container = %self.container_id, pid, "hypervisor did not exit after SIGKILL");
        }
    }

    /// Closes the control connection and console handle.
    async fn close_connections(&self) {
        if let Some(client) = self.qmp.lock().await.take() {
            drop(client);
        }
        if let Some(console) = self
            .console
            .lock()
            .expect("console handle poisoned")
            .take()
        {
            drop(console);
        }
    }
}

// =============================================================================
// QMP Control Socket
// =============================================================================

/// Minimal QMP client: capabilities handshake plus the two commands the
/// shutdown ladder needs.
pub struct QmpClient {
    reader: BufReader<tokio::io::ReadHalf<tokio::net::UnixStream>>,
    writer: tokio::io::WriteHalf<tokio::net::UnixStream>,
}

impl QmpClient {
    /// Connects and completes the capabilities handshake. QEMU creates
    /// the socket shortly after launch; connect races that with a short
    /// poll.
    pub async fn connect(path: &PathBuf) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        let stream = loop {
            match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => {
                    return Err(Error::HypervisorUnavailable(format!(
                        "QMP connect failed: {e}"
                    )))
                }
            }
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // Greeting, then capabilities negotiation.
        client.read_line().await?;
        client.execute("qmp_capabilities").await?;
        Ok(client)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::HypervisorUnavailable("QMP connection closed".into()));
        }
        Ok(line)
    }

    /// Executes a QMP command and waits for its `return` (skipping
    /// asynchronous event lines).
    pub async fn execute(&mut self, command: &str) -> Result<()> {
        let request = serde_json::json!({ "execute": command });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            let line = self.read_line().await?;
            let value: serde_json::Value = serde_json::from_str(line.trim())?;
            if value.get("return").is_some() {
                return Ok(());
            }
            if let Some(err) = value.get("error") {
                return Err(Error::HypervisorUnavailable(format!(
                    "QMP {command} failed: {err}"
                )));
            }
            // Event line; keep reading.
        }
    }
}
