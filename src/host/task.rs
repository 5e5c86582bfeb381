//! The containerd-facing task service.
//!
//! One shim process serves one container. Every operation validates its
//! precondition against the [`StateMachine`] (compare-and-swap, so racing
//! RPCs get a clean `FailedPrecondition`), and the locking discipline is
//! fixed:
//!
//! - container-mutex (rank 0) before controller-mutex (rank 1), never the
//!   other way around;
//! - neither mutex is held across a guest RPC, a vsock dial, a CNI call,
//!   or an I/O forwarder shutdown; slow work happens on snapshots taken
//!   under the lock (**collect-then-execute**).
//!
//! Exit forwarding implements the host half of the two-tier quiescence
//! contract: on a guest TaskExit, the matching I/O forwarder gets up to
//! [`HOST_IO_WAIT_TIMEOUT`] (30 s) to drain, comfortably above the
//! guest's 10 s subscriber cap, and the event is forwarded regardless
//! when the cap expires.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bundle::Bundle;
use crate::constants::HOST_IO_WAIT_TIMEOUT;
use crate::error::{Error, Result};
use crate::host::connection::ConnectionManager;
use crate::host::events::EventForwarder;
use crate::host::io_forwarder::{FifoSet, IoForwarder, IoMode};
use crate::host::network::{NetworkEnvironment, NetworkManager};
use crate::host::state::{ContainerState, StateMachine};
use crate::host::vm::{DiskConfig, GuestIpConfig, TapNicConfig, VmInstance, VmResourceConfig};
use crate::protocol::{
    CreateTaskRequest, Envelope, ExecProcessRequest, ExitRecord, KillTaskRequest, ProcessKey,
    ResizePtyRequest, TaskEvent,
};
use crate::sync::OrderedMutex;

// =============================================================================
// Request / Response Surface
// =============================================================================

/// Containerd create request (the fields this shim consumes).
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Container id.
    pub id: String,
    /// Bundle directory.
    pub bundle: PathBuf,
    /// Rootfs block devices to attach.
    pub rootfs: Vec<PathBuf>,
    /// Host FIFOs for stdio.
    pub fifos: FifoSet,
    /// Allocate a terminal.
    pub terminal: bool,
    /// VM sizing.
    pub resources: VmResourceConfig,
}

/// Containerd exec request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Container id.
    pub id: String,
    /// Exec id (non-empty).
    pub exec_id: String,
    /// OCI process document.
    pub spec: serde_json::Value,
    /// Host FIFOs for the exec's stdio.
    pub fifos: FifoSet,
    /// Allocate a terminal.
    pub terminal: bool,
}

/// State reported back to containerd.
#[derive(Debug, Clone)]
pub struct StateResponse {
    /// Container id.
    pub id: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Init pid inside the guest.
    pub pid: i32,
    /// Exit status if stopped.
    pub exit_status: Option<i32>,
    /// Exit time if stopped.
    pub exited_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Container Data
// =============================================================================

/// Everything owned per container; guarded by the container-mutex.
#[derive(Default)]
struct ContainerData {
    bundle: Option<Bundle>,
    vm: Option<Arc<VmInstance>>,
    connections: Option<Arc<ConnectionManager>>,
    net_env: Option<NetworkEnvironment>,
    forwarders: HashMap<ProcessKey, Arc<IoForwarder>>,
    init_pid: i32,
    init_exit: Option<ExitRecord>,
}

/// Hotplug controller bookkeeping; guarded by the controller-mutex,
/// acquired only while the container-mutex is already held.
#[derive(Default)]
struct Controllers {
    disk_index: u32,
    nic_index: u32,
}

impl Controllers {
    fn next_disk_id(&mut self) -> String {
        let id = format!("disk{}", self.disk_index);
        self.disk_index += 1;
        id
    }

    fn next_nic_id(&mut self) -> String {
        let id = format!("net{}", self.nic_index);
        self.nic_index += 1;
        id
    }
}

// =============================================================================
// Service
// =============================================================================

/// Allocates guest CIDs. Flexible enough for tests; the binary wires a
/// process-wide counter starting above the reserved CIDs.
pub type CidAllocator = Arc<dyn Fn() -> u32 + Send + Sync>;

/// The shim's task service for its single container.
pub struct ShimTaskService {
    namespace: String,
    container_id: String,
    state: StateMachine,
    container: OrderedMutex<ContainerData>,
    controllers: OrderedMutex<Controllers>,
    network: Arc<NetworkManager>,
    events: Arc<EventForwarder>,
    allocate_cid: CidAllocator,
}

impl ShimTaskService {
    /// Creates the service for one container id.
    pub fn new(
        namespace: impl Into<String>,
        container_id: impl Into<String>,
        network: Arc<NetworkManager>,
        events: Arc<EventForwarder>,
        allocate_cid: CidAllocator,
    ) -> Arc<Self> {
        let container_id = container_id.into();
        Arc::new(Self {
            namespace: namespace.into(),
            state: StateMachine::new(container_id.clone()),
            container_id,
            container: OrderedMutex::new(0, ContainerData::default()),
            controllers: OrderedMutex::new(1, Controllers::default()),
            network,
            events,
            allocate_cid,
        })
    }

    /// Current container state.
    #[must_use]
    pub fn current_state(&self) -> ContainerState {
        self.state.current()
    }

    fn check_id(&self, id: &str) -> Result<()> {
        if id != self.container_id {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Snapshot of the connection manager; never taken while holding a
    /// lock across the subsequent RPC.
    async fn connections(&self) -> Result<Arc<ConnectionManager>> {
        let data = self.container.lock().await;
        data.connections
            .clone()
            .ok_or_else(|| Error::ContainerNotFound(self.container_id.clone()))
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates the container: bundle transform, network allocation, VM
    /// boot, and the guest-side create.
    pub async fn create(self: &Arc<Self>, req: CreateRequest) -> Result<i32> {
        self.check_id(&req.id)?;
        let guard = self.state.begin(ContainerState::None, ContainerState::Creating)?;

        // Everything below runs lock-free: create is exclusive by state.
        let bundle = Bundle::load_for_create(&req.bundle)?;

        let mut net_env = NetworkEnvironment::new(&req.id);
        self.network.ensure_network_resources(&mut net_env).await?;
        let allocation = net_env
            .allocation
            .clone()
            .ok_or_else(|| Error::Internal("network setup produced no allocation".into()))?;

        let cid = (self.allocate_cid)();
        let vm = Arc::new(VmInstance::new(
            &req.id,
            crate::paths::vm_state_dir(&req.id),
            cid,
            req.resources,
        )?);

        vm.begin_start()?;
        {
            // Device registration is the one path that needs both locks;
            // container-mutex strictly first.
            let _container = self.container.lock().await;
            let mut controllers = self.controllers.lock().await;
            for rootfs in &req.rootfs {
                vm.add_disk(DiskConfig {
                    id: controllers.next_disk_id(),
                    path: rootfs.clone(),
                    readonly: false,
                })?;
            }
            if let Some(tap_file) = net_env.tap_file.take() {
                vm.add_tap_nic(TapNicConfig {
                    id: controllers.next_nic_id(),
                    tap_name: allocation.tap_device.clone(),
                    tap_file,
                    mac: allocation.mac.clone(),
                })?;
            }
        }
        vm.set_guest_ip(GuestIpConfig {
            client_ip: allocation.ip.to_string(),
            gateway: allocation
                .gateway
                .map(|g| g.to_string())
                .unwrap_or_default(),
            netmask: crate::host::network::cni::prefix_to_netmask(allocation.prefix_len),
            hostname: req.id.clone(),
            dns0: allocation.nameservers.first().cloned().unwrap_or_default(),
            dns1: allocation.nameservers.get(1).cloned().unwrap_or_default(),
        })?;

        // Boot and wait for the guest; on failure release what we took.
        if let Err(err) = vm.launch().await {
            vm.shutdown().await;
            let _ = self.network.release_network_resources(&mut net_env).await;
            return Err(err);
        }

        let connections = Arc::new(ConnectionManager::new(cid));

        // Hand the transformed bundle to the guest.
        let files = bundle.files()?;
        let guest_create = CreateTaskRequest {
            container_id: req.id.clone(),
            files,
            stdin: req.fifos.stdin.is_some(),
            terminal: req.terminal || bundle.wants_terminal(),
        };
        let client = connections.get_task_client()?;
        let pid = match client.create_task(guest_create).await {
            Ok(pid) => pid,
            Err(err) => {
                drop(client);
                connections.close();
                vm.shutdown().await;
                let _ = self.network.release_network_resources(&mut net_env).await;
                return Err(err);
            }
        };
        drop(client);

        // I/O forwarder for the init process; started on start().
        let mode = if req.terminal || bundle.wants_terminal() {
            IoMode::Tty
        } else {
            IoMode::Pipes
        };
        let forwarder = self.make_forwarder(cid, ProcessKey::init(&req.id), mode, req.fifos);

        {
            let mut data = self.container.lock().await;
            data.bundle = Some(bundle);
            data.vm = Some(Arc::clone(&vm));
            data.connections = Some(Arc::clone(&connections));
            data.net_env = Some(net_env);
            data.forwarders
                .insert(ProcessKey::init(&req.id), forwarder);
            data.init_pid = pid;
        }

        self.spawn_event_pump(Arc::clone(&connections));
        self.spawn_vm_monitor(Arc::clone(&vm));

        guard.commit(ContainerState::Created)?;
        info!(container = %req.id, pid, cid, "container created");
        Ok(pid)
    }

    #[cfg(target_os = "linux")]
    fn make_forwarder(
        &self,
        cid: u32,
        key: ProcessKey,
        mode: IoMode,
        fifos: FifoSet,
    ) -> Arc<IoForwarder> {
        use crate::host::client::GuestClient;
        use crate::host::io_forwarder::VsockGuestStdio;
        Arc::new(IoForwarder::new(
            mode,
            fifos,
            Arc::new(VsockGuestStdio {
                client: GuestClient::new(cid),
                key,
            }),
        ))
    }

    /// Non-Linux hosts never reach the guest; forwarders are inert stubs
    /// so tooling builds stay green.
    #[cfg(not(target_os = "linux"))]
    fn make_forwarder(
        &self,
        _cid: u32,
        _key: ProcessKey,
        mode: IoMode,
        fifos: FifoSet,
    ) -> Arc<IoForwarder> {
        use crate::host::io_forwarder::{ChunkStream, GuestStdio};

        struct Unsupported;
        #[async_trait::async_trait]
        impl GuestStdio for Unsupported {
            async fn open_stdout(&self) -> Result<Box<dyn ChunkStream>> {
                Err(Error::RpcUnavailable("vsock unsupported on this host".into()))
            }
            async fn open_stderr(&self) -> Result<Box<dyn ChunkStream>> {
                Err(Error::RpcUnavailable("vsock unsupported on this host".into()))
            }
            async fn write_stdin(&self, _data: Vec<u8>) -> Result<u32> {
                Err(Error::RpcUnavailable("vsock unsupported on this host".into()))
            }
            async fn close_stdin(&self) -> Result<()> {
                Err(Error::RpcUnavailable("vsock unsupported on this host".into()))
            }
        }
        Arc::new(IoForwarder::new(mode, fifos, Arc::new(Unsupported)))
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Starts the init process or an exec.
    pub async fn start(&self, id: &str, exec_id: &str) -> Result<i32> {
        self.check_id(id)?;

        if exec_id.is_empty() {
            let guard = self
                .state
                .begin(ContainerState::Created, ContainerState::Starting)?;
            let pid = self.start_process(id, exec_id).await?;
            guard.commit(ContainerState::Running)?;
            info!(container = %id, pid, "container started");
            Ok(pid)
        } else {
            if self.state.current() != ContainerState::Running {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: self.state.current().to_string(),
                    expected: ContainerState::Running.to_string(),
                });
            }
            let pid = self.start_process(id, exec_id).await?;
            info!(container = %id, exec = %exec_id, pid, "exec started");
            Ok(pid)
        }
    }

    async fn start_process(&self, id: &str, exec_id: &str) -> Result<i32> {
        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        let pid = client.start_task(id, exec_id).await?;
        drop(client);

        // The guest has confirmed the process; safe to attach streams.
        let forwarder = {
            let data = self.container.lock().await;
            data.forwarders
                .get(&ProcessKey {
                    container_id: id.to_string(),
                    exec_id: exec_id.to_string(),
                })
                .cloned()
        };
        if let Some(forwarder) = forwarder {
            forwarder.start();
        }
        Ok(pid)
    }

    // =========================================================================
    // Exec
    // =========================================================================

    /// Registers an exec process with the guest; the spawn happens on
    /// start.
    pub async fn exec(&self, req: ExecRequest) -> Result<()> {
        self.check_id(&req.id)?;
        if self.state.current() != ContainerState::Running {
            return Err(Error::InvalidState {
                id: req.id.clone(),
                state: self.state.current().to_string(),
                expected: ContainerState::Running.to_string(),
            });
        }

        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        client
            .exec_process(ExecProcessRequest {
                container_id: req.id.clone(),
                exec_id: req.exec_id.clone(),
                process: req.spec,
                stdin: req.fifos.stdin.is_some(),
                terminal: req.terminal,
            })
            .await?;
        drop(client);

        let mode = if req.terminal {
            IoMode::Tty
        } else {
            IoMode::Pipes
        };
        let key = ProcessKey::exec(&req.id, &req.exec_id);
        let forwarder = self.make_forwarder(connections.cid(), key.clone(), mode, req.fifos);

        let mut data = self.container.lock().await;
        data.forwarders.insert(key, forwarder);
        Ok(())
    }

    // =========================================================================
    // Kill / Pty / CloseIO / Wait / State
    // =========================================================================

    /// Delivers a signal.
    pub async fn kill(&self, req: KillTaskRequest) -> Result<()> {
        self.check_id(&req.container_id)?;
        match self.state.current() {
            ContainerState::Running | ContainerState::Paused | ContainerState::Stopping => {}
            state => {
                return Err(Error::InvalidState {
                    id: req.container_id,
                    state: state.to_string(),
                    expected: "running or paused".into(),
                })
            }
        }

        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        client.kill_task(req).await
    }

    /// Resizes a process terminal.
    pub async fn resize_pty(&self, req: ResizePtyRequest) -> Result<()> {
        self.check_id(&req.container_id)?;
        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        client.resize_pty(req).await
    }

    /// Closes a process stdin.
    pub async fn close_io(&self, id: &str, exec_id: &str) -> Result<()> {
        self.check_id(id)?;
        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        client.close_io(id, exec_id).await
    }

    /// Waits for a process exit.
    pub async fn wait(&self, id: &str, exec_id: &str) -> Result<ExitRecord> {
        self.check_id(id)?;

        // Answer from local state when the exit already landed.
        if exec_id.is_empty() {
            let data = self.container.lock().await;
            if let Some(exit) = data.init_exit {
                return Ok(exit);
            }
        }

        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        client.wait_process(id, exec_id).await
    }

    /// Reports container (or exec) state.
    pub async fn task_state(&self, id: &str, exec_id: &str) -> Result<StateResponse> {
        self.check_id(id)?;

        if exec_id.is_empty() {
            let data = self.container.lock().await;
            return Ok(StateResponse {
                id: id.to_string(),
                state: self.state.current(),
                pid: data.init_pid,
                exit_status: data.init_exit.map(|e| e.status),
                exited_at: data.init_exit.map(|e| e.exited_at),
            });
        }

        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        let (status, pid, exit) = client.task_state(id, exec_id).await?;
        let state = match status {
            crate::protocol::TaskStatus::Created => ContainerState::Created,
            crate::protocol::TaskStatus::Running => ContainerState::Running,
            crate::protocol::TaskStatus::Stopped => ContainerState::Stopped,
            crate::protocol::TaskStatus::Unknown => ContainerState::None,
        };
        Ok(StateResponse {
            id: id.to_string(),
            state,
            pid,
            exit_status: exit.map(|e| e.status),
            exited_at: exit.map(|e| e.exited_at),
        })
    }

    /// Containerd Connect: shim pid and task pid.
    pub async fn connect(&self, id: &str) -> Result<(u32, i32)> {
        self.check_id(id)?;
        let data = self.container.lock().await;
        Ok((std::process::id(), data.init_pid))
    }

    /// Containerd Stats: VM-backed containers expose no cgroup metrics on
    /// the host; an empty sample keeps metric collectors happy.
    pub async fn stats(&self, id: &str) -> Result<serde_json::Value> {
        self.check_id(id)?;
        Ok(serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    /// Containerd Update: VM sizing is fixed at creation; accepted as a
    /// no-op so orchestrators that always call update keep working.
    pub async fn update(&self, id: &str) -> Result<()> {
        self.check_id(id)?;
        match self.state.current() {
            ContainerState::Running | ContainerState::Paused | ContainerState::Created => {
                debug!(container = %id, "update accepted; VM resources are fixed at creation");
                Ok(())
            }
            state => Err(Error::InvalidState {
                id: id.to_string(),
                state: state.to_string(),
                expected: "created, running or paused".into(),
            }),
        }
    }

    // =========================================================================
    // Pause / Resume
    // =========================================================================

    /// Pauses the VM's vCPUs.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.check_id(id)?;
        let guard = self
            .state
            .begin(ContainerState::Running, ContainerState::Pausing)?;

        let vm = {
            let data = self.container.lock().await;
            data.vm.clone()
        };
        let vm = vm.ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        vm.pause().await?;

        guard.commit(ContainerState::Paused)?;
        info!(container = %id, "container paused");
        Ok(())
    }

    /// Resumes the VM's vCPUs.
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.check_id(id)?;
        let guard = self
            .state
            .begin(ContainerState::Paused, ContainerState::Resuming)?;

        let vm = {
            let data = self.container.lock().await;
            data.vm.clone()
        };
        let vm = vm.ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        vm.resume().await?;

        guard.commit(ContainerState::Running)?;
        info!(container = %id, "container resumed");
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes an exec process or tears the container down.
    pub async fn delete(&self, id: &str, exec_id: &str) -> Result<ExitRecord> {
        self.check_id(id)?;

        if !exec_id.is_empty() {
            return self.delete_exec(id, exec_id).await;
        }

        // A created-but-never-started container is stopped in place first.
        if self.state.current() == ContainerState::Created {
            self.state
                .transition(ContainerState::Created, ContainerState::Stopping)?;
            self.state
                .transition(ContainerState::Stopping, ContainerState::Stopped)?;
        }

        let from = self.state.current();
        self.state.transition(from, ContainerState::Deleted)?;

        // Collect-then-execute: snapshot everything under the lock, then
        // run the slow teardown with no lock held.
        let (vm, connections, net_env, forwarders, exit) = {
            let mut data = self.container.lock().await;
            (
                data.vm.take(),
                data.connections.take(),
                data.net_env.take(),
                std::mem::take(&mut data.forwarders),
                data.init_exit,
            )
        };

        for (key, forwarder) in &forwarders {
            debug!(process = %key, "shutting down forwarder");
            forwarder.shutdown();
        }
        if let Some(connections) = connections {
            connections.close();
        }
        if let Some(vm) = vm {
            vm.shutdown().await;
        }
        if let Some(mut net_env) = net_env {
            if let Err(err) = self.network.release_network_resources(&mut net_env).await {
                // Best-effort by contract: delete proceeds.
                warn!(container = %id, error = %err, "network cleanup incomplete");
            }
        }

        let exit = exit.unwrap_or(ExitRecord {
            pid: 0,
            status: crate::constants::FAILED_TO_LAUNCH_STATUS,
            exited_at: Utc::now(),
        });
        info!(container = %id, status = exit.status, "container deleted");
        Ok(exit)
    }

    async fn delete_exec(&self, id: &str, exec_id: &str) -> Result<ExitRecord> {
        let connections = self.connections().await?;
        let client = connections.get_task_client()?;
        let exit = client.delete_process(id, exec_id).await?;
        drop(client);

        let forwarder = {
            let mut data = self.container.lock().await;
            data.forwarders.remove(&ProcessKey::exec(id, exec_id))
        };
        if let Some(forwarder) = forwarder {
            forwarder.shutdown();
        }
        Ok(exit)
    }

    /// Shuts the shim's container resources down without a delete RPC;
    /// used on shim exit.
    pub async fn shutdown(&self) {
        let (vm, connections, forwarders) = {
            let mut data = self.container.lock().await;
            (
                data.vm.take(),
                data.connections.take(),
                std::mem::take(&mut data.forwarders),
            )
        };
        for forwarder in forwarders.values() {
            forwarder.shutdown();
        }
        if let Some(connections) = connections {
            connections.close();
        }
        if let Some(vm) = vm {
            vm.shutdown().await;
        }
        self.events.shutdown().await;
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Watches the VM child; an unexpected death fails the container so
    /// pending RPCs surface `Unavailable` and delete remains possible.
    fn spawn_vm_monitor(self: &Arc<Self>, vm: Arc<VmInstance>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            vm.died_token().cancelled().await;
            warn!(container = %service.container_id, "hypervisor died; failing container");
            service.state.fail();
        });
    }

    /// Pumps the guest event stream into containerd, inserting the
    /// host-side I/O wait before TaskExit events.
    fn spawn_event_pump(self: &Arc<Self>, connections: Arc<ConnectionManager>) {
        #[cfg(target_os = "linux")]
        {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let mut stream = match connections.get_event_stream().await {
                        Ok(stream) => stream,
                        Err(err) => {
                            debug!(error = %err, "event stream unavailable; pump exiting");
                            return;
                        }
                    };
                    loop {
                        match stream.next_event().await {
                            Ok(Some(envelope)) => service.forward_event(envelope).await,
                            Ok(None) => break,
                            Err(err) => {
                                debug!(error = %err, "event stream error; re-dialing");
                                break;
                            }
                        }
                    }
                    if service.state.current() == ContainerState::Deleted {
                        return;
                    }
                }
            });
        }
        #[cfg(not(target_os = "linux"))]
        let _ = connections;
    }

    /// Forwards one guest event, enforcing the host-side exit barrier.
    async fn forward_event(&self, envelope: Envelope) {
        if let TaskEvent::TaskExit {
            container_id,
            exec_id,
            ..
        } = &envelope.event
        {
            let key = ProcessKey {
                container_id: container_id.clone(),
                exec_id: exec_id.clone(),
            };

            // Collect the forwarder under the lock, wait outside it.
            let forwarder = {
                let data = self.container.lock().await;
                data.forwarders.get(&key).cloned()
            };
            if let Some(forwarder) = forwarder {
                if !forwarder
                    .wait_for_complete_timeout(HOST_IO_WAIT_TIMEOUT)
                    .await
                {
                    warn!(
                        process = %key,
                        "I/O forwarder did not complete before exit deadline; forwarding exit anyway"
                    );
                }
            }

            if exec_id.is_empty() {
                self.record_init_exit(&envelope).await;
            }
        }

        self.events.send(envelope).await;
    }

    /// Stores the init exit and walks the state machine to Stopped.
    async fn record_init_exit(&self, envelope: &Envelope) {
        if let TaskEvent::TaskExit {
            pid,
            exit_status,
            exited_at,
            ..
        } = envelope.event
        {
            {
                let mut data = self.container.lock().await;
                data.init_exit = Some(ExitRecord {
                    pid,
                    status: exit_status,
                    exited_at,
                });
            }
            let from = self.state.current();
            if matches!(
                from,
                ContainerState::Running | ContainerState::Paused | ContainerState::Created
            ) {
                let _ = self.state.transition(from, ContainerState::Stopping);
                let _ = self
                    .state
                    .transition(ContainerState::Stopping, ContainerState::Stopped);
            }
        }
    }
}
