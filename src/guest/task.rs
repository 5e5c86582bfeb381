//! Guest task service: container lifecycle against the OCI runtime.
//!
//! Create/start/exec/kill/delete/wait/state over the vsock protocol. The
//! service wires every new process into the stdio manager, opens an exit
//! subscription around every start (so exits racing the start bookkeeping
//! are never lost), and runs the exit pipeline that keeps containerd's
//! view consistent:
//!
//! ```text
//! runtime wait ─► ExitTracker::notify_exit
//!                  ├─ exec exit:  barrier → unregister → publish → count--
//!                  └─ init exit:  wait for exec count → barrier →
//!                                 unregister → publish
//! ```
//!
//! The barrier ([`StdioManager::wait_for_io_complete`]) is what delays the
//! exit event until attached output streams have drained; the exec count
//! is what orders every exec exit before the init exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::events::EventExchange;
use super::exit_tracker::{ContainerProcess, ExitTracker, ProcessKind};
use super::runtime::{ContainerRuntime, IoRequest, RuntimeProcess};
use super::stdio::StdioManager;
use crate::bundle::{relax_for_guest, OciSpec};
use crate::constants::FAILED_TO_LAUNCH_STATUS;
use crate::error::{Error, Result};
use crate::protocol::{
    CreateTaskRequest, ExecProcessRequest, ExitRecord, KillTaskRequest, ProcessKey,
    ResizePtyRequest, TaskEvent, TaskStatus,
};

// =============================================================================
// Per-Process Bookkeeping
// =============================================================================

#[derive(Debug)]
struct ProcessState {
    pid: i32,
    status: TaskStatus,
    terminal: bool,
    exit: Option<ExitRecord>,
    exit_waiters: Vec<oneshot::Sender<ExitRecord>>,
    /// Exec document, held between the exec RPC and its start.
    pending_spec: Option<serde_json::Value>,
    pending_io: IoRequest,
}

impl ProcessState {
    fn created(pid: i32, terminal: bool) -> Self {
        Self {
            pid,
            status: TaskStatus::Created,
            terminal,
            exit: None,
            exit_waiters: Vec::new(),
            pending_spec: None,
            pending_io: IoRequest::default(),
        }
    }

    fn pending_exec(spec: serde_json::Value, io: IoRequest) -> Self {
        Self {
            pid: 0,
            status: TaskStatus::Created,
            terminal: io.terminal,
            exit: None,
            exit_waiters: Vec::new(),
            pending_spec: Some(spec),
            pending_io: io,
        }
    }
}

#[derive(Debug)]
struct Container {
    bundle: PathBuf,
    init: ProcessState,
    execs: HashMap<String, ProcessState>,
}

/// A process state snapshot, as reported by the state RPC.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Pid (0 before start).
    pub pid: i32,
    /// Exit record if stopped.
    pub exit: Option<ExitRecord>,
}

// =============================================================================
// Task Service
// =============================================================================

/// Container lifecycle service inside the guest.
pub struct TaskService {
    namespace: String,
    bundles_root: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    stdio: Arc<StdioManager>,
    events: Arc<EventExchange>,
    tracker: Arc<ExitTracker>,
    containers: Mutex<HashMap<String, Container>>,
}

impl TaskService {
    /// Creates the service.
    pub fn new(
        namespace: impl Into<String>,
        bundles_root: impl Into<PathBuf>,
        runtime: Arc<dyn ContainerRuntime>,
        stdio: Arc<StdioManager>,
        events: Arc<EventExchange>,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            bundles_root: bundles_root.into(),
            runtime,
            stdio,
            events,
            tracker: Arc::new(ExitTracker::new()),
            containers: Mutex::new(HashMap::new()),
        })
    }

    /// The stdio manager backing this service.
    #[must_use]
    pub fn stdio(&self) -> Arc<StdioManager> {
        Arc::clone(&self.stdio)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Materializes a transferred bundle and creates the init process.
    pub async fn create(self: &Arc<Self>, req: CreateTaskRequest) -> Result<i32> {
        let id = req.container_id.clone();
        if id.is_empty() {
            return Err(Error::InvalidArgument("container id cannot be empty".into()));
        }
        if self
            .containers
            .lock()
            .expect("containers poisoned")
            .contains_key(&id)
        {
            return Err(Error::ContainerAlreadyExists(id));
        }

        let bundle_dir = self.materialize_bundle(&id, &req).await?;

        let terminal = req.terminal;
        let io = IoRequest {
            stdin: req.stdin,
            terminal,
        };
        let process = self.runtime.create(&id, &bundle_dir, io).await?;
        let pid = process.pid;

        self.adopt_process(ProcessKey::init(&id), process)?;

        {
            let mut containers = self.containers.lock().expect("containers poisoned");
            containers.insert(
                id.clone(),
                Container {
                    bundle: bundle_dir,
                    init: ProcessState::created(pid, terminal),
                    execs: HashMap::new(),
                },
            );
        }

        info!(container = %id, pid, "container created");
        self.events.publish(
            &self.namespace,
            TaskEvent::TaskCreate {
                container_id: id,
                pid,
            },
        );
        Ok(pid)
    }

    /// Writes the bundle file map to disk and applies the guest-side spec
    /// relaxation.
    async fn materialize_bundle(&self, id: &str, req: &CreateTaskRequest) -> Result<PathBuf> {
        let dir = self.bundles_root.join(id);
        tokio::fs::create_dir_all(dir.join("rootfs")).await?;

        let config = req
            .files
            .get("config.json")
            .ok_or_else(|| Error::InvalidBundle {
                path: dir.clone(),
                reason: "bundle is missing config.json".into(),
            })?;
        let mut spec: OciSpec = serde_json::from_slice(config).map_err(|e| Error::InvalidBundle {
            path: dir.clone(),
            reason: format!("failed to parse spec: {e}"),
        })?;
        relax_for_guest(&mut spec);
        tokio::fs::write(dir.join("config.json"), serde_json::to_vec(&spec)?).await?;

        for (name, data) in &req.files {
            if name == "config.json" {
                continue;
            }
            tokio::fs::write(dir.join(name), data).await?;
        }

        Ok(dir)
    }

    /// Registers a runtime process with the stdio manager and spawns its
    /// exit waiter.
    fn adopt_process(self: &Arc<Self>, key: ProcessKey, process: RuntimeProcess) -> Result<()> {
        let RuntimeProcess {
            pid,
            stdin,
            stdout,
            stderr,
            exit,
        } = process;

        self.stdio.register(key.clone(), stdin, stdout, stderr)?;

        let service = Arc::clone(self);
        tokio::spawn(async move {
            // A dropped sender means the exit was observed by the PID-1
            // reaper instead; that path calls notify_exit directly.
            let Ok(status) = exit.await else { return };
            let record = ExitRecord {
                pid,
                status,
                exited_at: Utc::now(),
            };
            service.handle_process_exit(record).await;
        });
        Ok(())
    }

    /// Entry point for exits observed outside the per-process waiters
    /// (the PID-1 zombie reaper).
    pub async fn notify_exit(self: &Arc<Self>, record: ExitRecord) {
        self.handle_process_exit(record).await;
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Starts the init process or a previously registered exec.
    pub async fn start(self: &Arc<Self>, container_id: &str, exec_id: &str) -> Result<i32> {
        if exec_id.is_empty() {
            self.start_init(container_id).await
        } else {
            self.start_exec(container_id, exec_id).await
        }
    }

    async fn start_init(self: &Arc<Self>, container_id: &str) -> Result<i32> {
        let pid = {
            let containers = self.containers.lock().expect("containers poisoned");
            let container = containers
                .get(container_id)
                .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
            if container.init.status != TaskStatus::Created {
                return Err(Error::InvalidState {
                    id: container_id.to_string(),
                    state: format!("{:?}", container.init.status),
                    expected: "Created".into(),
                });
            }
            container.init.pid
        };

        // Subscribe before the start so an exit racing the bookkeeping is
        // captured as an early exit. Passing the pid drops any stale
        // running entry from a prior incarnation of this container.
        let sub = self.tracker.subscribe(Some((container_id, pid)));

        if let Err(err) = self.runtime.start(container_id).await {
            self.tracker.cancel(sub);
            return Err(err);
        }

        let early = self
            .tracker
            .handle_start(sub, container_id, ProcessKind::Init, pid);

        self.set_status(container_id, "", TaskStatus::Running);
        self.events.publish(
            &self.namespace,
            TaskEvent::TaskStart {
                container_id: container_id.to_string(),
                pid,
            },
        );

        // The process exited before start bookkeeping completed: its exit
        // never resolved through the running map, so publish it from here.
        for record in early {
            let cp = ContainerProcess {
                container_id: container_id.to_string(),
                process: ProcessKind::Init,
            };
            let service = Arc::clone(self);
            tokio::spawn(async move { service.publish_exit(cp, record).await });
        }

        Ok(pid)
    }

    async fn start_exec(self: &Arc<Self>, container_id: &str, exec_id: &str) -> Result<i32> {
        let (spec, io) = {
            let mut containers = self.containers.lock().expect("containers poisoned");
            let container = containers
                .get_mut(container_id)
                .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
            let exec = container.execs.get_mut(exec_id).ok_or_else(|| {
                Error::ProcessNotFound {
                    container_id: container_id.to_string(),
                    exec_id: exec_id.to_string(),
                }
            })?;
            let spec = exec.pending_spec.take().ok_or_else(|| Error::InvalidState {
                id: format!("{container_id}/{exec_id}"),
                state: format!("{:?}", exec.status),
                expected: "Created".into(),
            })?;
            (spec, exec.pending_io)
        };

        let sub = self.tracker.subscribe(None);

        let process = match self.runtime.exec(container_id, exec_id, &spec, io).await {
            Ok(process) => process,
            Err(err) => {
                self.tracker.cancel(sub);
                return Err(err);
            }
        };
        let pid = process.pid;

        let key = ProcessKey::exec(container_id, exec_id);
        if let Err(err) = self.adopt_process(key, process) {
            self.tracker.cancel(sub);
            return Err(err);
        }

        let kind = ProcessKind::Exec {
            exec_id: exec_id.to_string(),
        };
        let early = self.tracker.handle_start(sub, container_id, kind, pid);

        {
            let mut containers = self.containers.lock().expect("containers poisoned");
            if let Some(container) = containers.get_mut(container_id) {
                if let Some(exec) = container.execs.get_mut(exec_id) {
                    exec.pid = pid;
                    exec.status = TaskStatus::Running;
                }
            }
        }

        self.events.publish(
            &self.namespace,
            TaskEvent::TaskExecStarted {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
                pid,
            },
        );

        for record in early {
            let cp = ContainerProcess {
                container_id: container_id.to_string(),
                process: ProcessKind::Exec {
                    exec_id: exec_id.to_string(),
                },
            };
            let service = Arc::clone(self);
            tokio::spawn(async move { service.publish_exit(cp, record).await });
        }

        Ok(pid)
    }

    // =========================================================================
    // Exec Registration
    // =========================================================================

    /// Registers an exec process; the actual spawn happens on start.
    pub async fn exec(&self, req: ExecProcessRequest) -> Result<()> {
        if req.exec_id.is_empty() {
            return Err(Error::InvalidArgument("exec id cannot be empty".into()));
        }

        let mut containers = self.containers.lock().expect("containers poisoned");
        let container = containers
            .get_mut(&req.container_id)
            .ok_or_else(|| Error::ContainerNotFound(req.container_id.clone()))?;
        if container.execs.contains_key(&req.exec_id) {
            return Err(Error::ProcessAlreadyRegistered {
                container_id: req.container_id.clone(),
                exec_id: req.exec_id.clone(),
            });
        }

        let io = IoRequest {
            stdin: req.stdin,
            terminal: req.terminal,
        };
        container
            .execs
            .insert(req.exec_id.clone(), ProcessState::pending_exec(req.process, io));
        drop(containers);

        self.events.publish(
            &self.namespace,
            TaskEvent::TaskExecAdded {
                container_id: req.container_id,
                exec_id: req.exec_id,
            },
        );
        Ok(())
    }

    // =========================================================================
    // Kill
    // =========================================================================

    /// Delivers a signal to the init process, every container process, or
    /// one exec.
    pub async fn kill(&self, req: &KillTaskRequest) -> Result<()> {
        if req.exec_id.is_empty() {
            return self
                .runtime
                .kill(&req.container_id, req.signal, req.all)
                .await;
        }

        let pid = {
            let containers = self.containers.lock().expect("containers poisoned");
            let container = containers
                .get(&req.container_id)
                .ok_or_else(|| Error::ContainerNotFound(req.container_id.clone()))?;
            let exec = container
                .execs
                .get(&req.exec_id)
                .ok_or_else(|| Error::ProcessNotFound {
                    container_id: req.container_id.clone(),
                    exec_id: req.exec_id.clone(),
                })?;
            if exec.status != TaskStatus::Running {
                return Err(Error::InvalidState {
                    id: format!("{}/{}", req.container_id, req.exec_id),
                    state: format!("{:?}", exec.status),
                    expected: "Running".into(),
                });
            }
            exec.pid
        };

        // SAFETY: kill(2) with a concrete pid and signal has no memory
        // safety requirements.
        let rc = unsafe { libc::kill(pid, req.signal as i32) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes an exec process or the whole container, returning the exit
    /// record (255/now for a process that never ran).
    pub async fn delete(&self, container_id: &str, exec_id: &str) -> Result<ExitRecord> {
        if !exec_id.is_empty() {
            let record = {
                let mut containers = self.containers.lock().expect("containers poisoned");
                let container = containers
                    .get_mut(container_id)
                    .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
                let exec =
                    container
                        .execs
                        .remove(exec_id)
                        .ok_or_else(|| Error::ProcessNotFound {
                            container_id: container_id.to_string(),
                            exec_id: exec_id.to_string(),
                        })?;
                exec.exit.unwrap_or(ExitRecord {
                    pid: exec.pid,
                    status: FAILED_TO_LAUNCH_STATUS,
                    exited_at: Utc::now(),
                })
            };
            self.stdio
                .unregister(&ProcessKey::exec(container_id, exec_id))
                .await;
            return Ok(record);
        }

        let (record, pid) = {
            let mut containers = self.containers.lock().expect("containers poisoned");
            let container = containers
                .get(container_id)
                .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
            if container.init.status == TaskStatus::Running {
                return Err(Error::InvalidState {
                    id: container_id.to_string(),
                    state: "Running".into(),
                    expected: "Created or Stopped".into(),
                });
            }
            let record = container.init.exit.unwrap_or(ExitRecord {
                pid: container.init.pid,
                status: FAILED_TO_LAUNCH_STATUS,
                exited_at: Utc::now(),
            });
            let pid = container.init.pid;
            containers.remove(container_id);
            (record, pid)
        };

        if let Err(err) = self.runtime.delete(container_id, true).await {
            warn!(container = %container_id, error = %err, "runtime delete failed");
        }
        self.stdio.unregister(&ProcessKey::init(container_id)).await;
        self.tracker.cleanup(container_id);

        self.events.publish(
            &self.namespace,
            TaskEvent::TaskDelete {
                container_id: container_id.to_string(),
                pid,
                exit_status: record.status,
                exited_at: record.exited_at,
            },
        );
        info!(container = %container_id, "container deleted");
        Ok(record)
    }

    // =========================================================================
    // Wait / State / Pty / CloseIO
    // =========================================================================

    /// Waits for a process to exit and returns its record.
    pub async fn wait(&self, container_id: &str, exec_id: &str) -> Result<ExitRecord> {
        let rx = {
            let mut containers = self.containers.lock().expect("containers poisoned");
            let container = containers
                .get_mut(container_id)
                .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
            let process = if exec_id.is_empty() {
                &mut container.init
            } else {
                container
                    .execs
                    .get_mut(exec_id)
                    .ok_or_else(|| Error::ProcessNotFound {
                        container_id: container_id.to_string(),
                        exec_id: exec_id.to_string(),
                    })?
            };

            if let Some(record) = process.exit {
                return Ok(record);
            }
            let (tx, rx) = oneshot::channel();
            process.exit_waiters.push(tx);
            rx
        };

        rx.await.map_err(|_| {
            Error::Internal("wait channel dropped before exit was recorded".into())
        })
    }

    /// Snapshot of a process for the state RPC.
    pub fn state(&self, container_id: &str, exec_id: &str) -> Result<ProcessSnapshot> {
        let containers = self.containers.lock().expect("containers poisoned");
        let container = containers
            .get(container_id)
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
        let process = if exec_id.is_empty() {
            &container.init
        } else {
            container
                .execs
                .get(exec_id)
                .ok_or_else(|| Error::ProcessNotFound {
                    container_id: container_id.to_string(),
                    exec_id: exec_id.to_string(),
                })?
        };
        Ok(ProcessSnapshot {
            status: process.status,
            pid: process.pid,
            exit: process.exit,
        })
    }

    /// Resizes a process terminal.
    pub async fn resize_pty(&self, req: &ResizePtyRequest) -> Result<()> {
        let terminal = {
            let containers = self.containers.lock().expect("containers poisoned");
            let container = containers
                .get(&req.container_id)
                .ok_or_else(|| Error::ContainerNotFound(req.container_id.clone()))?;
            if req.exec_id.is_empty() {
                container.init.terminal
            } else {
                container
                    .execs
                    .get(&req.exec_id)
                    .ok_or_else(|| Error::ProcessNotFound {
                        container_id: req.container_id.clone(),
                        exec_id: req.exec_id.clone(),
                    })?
                    .terminal
            }
        };
        if !terminal {
            return Err(Error::InvalidState {
                id: format!("{}/{}", req.container_id, req.exec_id),
                state: "pipes".into(),
                expected: "terminal".into(),
            });
        }
        self.runtime
            .resize_pty(&req.container_id, &req.exec_id, req.width, req.height)
            .await
    }

    /// Closes a process stdin (containerd CloseIO).
    pub async fn close_io(&self, container_id: &str, exec_id: &str) -> Result<()> {
        self.stdio
            .close_stdin(&ProcessKey {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            })
            .await
    }

    // =========================================================================
    // Exit Pipeline
    // =========================================================================

    /// Entry point for observed exits; resolves them through the tracker
    /// and fans out one publication pipeline per resolved process.
    async fn handle_process_exit(self: &Arc<Self>, record: ExitRecord) {
        debug!(pid = record.pid, status = record.status, "process exit observed");
        let resolved = self.tracker.notify_exit(record);
        for cp in resolved {
            let service = Arc::clone(self);
            let record = record;
            tokio::spawn(async move { service.publish_exit(cp, record).await });
        }
    }

    /// Publishes one process exit, honoring the init-after-execs ordering
    /// and the I/O quiescence barrier.
    async fn publish_exit(self: &Arc<Self>, cp: ContainerProcess, record: ExitRecord) {
        let container_id = cp.container_id.clone();
        let (key, exec_id) = match &cp.process {
            ProcessKind::Init => (ProcessKey::init(&container_id), String::new()),
            ProcessKind::Exec { exec_id } => {
                (ProcessKey::exec(&container_id, exec_id), exec_id.clone())
            }
        };

        let record = if cp.process.is_init() {
            // Hold the init exit until every exec exit has been published.
            if let Some(waiter) = self.tracker.should_delay_init_exit(&container_id) {
                debug!(container = %container_id, "delaying init exit until execs drain");
                let _ = waiter.await;
            }
            self.tracker
                .take_init_exit(&container_id)
                .unwrap_or(record)
        } else {
            record
        };

        // Quiescence barrier: all output delivered (bounded by the
        // subscriber timeout), then tear down the process I/O.
        self.stdio.wait_for_io_complete(&key).await;
        self.stdio.unregister(&key).await;

        self.record_exit(&container_id, &exec_id, record);

        self.events.publish(
            &self.namespace,
            TaskEvent::TaskExit {
                container_id: container_id.clone(),
                exec_id: exec_id.clone(),
                pid: record.pid,
                exit_status: record.status,
                exited_at: record.exited_at,
            },
        );

        // Release the init-exit gate only after this exec's exit event is
        // out; that is what makes the ordering strict.
        if !cp.process.is_init() {
            self.tracker.notify_exec_exit(&container_id);
        }
    }

    /// Records the exit in the process table and wakes wait RPCs.
    fn record_exit(&self, container_id: &str, exec_id: &str, record: ExitRecord) {
        let mut containers = self.containers.lock().expect("containers poisoned");
        let Some(container) = containers.get_mut(container_id) else {
            return;
        };
        let process = if exec_id.is_empty() {
            Some(&mut container.init)
        } else {
            container.execs.get_mut(exec_id)
        };
        let Some(process) = process else {
            error!(
                container = %container_id,
                exec = %exec_id,
                "exit for unknown process"
            );
            return;
        };

        process.status = TaskStatus::Stopped;
        process.exit = Some(record);
        for waiter in process.exit_waiters.drain(..) {
            let _ = waiter.send(record);
        }
    }

    fn set_status(&self, container_id: &str, exec_id: &str, status: TaskStatus) {
        let mut containers = self.containers.lock().expect("containers poisoned");
        let Some(container) = containers.get_mut(container_id) else {
            return;
        };
        if exec_id.is_empty() {
            container.init.status = status;
        } else if let Some(exec) = container.execs.get_mut(exec_id) {
            exec.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::topics;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::Mutex as AsyncMutex;

    /// Scripted runtime: processes are duplex pipes whose exits fire when
    /// the test says so. Finishing a pid closes its stdout (EOF for the
    /// fan-out) and resolves the exit oneshot, like a real process death.
    struct FakeRuntime {
        next_pid: AtomicI32,
        exits: AsyncMutex<HashMap<i32, (oneshot::Sender<i32>, tokio::io::DuplexStream)>>,
    }

    impl FakeRuntime {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_pid: AtomicI32::new(100),
                exits: AsyncMutex::new(HashMap::new()),
            })
        }

        async fn finish(&self, pid: i32, status: i32) {
            if let Some((tx, writer)) = self.exits.lock().await.remove(&pid) {
                drop(writer);
                let _ = tx.send(status);
            }
        }

        async fn make_process(&self) -> RuntimeProcess {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            let (w, r) = duplex(64);
            let (exit_tx, exit_rx) = oneshot::channel();
            self.exits.lock().await.insert(pid, (exit_tx, w));
            RuntimeProcess {
                pid,
                stdin: None,
                stdout: Some(Box::new(r)),
                stderr: None,
                exit: exit_rx,
            }
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create(&self, _id: &str, _bundle: &std::path::Path, _io: IoRequest) -> Result<RuntimeProcess> {
            Ok(self.make_process().await)
        }

        async fn start(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn exec(
            &self,
            _id: &str,
            _exec_id: &str,
            _process: &serde_json::Value,
            _io: IoRequest,
        ) -> Result<RuntimeProcess> {
            Ok(self.make_process().await)
        }

        async fn kill(&self, _id: &str, _signal: u32, _all: bool) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _id: &str, _force: bool) -> Result<()> {
            Ok(())
        }

        async fn resize_pty(&self, _id: &str, _exec_id: &str, _w: u32, _h: u32) -> Result<()> {
            Ok(())
        }
    }

    fn create_request(id: &str) -> CreateTaskRequest {
        let config = serde_json::json!({
            "ociVersion": "1.0.2",
            "process": { "args": ["/bin/true"], "cwd": "/" },
            "root": { "path": "rootfs" }
        });
        let mut files = HashMap::new();
        files.insert("config.json".to_string(), serde_json::to_vec(&config).unwrap());
        CreateTaskRequest {
            container_id: id.to_string(),
            files,
            stdin: false,
            terminal: false,
        }
    }

    async fn service_with_runtime(
        tmp: &tempfile::TempDir,
    ) -> (Arc<TaskService>, Arc<FakeRuntime>, tokio::sync::mpsc::Receiver<crate::protocol::Envelope>) {
        let runtime = FakeRuntime::new();
        let events = Arc::new(EventExchange::new());
        let rx = events.subscribe();
        let service = TaskService::new(
            "default",
            tmp.path(),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::new(StdioManager::new()),
            events,
        );
        (service, runtime, rx)
    }

    #[tokio::test]
    async fn create_start_exit_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, runtime, mut events) = service_with_runtime(&tmp).await;

        let pid = service.create(create_request("c1")).await.unwrap();
        let started = service.start("c1", "").await.unwrap();
        assert_eq!(pid, started);

        runtime.finish(pid, 0).await;

        // create, start, exit in order.
        let mut topics_seen = Vec::new();
        for _ in 0..3 {
            let env = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            topics_seen.push(env.topic);
        }
        assert_eq!(
            topics_seen,
            vec![topics::TASK_CREATE, topics::TASK_START, topics::TASK_EXIT]
        );

        let record = service.wait("c1", "").await.unwrap();
        assert_eq!(record.status, 0);
        assert_eq!(record.pid, pid);

        let snapshot = service.state("c1", "").unwrap();
        assert_eq!(snapshot.status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn exec_exits_publish_before_init_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, runtime, mut events) = service_with_runtime(&tmp).await;

        let init_pid = service.create(create_request("c1")).await.unwrap();
        service.start("c1", "").await.unwrap();

        service
            .exec(ExecProcessRequest {
                container_id: "c1".into(),
                exec_id: "e1".into(),
                process: serde_json::json!({ "args": ["/bin/sleep", "1"] }),
                stdin: false,
                terminal: false,
            })
            .await
            .unwrap();
        let exec_pid = service.start("c1", "e1").await.unwrap();
        assert_ne!(init_pid, exec_pid);

        // Fire the init exit first; the pipeline must still order the exec
        // exit event before the init exit event.
        runtime.finish(init_pid, 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        runtime.finish(exec_pid, 3).await;

        let mut exit_order = Vec::new();
        while exit_order.len() < 2 {
            let env = tokio::time::timeout(Duration::from_secs(3), events.recv())
                .await
                .expect("exit events must arrive")
                .unwrap();
            if env.topic == topics::TASK_EXIT {
                if let TaskEvent::TaskExit { exec_id, .. } = env.event {
                    exit_order.push(exec_id);
                }
            }
        }
        assert_eq!(exit_order, vec!["e1".to_string(), String::new()]);
    }

    #[tokio::test]
    async fn delete_returns_exit_record_and_unregisters() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, runtime, _events) = service_with_runtime(&tmp).await;

        let pid = service.create(create_request("c1")).await.unwrap();
        service.start("c1", "").await.unwrap();
        runtime.finish(pid, 42).await;

        // Wait for the pipeline to record the exit.
        let record = service.wait("c1", "").await.unwrap();
        assert_eq!(record.status, 42);

        let deleted = service.delete("c1", "").await.unwrap();
        assert_eq!(deleted.status, 42);
        assert!(service.state("c1", "").is_err());
    }

    #[tokio::test]
    async fn delete_running_container_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _runtime, _events) = service_with_runtime(&tmp).await;

        service.create(create_request("c1")).await.unwrap();
        service.start("c1", "").await.unwrap();

        let err = service.delete("c1", "").await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _runtime, _events) = service_with_runtime(&tmp).await;

        service.create(create_request("c1")).await.unwrap();
        let err = service.create(create_request("c1")).await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn state_unknown_container_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _runtime, _events) = service_with_runtime(&tmp).await;
        let err = service.state("missing", "").unwrap_err();
        assert_eq!(err.code(), crate::error::Code::NotFound);
    }
}
