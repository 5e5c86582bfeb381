//! End-to-end guest RPC tests: a client drives the guest services over
//! in-memory connections, exercising the same frames the host shim sends
//! over vsock.
//!
//! The scripted runtime stands in for the OCI runtime binary: processes
//! are duplex pipes whose exits fire on demand, which makes the ordering
//! scenarios (exec exit before init exit) deterministic to assert.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::duplex;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use kvmbox::error::Result;
use kvmbox::guest::events::EventExchange;
use kvmbox::guest::runtime::{ContainerRuntime, IoRequest, RuntimeProcess};
use kvmbox::guest::server::{handle_connection, GuestServices};
use kvmbox::guest::stdio::StdioManager;
use kvmbox::guest::task::TaskService;
use kvmbox::host::client::RpcConnection;
use kvmbox::protocol::{
    topics, CreateTaskRequest, Envelope, ExecProcessRequest, ProcessRequest, Request,
    ResponseData, TaskEvent, TaskStatus,
};

// =============================================================================
// Scripted Runtime
// =============================================================================

type ExitHandle = (oneshot::Sender<i32>, tokio::io::DuplexStream);

struct ScriptedRuntime {
    next_pid: AtomicI32,
    processes: Mutex<HashMap<i32, ExitHandle>>,
}

impl ScriptedRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicI32::new(100),
            processes: Mutex::new(HashMap::new()),
        })
    }

    /// Ends a process: closes its stdout (EOF) and resolves its exit.
    async fn finish(&self, pid: i32, status: i32) {
        if let Some((tx, writer)) = self.processes.lock().await.remove(&pid) {
            drop(writer);
            let _ = tx.send(status);
        }
    }

    async fn spawn(&self) -> RuntimeProcess {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (writer, reader) = duplex(4096);
        let (exit_tx, exit_rx) = oneshot::channel();
        self.processes.lock().await.insert(pid, (exit_tx, writer));
        RuntimeProcess {
            pid,
            stdin: None,
            stdout: Some(Box::new(reader)),
            stderr: None,
            exit: exit_rx,
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create(&self, _id: &str, _bundle: &Path, _io: IoRequest) -> Result<RuntimeProcess> {
        Ok(self.spawn().await)
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
        Ok(self.spawn().await)
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

// =============================================================================
// Harness
// =============================================================================

struct Guest {
    services: Arc<GuestServices>,
    runtime: Arc<ScriptedRuntime>,
    _bundles: tempfile::TempDir,
}

impl Guest {
    fn new() -> Self {
        let bundles = tempfile::TempDir::new().unwrap();
        let runtime = ScriptedRuntime::new();
        // The exchange is shared: the task service publishes into it, the
        // StreamEvents RPC reads from it.
        let events = Arc::new(EventExchange::new());
        let task = TaskService::new(
            "default",
            bundles.path(),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::new(StdioManager::new()),
            Arc::clone(&events),
        );
        Self {
            services: Arc::new(GuestServices::new(task, events)),
            runtime,
            _bundles: bundles,
        }
    }

    /// Opens a fresh in-memory "connection" served by the guest.
    fn connect(&self) -> RpcConnection<tokio::io::DuplexStream> {
        let (client, server) = duplex(1024 * 1024);
        let services = Arc::clone(&self.services);
        tokio::spawn(async move {
            let _ = handle_connection(server, &services, CancellationToken::new()).await;
        });
        RpcConnection::new(client)
    }

    async fn unary(&self, request: Request) -> Result<Option<ResponseData>> {
        self.connect().unary(request).await
    }
}

fn create_request(id: &str) -> Request {
    let config = serde_json::json!({
        "ociVersion": "1.0.2",
        "process": { "args": ["/bin/true"], "cwd": "/" },
        "root": { "path": "rootfs" }
    });
    let mut files = HashMap::new();
    files.insert(
        "config.json".to_string(),
        serde_json::to_vec(&config).unwrap(),
    );
    Request::CreateTask(CreateTaskRequest {
        container_id: id.to_string(),
        files,
        stdin: false,
        terminal: false,
    })
}

async fn next_event(
    stream: &mut kvmbox::host::client::FrameStream<tokio::io::DuplexStream>,
) -> Envelope {
    tokio::time::timeout(Duration::from_secs(3), stream.next_event())
        .await
        .expect("event must arrive")
        .unwrap()
        .expect("stream must stay open")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_create_start_wait_over_rpc() {
    let guest = Guest::new();

    let created = guest.unary(create_request("c1")).await.unwrap();
    let Some(ResponseData::Created { pid }) = created else {
        panic!("unexpected create response: {created:?}");
    };

    let started = guest
        .unary(Request::StartTask(ProcessRequest {
            container_id: "c1".into(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();
    let Some(ResponseData::Started { pid: started_pid }) = started else {
        panic!("unexpected start response: {started:?}");
    };
    assert_eq!(pid, started_pid);

    // Open the wait before the exit fires, then end the process.
    let wait_conn = guest.connect();
    let wait = tokio::spawn(async move {
        wait_conn
            .unary(Request::WaitProcess(ProcessRequest {
                container_id: "c1".into(),
                exec_id: String::new(),
            }))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    guest.runtime.finish(pid, 7).await;

    let waited = wait.await.unwrap().unwrap();
    let Some(ResponseData::Waited { exit }) = waited else {
        panic!("unexpected wait response: {waited:?}");
    };
    assert_eq!(exit.status, 7);
    assert_eq!(exit.pid, pid);

    let state = guest
        .unary(Request::TaskState(ProcessRequest {
            container_id: "c1".into(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();
    let Some(ResponseData::State { status, .. }) = state else {
        panic!("unexpected state response: {state:?}");
    };
    assert_eq!(status, TaskStatus::Stopped);
}

#[tokio::test]
async fn test_exec_exit_events_precede_init_exit_event() {
    let guest = Guest::new();

    // Subscribe to the event stream first so nothing is missed.
    let mut events = guest
        .connect()
        .open_stream(Request::StreamEvents)
        .await
        .unwrap();

    let Some(ResponseData::Created { pid: init_pid }) =
        guest.unary(create_request("c1")).await.unwrap()
    else {
        panic!("create failed");
    };
    guest
        .unary(Request::StartTask(ProcessRequest {
            container_id: "c1".into(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();

    guest
        .unary(Request::ExecProcess(ExecProcessRequest {
            container_id: "c1".into(),
            exec_id: "e1".into(),
            process: serde_json::json!({ "args": ["/bin/sleep", "9"] }),
            stdin: false,
            terminal: false,
        }))
        .await
        .unwrap();
    let Some(ResponseData::Started { pid: exec_pid }) = guest
        .unary(Request::StartTask(ProcessRequest {
            container_id: "c1".into(),
            exec_id: "e1".into(),
        }))
        .await
        .unwrap()
    else {
        panic!("exec start failed");
    };

    // Fire the init exit first; publication must still order the exec
    // exit ahead of it.
    guest.runtime.finish(init_pid, 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    guest.runtime.finish(exec_pid, 3).await;

    let mut exit_order = Vec::new();
    while exit_order.len() < 2 {
        let envelope = next_event(&mut events).await;
        if envelope.topic == topics::TASK_EXIT {
            if let TaskEvent::TaskExit {
                exec_id,
                exit_status,
                ..
            } = envelope.event
            {
                exit_order.push((exec_id, exit_status));
            }
        }
    }

    assert_eq!(exit_order[0], ("e1".to_string(), 3));
    assert_eq!(exit_order[1], (String::new(), 0));
}

#[tokio::test]
async fn test_read_stdout_streams_until_eof() {
    let guest = Guest::new();

    let Some(ResponseData::Created { pid }) = guest.unary(create_request("c1")).await.unwrap()
    else {
        panic!("create failed");
    };

    // Write output through the scripted process's pipe, then subscribe.
    {
        use tokio::io::AsyncWriteExt;
        let mut processes = guest.runtime.processes.lock().await;
        let (_, writer) = processes.get_mut(&pid).unwrap();
        writer.write_all(b"container says hi").await.unwrap();
        writer.flush().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = guest
        .connect()
        .open_stream(Request::ReadStdout(ProcessRequest {
            container_id: "c1".into(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();

    let first = stream.next_chunk().await.unwrap().expect("data chunk");
    assert_eq!(first.data, b"container says hi");

    guest.runtime.finish(pid, 0).await;
    // Remaining frames terminate with exactly one EOF.
    let mut saw_eof = false;
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        if chunk.eof {
            saw_eof = true;
            break;
        }
    }
    assert!(saw_eof);
}

#[tokio::test]
async fn test_delete_returns_exit_record() {
    let guest = Guest::new();

    let Some(ResponseData::Created { pid }) = guest.unary(create_request("c1")).await.unwrap()
    else {
        panic!("create failed");
    };
    guest
        .unary(Request::StartTask(ProcessRequest {
            container_id: "c1".into(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();
    guest.runtime.finish(pid, 42).await;

    // Let the exit pipeline record the status.
    let waited = guest
        .unary(Request::WaitProcess(ProcessRequest {
            container_id: "c1".into(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();
    assert!(matches!(waited, Some(ResponseData::Waited { exit }) if exit.status == 42));

    let deleted = guest
        .unary(Request::DeleteProcess(ProcessRequest {
            container_id: "c1".into(),
            exec_id: String::new(),
        }))
        .await
        .unwrap();
    let Some(ResponseData::Deleted { exit }) = deleted else {
        panic!("unexpected delete response: {deleted:?}");
    };
    assert_eq!(exit.status, 42);
}
