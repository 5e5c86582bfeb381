//! Wire protocol between the host shim and the guest init.
//!
//! # Protocol Format
//!
//! - **Transport**: vsock (AF_VSOCK), guest listens on
//!   [`crate::constants::GUEST_VSOCK_PORT`].
//! - **Encoding**: JSON with internally-tagged enums.
//! - **Framing**: newline-delimited; each frame is one JSON object ending
//!   with `\n`.
//!
//! Each connection carries exactly one request. Unary requests are answered
//! with a single [`Response`] frame. Streaming requests (`read_stdout`,
//! `read_stderr`, `stream_events`) are answered with a sequence of frames;
//! output streams terminate with a frame whose chunk has `eof = true`,
//! event streams run until either side closes.
//!
//! ```text
//! Host                                  Guest (vminit)
//!   |  {"action":"write_stdin",...}\n      |
//!   |------------------------------------->|
//!   |  {"status":"ok",...}\n               |
//!   |<-------------------------------------|
//!
//!   |  {"action":"read_stdout",...}\n      |
//!   |------------------------------------->|
//!   |  {"status":"ok","data":{...}}\n      |  (chunk)
//!   |  {"status":"ok","data":{...}}\n      |  (chunk, eof=true)
//!   |<-------------------------------------|
//! ```
//!
//! Four services share the frame format: task control, stdio streaming,
//! the event stream, and system info.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Code, Error};

// =============================================================================
// Process Identity
// =============================================================================

/// Identifies one process within one container for its whole lifetime.
///
/// `exec_id` is empty for the container's init process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    /// Container identifier.
    pub container_id: String,
    /// Exec identifier; empty for init.
    #[serde(default)]
    pub exec_id: String,
}

impl ProcessKey {
    /// Key for a container's init process.
    #[must_use]
    pub fn init(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            exec_id: String::new(),
        }
    }

    /// Key for an exec process.
    #[must_use]
    pub fn exec(container_id: impl Into<String>, exec_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        }
    }

    /// True if this key names an init process.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.exec_id.is_empty()
    }
}

impl std::fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.exec_id.is_empty() {
            write!(f, "{}", self.container_id)
        } else {
            write!(f, "{}/{}", self.container_id, self.exec_id)
        }
    }
}

// =============================================================================
// Output Chunks and Exit Records
// =============================================================================

/// A chunk of process output.
///
/// Either `data` is non-empty and `eof` is false, or `data` is empty and
/// `eof` is true. An EOF chunk is the last frame a stream ever carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Raw output bytes.
    #[serde(default)]
    pub data: Vec<u8>,
    /// End-of-stream marker.
    #[serde(default)]
    pub eof: bool,
}

impl OutputChunk {
    /// A data chunk.
    #[must_use]
    pub fn data(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes,
            eof: false,
        }
    }

    /// The terminal EOF chunk.
    #[must_use]
    pub fn eof() -> Self {
        Self {
            data: Vec::new(),
            eof: true,
        }
    }

    /// Byte length of the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A recorded process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    /// Process id inside the guest.
    pub pid: i32,
    /// Exit status (or 128+signal for signal deaths).
    pub status: i32,
    /// When the exit was observed.
    pub exited_at: DateTime<Utc>,
}

// =============================================================================
// Task State
// =============================================================================

/// Observable status of a guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started.
    Created,
    /// Running.
    Running,
    /// Exited; exit record available.
    Stopped,
    /// Unknown to the guest.
    Unknown,
}

// =============================================================================
// Requests
// =============================================================================

/// Request from the host shim to the guest init.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    // ------------------------------------------------------------------ task
    /// Create a container from a transferred bundle.
    CreateTask(CreateTaskRequest),
    /// Start a created process (init or exec).
    StartTask(ProcessRequest),
    /// Register an exec process.
    ExecProcess(ExecProcessRequest),
    /// Deliver a signal.
    KillTask(KillTaskRequest),
    /// Delete a process, returning its exit record.
    DeleteProcess(ProcessRequest),
    /// Block until the process exits.
    WaitProcess(ProcessRequest),
    /// Query process state.
    TaskState(ProcessRequest),
    /// Resize the process pty.
    ResizePty(ResizePtyRequest),
    /// Close the process stdin (containerd CloseIO).
    CloseIo(ProcessRequest),

    // ----------------------------------------------------------------- stdio
    /// Write bytes to stdin.
    WriteStdin(WriteStdinRequest),
    /// Close stdin.
    CloseStdin(ProcessRequest),
    /// Stream stdout chunks until EOF.
    ReadStdout(ProcessRequest),
    /// Stream stderr chunks until EOF.
    ReadStderr(ProcessRequest),

    // ---------------------------------------------------------------- events
    /// Stream event envelopes as they are published.
    StreamEvents,

    // ---------------------------------------------------------------- system
    /// Guest version and kernel info.
    SystemInfo,
}

/// Addresses one process; shared by several unary operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Container identifier.
    pub container_id: String,
    /// Exec identifier; empty for init.
    #[serde(default)]
    pub exec_id: String,
}

impl ProcessRequest {
    /// The process key this request addresses.
    #[must_use]
    pub fn key(&self) -> ProcessKey {
        ProcessKey {
            container_id: self.container_id.clone(),
            exec_id: self.exec_id.clone(),
        }
    }
}

/// Create a container inside the guest.
///
/// The bundle travels as a file map: `config.json` (already transformed on
/// the host) plus any extra files inlined from bundle-local bind mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    /// Container identifier.
    pub container_id: String,
    /// Bundle files by name; must include `config.json`.
    pub files: HashMap<String, Vec<u8>>,
    /// Attach a stdin pipe.
    #[serde(default)]
    pub stdin: bool,
    /// Allocate a pty instead of pipes.
    #[serde(default)]
    pub terminal: bool,
}

/// Register an exec process for a running container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    /// Container identifier.
    pub container_id: String,
    /// Exec identifier (non-empty).
    pub exec_id: String,
    /// OCI process document (args, env, cwd, terminal).
    pub process: serde_json::Value,
    /// Attach a stdin pipe.
    #[serde(default)]
    pub stdin: bool,
    /// Allocate a pty instead of pipes.
    #[serde(default)]
    pub terminal: bool,
}

/// Deliver a signal to a process or a whole container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillTaskRequest {
    /// Container identifier.
    pub container_id: String,
    /// Exec identifier; empty for init.
    #[serde(default)]
    pub exec_id: String,
    /// Signal number.
    pub signal: u32,
    /// Signal every process in the container.
    #[serde(default)]
    pub all: bool,
}

/// Resize a pty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePtyRequest {
    /// Container identifier.
    pub container_id: String,
    /// Exec identifier; empty for init.
    #[serde(default)]
    pub exec_id: String,
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
}

/// Write bytes to a process stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteStdinRequest {
    /// Container identifier.
    pub container_id: String,
    /// Exec identifier; empty for init.
    #[serde(default)]
    pub exec_id: String,
    /// Bytes to write.
    pub data: Vec<u8>,
}

// =============================================================================
// Responses
// =============================================================================

/// Response frame from the guest init.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success, optionally carrying data.
    Ok {
        /// Payload, absent for plain acknowledgements.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    /// Failure with a status code.
    Error {
        /// Status code.
        code: Code,
        /// Human-readable message.
        message: String,
    },
}

impl Response {
    /// A success response with no data.
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok { data: None }
    }

    /// A success response carrying data.
    #[must_use]
    pub fn ok_with(data: ResponseData) -> Self {
        Self::Ok { data: Some(data) }
    }

    /// An error response.
    #[must_use]
    pub fn error(code: Code, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Converts an error response into [`Error::Remote`]; passes Ok through.
    pub fn into_result(self) -> Result<Option<ResponseData>, Error> {
        match self {
            Response::Ok { data } => Ok(data),
            Response::Error { code, message } => Err(Error::remote(code, message)),
        }
    }
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

/// Typed payloads carried by [`Response::Ok`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Container created.
    Created {
        /// Init pid inside the guest.
        pid: i32,
    },
    /// Process started.
    Started {
        /// Pid inside the guest.
        pid: i32,
    },
    /// Process deleted.
    Deleted {
        /// Final exit record.
        exit: ExitRecord,
    },
    /// Process exited.
    Waited {
        /// Final exit record.
        exit: ExitRecord,
    },
    /// Process state snapshot.
    State {
        /// Lifecycle status.
        status: TaskStatus,
        /// Pid inside the guest (0 if never started).
        pid: i32,
        /// Exit record if stopped.
        #[serde(skip_serializing_if = "Option::is_none")]
        exit: Option<ExitRecord>,
    },
    /// Stdin write accepted.
    BytesWritten {
        /// Number of bytes written.
        count: u32,
    },
    /// One output stream frame.
    Chunk(OutputChunk),
    /// One event stream frame.
    Event(Envelope),
    /// Guest system info.
    Info {
        /// Guest init version.
        version: String,
        /// Kernel version string from /proc/version.
        kernel_version: String,
    },
}

// =============================================================================
// Events
// =============================================================================

/// Event topics mirroring the containerd task lifecycle.
pub mod topics {
    /// Container created.
    pub const TASK_CREATE: &str = "/tasks/create";
    /// Init process started.
    pub const TASK_START: &str = "/tasks/start";
    /// Exec process registered.
    pub const TASK_EXEC_ADDED: &str = "/tasks/exec-added";
    /// Exec process started.
    pub const TASK_EXEC_STARTED: &str = "/tasks/exec-started";
    /// Process exited.
    pub const TASK_EXIT: &str = "/tasks/exit";
    /// Container deleted.
    pub const TASK_DELETE: &str = "/tasks/delete";
}

/// A namespace-tagged event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Containerd namespace the event belongs to.
    pub namespace: String,
    /// Topic, one of [`topics`].
    pub topic: String,
    /// Event payload.
    pub event: TaskEvent,
}

/// Task lifecycle events published by the guest and forwarded to containerd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Container created.
    TaskCreate {
        /// Container identifier.
        container_id: String,
        /// Init pid.
        pid: i32,
    },
    /// Init process started.
    TaskStart {
        /// Container identifier.
        container_id: String,
        /// Init pid.
        pid: i32,
    },
    /// Exec process registered.
    TaskExecAdded {
        /// Container identifier.
        container_id: String,
        /// Exec identifier.
        exec_id: String,
    },
    /// Exec process started.
    TaskExecStarted {
        /// Container identifier.
        container_id: String,
        /// Exec identifier.
        exec_id: String,
        /// Exec pid.
        pid: i32,
    },
    /// Process exited.
    TaskExit {
        /// Container identifier.
        container_id: String,
        /// Exec identifier; empty for init.
        #[serde(default)]
        exec_id: String,
        /// Pid inside the guest.
        pid: i32,
        /// Exit status.
        exit_status: i32,
        /// When the exit was observed.
        exited_at: DateTime<Utc>,
    },
    /// Container deleted.
    TaskDelete {
        /// Container identifier.
        container_id: String,
        /// Init pid.
        pid: i32,
        /// Exit status.
        exit_status: i32,
        /// When the exit was observed.
        exited_at: DateTime<Utc>,
    },
}

impl TaskEvent {
    /// The topic this event is published under.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            TaskEvent::TaskCreate { .. } => topics::TASK_CREATE,
            TaskEvent::TaskStart { .. } => topics::TASK_START,
            TaskEvent::TaskExecAdded { .. } => topics::TASK_EXEC_ADDED,
            TaskEvent::TaskExecStarted { .. } => topics::TASK_EXEC_STARTED,
            TaskEvent::TaskExit { .. } => topics::TASK_EXIT,
            TaskEvent::TaskDelete { .. } => topics::TASK_DELETE,
        }
    }
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl Request {
    /// Serializes to a JSON line (with trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes from a JSON line.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

impl Response {
    /// Serializes to a JSON line (with trailing newline).
    ///
    /// Serialization of a response cannot reasonably fail; if it does, a
    /// canned internal-error frame is emitted so the peer is never left
    /// without a reply.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        let mut json = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"error","code":"internal","message":"serialization failed"}"#.to_string()
        });
        json.push('\n');
        json
    }

    /// Deserializes from a JSON line.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}
