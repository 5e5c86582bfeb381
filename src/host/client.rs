//! Typed clients for the guest services.
//!
//! Each request opens a fresh connection, sends one JSON-line request, and
//! reads the response frame(s), the same connection-per-request model the
//! guest server implements. [`RpcConnection`] is generic over the byte
//! stream so tests can drive it against the in-process guest server over
//! duplex pipes; [`GuestClient`] binds it to AF_VSOCK.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::constants::{GUEST_VSOCK_PORT, RPC_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{
    CreateTaskRequest, Envelope, ExecProcessRequest, ExitRecord, KillTaskRequest, OutputChunk,
    ProcessRequest, Request, ResizePtyRequest, Response, ResponseData, TaskStatus,
    WriteStdinRequest,
};

// =============================================================================
// Connection
// =============================================================================

/// One request/response exchange over an arbitrary byte stream.
pub struct RpcConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Send> RpcConnection<S> {
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send_request(&mut self, request: &Request) -> Result<()> {
        let line = request.to_json_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Response> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::RpcUnavailable(
                "connection closed before response".into(),
            ));
        }
        Ok(Response::from_json(&line)?)
    }

    /// Sends a unary request and returns the response payload.
    pub async fn unary(mut self, request: Request) -> Result<Option<ResponseData>> {
        self.send_request(&request).await?;
        self.read_frame().await?.into_result()
    }

    /// Sends a unary request bounded by a deadline.
    pub async fn unary_timeout(
        self,
        request: Request,
        timeout: Duration,
    ) -> Result<Option<ResponseData>> {
        let operation = format!("{request:?}");
        tokio::time::timeout(timeout, self.unary(request))
            .await
            .map_err(|_| Error::Timeout {
                operation,
                duration: timeout,
            })?
    }

    /// Sends a streaming request; the connection becomes a frame stream.
    pub async fn open_stream(mut self, request: Request) -> Result<FrameStream<S>> {
        self.send_request(&request).await?;
        Ok(FrameStream { conn: self })
    }
}

/// A server-streamed response: output chunks or event envelopes.
pub struct FrameStream<S> {
    conn: RpcConnection<S>,
}

impl<S: AsyncRead + AsyncWrite + Send> FrameStream<S> {
    /// Next chunk frame; `None` after the EOF chunk or stream close.
    pub async fn next_chunk(&mut self) -> Result<Option<OutputChunk>> {
        match self.conn.read_frame().await {
            Ok(response) => match response.into_result()? {
                Some(ResponseData::Chunk(chunk)) => Ok(Some(chunk)),
                Some(other) => Err(Error::Internal(format!(
                    "unexpected frame on output stream: {other:?}"
                ))),
                None => Ok(None),
            },
            // A closed connection after EOF is a normal end of stream.
            Err(Error::RpcUnavailable(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Next event frame; `None` when the stream closes.
    pub async fn next_event(&mut self) -> Result<Option<Envelope>> {
        match self.conn.read_frame().await {
            Ok(response) => match response.into_result()? {
                Some(ResponseData::Event(envelope)) => Ok(Some(envelope)),
                Some(other) => Err(Error::Internal(format!(
                    "unexpected frame on event stream: {other:?}"
                ))),
                None => Ok(None),
            },
            Err(Error::RpcUnavailable(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

// =============================================================================
// Vsock Client
// =============================================================================

/// Dials the guest RPC port over AF_VSOCK.
#[cfg(target_os = "linux")]
pub async fn dial(cid: u32, port: u32) -> Result<tokio_vsock::VsockStream> {
    let addr = tokio_vsock::VsockAddr::new(cid, port);
    tokio_vsock::VsockStream::connect(addr)
        .await
        .map_err(|e| Error::VsockUnavailable {
            cid,
            port,
            reason: e.to_string(),
        })
}

/// Vsock is Linux-only; other hosts report unsupported so cross-platform
/// tooling still builds.
#[cfg(not(target_os = "linux"))]
pub async fn dial(cid: u32, port: u32) -> Result<tokio::net::TcpStream> {
    let _ = (cid, port);
    Err(Error::RpcUnavailable(
        "vsock transport is only supported on Linux".into(),
    ))
}

/// Typed client for the guest services of one VM.
#[derive(Debug, Clone)]
pub struct GuestClient {
    cid: u32,
    port: u32,
    timeout: Duration,
}

impl GuestClient {
    /// Client for the given guest CID on the default port.
    #[must_use]
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            port: GUEST_VSOCK_PORT,
            timeout: RPC_TIMEOUT,
        }
    }

    /// Overrides the port.
    #[must_use]
    pub fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    /// Overrides the unary timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The guest CID.
    #[must_use]
    pub fn cid(&self) -> u32 {
        self.cid
    }

    #[cfg(target_os = "linux")]
    async fn connect(&self) -> Result<RpcConnection<tokio_vsock::VsockStream>> {
        Ok(RpcConnection::new(dial(self.cid, self.port).await?))
    }

    #[cfg(not(target_os = "linux"))]
    async fn connect(&self) -> Result<RpcConnection<tokio::net::TcpStream>> {
        Ok(RpcConnection::new(dial(self.cid, self.port).await?))
    }

    async fn unary(&self, request: Request) -> Result<Option<ResponseData>> {
        let conn = self.connect().await?;
        conn.unary_timeout(request, self.timeout).await
    }

    // ---------------------------------------------------------------- task

    /// Creates a container; returns the init pid.
    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<i32> {
        match self.unary(Request::CreateTask(req)).await? {
            Some(ResponseData::Created { pid }) => Ok(pid),
            other => Err(unexpected("Created", other)),
        }
    }

    /// Starts a process; returns its pid.
    pub async fn start_task(&self, container_id: &str, exec_id: &str) -> Result<i32> {
        let req = Request::StartTask(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        });
        match self.unary(req).await? {
            Some(ResponseData::Started { pid }) => Ok(pid),
            other => Err(unexpected("Started", other)),
        }
    }

    /// Registers an exec process.
    pub async fn exec_process(&self, req: ExecProcessRequest) -> Result<()> {
        self.unary(Request::ExecProcess(req)).await?;
        Ok(())
    }

    /// Delivers a signal.
    pub async fn kill_task(&self, req: KillTaskRequest) -> Result<()> {
        self.unary(Request::KillTask(req)).await?;
        Ok(())
    }

    /// Deletes a process; returns its exit record.
    pub async fn delete_process(&self, container_id: &str, exec_id: &str) -> Result<ExitRecord> {
        let req = Request::DeleteProcess(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        });
        match self.unary(req).await? {
            Some(ResponseData::Deleted { exit }) => Ok(exit),
            other => Err(unexpected("Deleted", other)),
        }
    }

    /// Waits for a process exit. No client-side deadline: waiting is the
    /// point of the call.
    pub async fn wait_process(&self, container_id: &str, exec_id: &str) -> Result<ExitRecord> {
        let conn = self.connect().await?;
        let req = Request::WaitProcess(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        });
        match conn.unary(req).await? {
            Some(ResponseData::Waited { exit }) => Ok(exit),
            other => Err(unexpected("Waited", other)),
        }
    }

    /// Queries process state.
    pub async fn task_state(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<(TaskStatus, i32, Option<ExitRecord>)> {
        let req = Request::TaskState(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        });
        match self.unary(req).await? {
            Some(ResponseData::State { status, pid, exit }) => Ok((status, pid, exit)),
            other => Err(unexpected("State", other)),
        }
    }

    /// Resizes a process terminal.
    pub async fn resize_pty(&self, req: ResizePtyRequest) -> Result<()> {
        self.unary(Request::ResizePty(req)).await?;
        Ok(())
    }

    /// Closes process stdin (containerd CloseIO).
    pub async fn close_io(&self, container_id: &str, exec_id: &str) -> Result<()> {
        self.unary(Request::CloseIo(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        }))
        .await?;
        Ok(())
    }

    // --------------------------------------------------------------- stdio

    /// Writes bytes to a process stdin; returns the count accepted.
    pub async fn write_stdin(
        &self,
        container_id: &str,
        exec_id: &str,
        data: Vec<u8>,
    ) -> Result<u32> {
        let req = Request::WriteStdin(WriteStdinRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
            data,
        });
        match self.unary(req).await? {
            Some(ResponseData::BytesWritten { count }) => Ok(count),
            other => Err(unexpected("BytesWritten", other)),
        }
    }

    /// Closes a process stdin.
    pub async fn close_stdin(&self, container_id: &str, exec_id: &str) -> Result<()> {
        self.unary(Request::CloseStdin(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        }))
        .await?;
        Ok(())
    }

    /// Opens a stdout stream.
    #[cfg(target_os = "linux")]
    pub async fn read_stdout(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<FrameStream<tokio_vsock::VsockStream>> {
        let conn = self.connect().await?;
        conn.open_stream(Request::ReadStdout(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        }))
        .await
    }

    /// Opens a stderr stream.
    #[cfg(target_os = "linux")]
    pub async fn read_stderr(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<FrameStream<tokio_vsock::VsockStream>> {
        let conn = self.connect().await?;
        conn.open_stream(Request::ReadStderr(ProcessRequest {
            container_id: container_id.into(),
            exec_id: exec_id.into(),
        }))
        .await
    }

    /// Opens the event stream.
    #[cfg(target_os = "linux")]
    pub async fn stream_events(&self) -> Result<FrameStream<tokio_vsock::VsockStream>> {
        let conn = self.connect().await?;
        conn.open_stream(Request::StreamEvents).await
    }

    // -------------------------------------------------------------- system

    /// Guest version and kernel info.
    pub async fn system_info(&self) -> Result<(String, String)> {
        match self.unary(Request::SystemInfo).await? {
            Some(ResponseData::Info {
                version,
                kernel_version,
            }) => Ok((version, kernel_version)),
            other => Err(unexpected("Info", other)),
        }
    }
}

fn unexpected(expected: &str, got: Option<ResponseData>) -> Error {
    Error::Internal(format!("expected {expected} response, got {got:?}"))
}
