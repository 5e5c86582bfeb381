//! Vsock RPC server for the guest services.
//!
//! One listener multiplexes the four services. Each accepted connection
//! carries a single JSON-line request; unary requests get one response
//! frame, streaming requests (output reads, the event stream) hold the
//! connection open and emit frames until EOF or shutdown.
//!
//! The handler is generic over the stream type so tests can drive it with
//! in-memory duplex pipes instead of AF_VSOCK sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{stream_events, EventExchange, EventSink};
use super::stdio::service::{ChunkSink, StdioService};
use super::system;
use super::task::TaskService;
use crate::constants::{MAX_GUEST_CONNECTIONS, MAX_REQUEST_LINE_LEN, RPC_TIMEOUT};
use crate::error::{Code, Error, Result};
use crate::protocol::{Envelope, OutputChunk, Request, Response, ResponseData};

/// The services exposed over vsock.
pub struct GuestServices {
    /// Task lifecycle.
    pub task: Arc<TaskService>,
    /// Stdio streaming.
    pub stdio: StdioService,
    /// Event stream.
    pub events: Arc<EventExchange>,
}

impl GuestServices {
    /// Bundles the services for the server.
    #[must_use]
    pub fn new(task: Arc<TaskService>, events: Arc<EventExchange>) -> Self {
        let stdio = StdioService::new(task.stdio());
        Self {
            task,
            stdio,
            events,
        }
    }
}

/// Frame writer over the connection's write half.
struct FrameSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameSink<W> {
    async fn write_response(&mut self, response: &Response) -> Result<()> {
        self.writer
            .write_all(response.to_json_line().as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for FrameSink<W> {
    async fn send(&mut self, chunk: OutputChunk) -> Result<()> {
        self.write_response(&Response::ok_with(ResponseData::Chunk(chunk)))
            .await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for FrameSink<W> {
    async fn send(&mut self, envelope: Envelope) -> Result<()> {
        self.write_response(&Response::ok_with(ResponseData::Event(envelope)))
            .await
    }
}

/// Serves connections from a vsock listener until cancelled.
#[cfg(target_os = "linux")]
pub async fn serve(
    port: u32,
    services: Arc<GuestServices>,
    shutdown: CancellationToken,
) -> Result<()> {
    use tokio_vsock::{VsockAddr, VsockListener};

    let addr = VsockAddr::new(libc::VMADDR_CID_ANY, port);
    let mut listener = VsockListener::bind(addr).map_err(|e| Error::VsockUnavailable {
        cid: libc::VMADDR_CID_ANY,
        port,
        reason: e.to_string(),
    })?;
    info!(port, "guest RPC server listening");

    let connections = Arc::new(AtomicUsize::new(0));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "failed to accept vsock connection");
                        continue;
                    }
                };

                if connections.load(Ordering::Relaxed) >= MAX_GUEST_CONNECTIONS {
                    warn!(peer = ?peer, max = MAX_GUEST_CONNECTIONS, "connection rejected: limit reached");
                    continue;
                }

                debug!(peer = ?peer, "connection accepted");
                let services = Arc::clone(&services);
                let shutdown = shutdown.child_token();
                let counter = Arc::clone(&connections);
                counter.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, &services, shutdown).await {
                        debug!(error = %err, "connection handler error");
                    }
                    counter.fetch_sub(1, Ordering::Relaxed);
                });
            }
            _ = shutdown.cancelled() => {
                info!("guest RPC server shutting down");
                return Ok(());
            }
        }
    }
}

/// Handles one connection: read the request line, dispatch, respond.
pub async fn handle_connection<S>(
    stream: S,
    services: &GuestServices,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut sink = FrameSink { writer: write_half };

    let mut line = String::new();
    let read = tokio::time::timeout(RPC_TIMEOUT, reader.read_line(&mut line)).await;
    let request = match read {
        Ok(Ok(0)) => return Ok(()), // peer disconnected before sending
        Ok(Ok(n)) if n > MAX_REQUEST_LINE_LEN => {
            sink.write_response(&Response::error(Code::InvalidArgument, "request too large"))
                .await?;
            return Ok(());
        }
        Ok(Ok(_)) => match Request::from_json(&line) {
            Ok(request) => request,
            Err(err) => {
                sink.write_response(&Response::error(
                    Code::InvalidArgument,
                    format!("malformed request: {err}"),
                ))
                .await?;
                return Ok(());
            }
        },
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            sink.write_response(&Response::error(Code::DeadlineExceeded, "request timed out"))
                .await?;
            return Ok(());
        }
    };

    // The reader stays alive for the duration of streaming requests;
    // dropping it would close the connection's read direction on some
    // transports.
    let result = dispatch(request, services, &mut sink, cancel).await;
    drop(reader);
    result
}

async fn dispatch<W>(
    request: Request,
    services: &GuestServices,
    sink: &mut FrameSink<W>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    // Streaming requests own the connection until they finish.
    match request {
        Request::ReadStdout(req) => {
            let key = req.key();
            if let Err(err) = services.stdio.read_stdout(&key, sink, cancel).await {
                return sink.write_response(&Response::from(&err)).await;
            }
            return Ok(());
        }
        Request::ReadStderr(req) => {
            let key = req.key();
            if let Err(err) = services.stdio.read_stderr(&key, sink, cancel).await {
                return sink.write_response(&Response::from(&err)).await;
            }
            return Ok(());
        }
        Request::StreamEvents => {
            if let Err(err) = stream_events(&services.events, sink, cancel).await {
                return sink.write_response(&Response::from(&err)).await;
            }
            return Ok(());
        }
        request => {
            let response = match dispatch_unary(request, services).await {
                Ok(data) => Response::Ok { data },
                Err(err) => Response::from(&err),
            };
            sink.write_response(&response).await
        }
    }
}

async fn dispatch_unary(
    request: Request,
    services: &GuestServices,
) -> Result<Option<ResponseData>> {
    match request {
        Request::CreateTask(req) => {
            let pid = services.task.create(req).await?;
            Ok(Some(ResponseData::Created { pid }))
        }
        Request::StartTask(req) => {
            let pid = services.task.start(&req.container_id, &req.exec_id).await?;
            Ok(Some(ResponseData::Started { pid }))
        }
        Request::ExecProcess(req) => {
            services.task.exec(req).await?;
            Ok(None)
        }
        Request::KillTask(req) => {
            services.task.kill(&req).await?;
            Ok(None)
        }
        Request::DeleteProcess(req) => {
            let exit = services.task.delete(&req.container_id, &req.exec_id).await?;
            Ok(Some(ResponseData::Deleted { exit }))
        }
        Request::WaitProcess(req) => {
            let exit = services.task.wait(&req.container_id, &req.exec_id).await?;
            Ok(Some(ResponseData::Waited { exit }))
        }
        Request::TaskState(req) => {
            let snapshot = services.task.state(&req.container_id, &req.exec_id)?;
            Ok(Some(ResponseData::State {
                status: snapshot.status,
                pid: snapshot.pid,
                exit: snapshot.exit,
            }))
        }
        Request::ResizePty(req) => {
            services.task.resize_pty(&req).await?;
            Ok(None)
        }
        Request::CloseIo(req) => {
            services.task.close_io(&req.container_id, &req.exec_id).await?;
            Ok(None)
        }
        Request::WriteStdin(req) => {
            let count = services.stdio.write_stdin(&req).await?;
            Ok(Some(ResponseData::BytesWritten { count }))
        }
        Request::CloseStdin(req) => {
            services.stdio.close_stdin(&req.key()).await?;
            Ok(None)
        }
        Request::SystemInfo => {
            let info = system::info().await?;
            Ok(Some(ResponseData::Info {
                version: info.version,
                kernel_version: info.kernel_version,
            }))
        }
        Request::ReadStdout(_) | Request::ReadStderr(_) | Request::StreamEvents => Err(
            Error::Internal("streaming request routed to unary dispatch".into()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::runtime::{ContainerRuntime, IoRequest, RuntimeProcess};
    use crate::guest::stdio::StdioManager;
    use crate::protocol::ProcessRequest;
    use tokio::io::duplex;

    struct NullRuntime;

    #[async_trait]
    impl ContainerRuntime for NullRuntime {
        async fn create(
            &self,
            _id: &str,
            _bundle: &std::path::Path,
            _io: IoRequest,
        ) -> Result<RuntimeProcess> {
            Err(Error::Internal("not used".into()))
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
            Err(Error::Internal("not used".into()))
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

    fn test_services() -> Arc<GuestServices> {
        let events = Arc::new(EventExchange::new());
        let task = TaskService::new(
            "default",
            std::env::temp_dir().join("kvmbox-server-tests"),
            Arc::new(NullRuntime),
            Arc::new(StdioManager::new()),
            Arc::clone(&events),
        );
        Arc::new(GuestServices::new(task, events))
    }

    async fn round_trip(request: Request) -> Response {
        let services = test_services();
        let (client, server) = duplex(64 * 1024);

        let handler = tokio::spawn(async move {
            let _ = handle_connection(server, &services, CancellationToken::new()).await;
        });

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(request.to_json_line().unwrap().as_bytes())
            .await
            .unwrap();
        write_half.flush().await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        drop(write_half);
        handler.await.unwrap();

        Response::from_json(&line).unwrap()
    }

    #[tokio::test]
    async fn system_info_round_trip() {
        let response = round_trip(Request::SystemInfo).await;
        match response.into_result().unwrap() {
            Some(ResponseData::Info { version, .. }) => {
                assert_eq!(version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_stdin_unknown_process_maps_to_not_found() {
        let response = round_trip(Request::WriteStdin(crate::protocol::WriteStdinRequest {
            container_id: "missing".into(),
            exec_id: String::new(),
            data: b"x".to_vec(),
        }))
        .await;
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn malformed_request_is_invalid_argument() {
        let services = test_services();
        let (client, server) = duplex(4096);
        let handler = tokio::spawn(async move {
            let _ = handle_connection(server, &services, CancellationToken::new()).await;
        });

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"{not json}\n").await.unwrap();
        write_half.flush().await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        drop(write_half);
        handler.await.unwrap();

        let err = Response::from_json(&line).unwrap().into_result().unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn read_stdout_unknown_process_reports_error_frame() {
        let response = round_trip(Request::ReadStdout(ProcessRequest {
            container_id: "missing".into(),
            exec_id: String::new(),
        }))
        .await;
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }
}
