//! Bridges containerd's FIFOs with the guest stdio RPCs.
//!
//! Two modes, chosen at creation:
//!
//! - **TTY**: one merged output stream (the guest pty) copied to the
//!   stdout FIFO, plus stdin forwarding.
//! - **Pipes**: independent stdout and stderr forwarders, plus stdin.
//!
//! `start` must only be called after the guest has confirmed the process
//! exists; the output RPCs would otherwise race create/exec and report
//! NotFound. `wait_for_complete` returns once every stream has observed
//! EOF or a terminal error; the host task service bounds that wait with
//! [`crate::constants::HOST_IO_WAIT_TIMEOUT`] before forwarding a task
//! exit. Transient RPC failures retry on the shared 100 ms → 2 s backoff.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::STDIN_CHUNK_SIZE;
use crate::error::Result;
use crate::host::connection::retry_transient;
use crate::protocol::OutputChunk;
use crate::sync::WaitGroup;

// =============================================================================
// Guest Access Seam
// =============================================================================

/// A server-streamed sequence of output chunks.
#[async_trait]
pub trait ChunkStream: Send {
    /// Next chunk; `None` after EOF or stream close.
    async fn next_chunk(&mut self) -> Result<Option<OutputChunk>>;
}

#[cfg(target_os = "linux")]
#[async_trait]
impl ChunkStream for crate::host::client::FrameStream<tokio_vsock::VsockStream> {
    async fn next_chunk(&mut self) -> Result<Option<OutputChunk>> {
        crate::host::client::FrameStream::next_chunk(self).await
    }
}

/// The guest stdio surface for one process.
#[async_trait]
pub trait GuestStdio: Send + Sync {
    /// Opens the stdout stream.
    async fn open_stdout(&self) -> Result<Box<dyn ChunkStream>>;
    /// Opens the stderr stream.
    async fn open_stderr(&self) -> Result<Box<dyn ChunkStream>>;
    /// Writes a stdin chunk; returns bytes accepted.
    async fn write_stdin(&self, data: Vec<u8>) -> Result<u32>;
    /// Closes the guest-side stdin.
    async fn close_stdin(&self) -> Result<()>;
}

/// [`GuestStdio`] bound to one process of one VM.
#[cfg(target_os = "linux")]
pub struct VsockGuestStdio {
    /// Client for the VM.
    pub client: crate::host::client::GuestClient,
    /// Process addressed by the streams.
    pub key: crate::protocol::ProcessKey,
}

#[cfg(target_os = "linux")]
#[async_trait]
impl GuestStdio for VsockGuestStdio {
    async fn open_stdout(&self) -> Result<Box<dyn ChunkStream>> {
        let stream = self
            .client
            .read_stdout(&self.key.container_id, &self.key.exec_id)
            .await?;
        Ok(Box::new(stream))
    }

    async fn open_stderr(&self) -> Result<Box<dyn ChunkStream>> {
        let stream = self
            .client
            .read_stderr(&self.key.container_id, &self.key.exec_id)
            .await?;
        Ok(Box::new(stream))
    }

    async fn write_stdin(&self, data: Vec<u8>) -> Result<u32> {
        self.client
            .write_stdin(&self.key.container_id, &self.key.exec_id, data)
            .await
    }

    async fn close_stdin(&self) -> Result<()> {
        self.client
            .close_stdin(&self.key.container_id, &self.key.exec_id)
            .await
    }
}

// =============================================================================
// Forwarder
// =============================================================================

/// Host-side FIFO endpoints handed over by containerd.
#[derive(Debug, Clone, Default)]
pub struct FifoSet {
    /// Stdin FIFO (host writes into the guest).
    pub stdin: Option<PathBuf>,
    /// Stdout FIFO.
    pub stdout: Option<PathBuf>,
    /// Stderr FIFO; unused in TTY mode.
    pub stderr: Option<PathBuf>,
}

/// Forwarding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Merged pty stream.
    Tty,
    /// Separate stdout/stderr pipes.
    Pipes,
}

/// Forwards one process's I/O between host FIFOs and guest RPCs.
pub struct IoForwarder {
    mode: IoMode,
    fifos: FifoSet,
    guest: Arc<dyn GuestStdio>,
    complete: Arc<WaitGroup>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl IoForwarder {
    /// Creates a forwarder; nothing runs until [`IoForwarder::start`].
    #[must_use]
    pub fn new(mode: IoMode, fifos: FifoSet, guest: Arc<dyn GuestStdio>) -> Self {
        Self {
            mode,
            fifos,
            guest,
            complete: Arc::new(WaitGroup::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the per-stream forwarding tasks. Call only after the guest
    /// confirmed the process exists. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(stdout) = self.fifos.stdout.clone() {
            self.spawn_output(stdout, OutputStreamKind::Stdout);
        }
        if self.mode == IoMode::Pipes {
            if let Some(stderr) = self.fifos.stderr.clone() {
                self.spawn_output(stderr, OutputStreamKind::Stderr);
            }
        }
        if let Some(stdin) = self.fifos.stdin.clone() {
            self.spawn_stdin(stdin);
        }
    }

    fn spawn_output(&self, fifo: PathBuf, kind: OutputStreamKind) {
        let guest = Arc::clone(&self.guest);
        let cancel = self.cancel.clone();
        let guard = self.complete.guard();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = forward_output(&*guest, &fifo, kind, cancel).await {
                warn!(fifo = %fifo.display(), stream = kind.name(), error = %err, "output forwarding ended with error");
            }
        });
    }

    fn spawn_stdin(&self, fifo: PathBuf) {
        let guest = Arc::clone(&self.guest);
        let cancel = self.cancel.clone();
        let guard = self.complete.guard();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = forward_stdin(&*guest, &fifo, cancel).await {
                warn!(fifo = %fifo.display(), error = %err, "stdin forwarding ended with error");
            }
        });
    }

    /// Waits until every stream task has finished (EOF or terminal error).
    pub async fn wait_for_complete(&self) {
        self.complete.wait().await;
    }

    /// Bounded wait; returns `true` if the forwarder completed in time.
    pub async fn wait_for_complete_timeout(&self, timeout: Duration) -> bool {
        self.complete.wait_timeout(timeout).await
    }

    /// Cancels in-flight copies and lets the tasks close their host
    /// handles.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStreamKind {
    Stdout,
    Stderr,
}

impl OutputStreamKind {
    fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Pulls chunks from the guest stream and writes them to the host FIFO
/// until EOF, cancellation, or a terminal error.
async fn forward_output(
    guest: &dyn GuestStdio,
    fifo: &PathBuf,
    kind: OutputStreamKind,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = retry_transient("open output stream", || async {
        match kind {
            OutputStreamKind::Stdout => guest.open_stdout().await,
            OutputStreamKind::Stderr => guest.open_stderr().await,
        }
    })
    .await?;

    let mut sink = tokio::fs::OpenOptions::new().write(true).open(fifo).await?;

    loop {
        let chunk = tokio::select! {
            chunk = stream.next_chunk() => chunk?,
            _ = cancel.cancelled() => {
                debug!(stream = kind.name(), "output forwarding cancelled");
                break;
            }
        };
        match chunk {
            Some(chunk) if chunk.eof => break,
            Some(chunk) => {
                sink.write_all(&chunk.data).await?;
                sink.flush().await?;
            }
            None => break,
        }
    }

    sink.shutdown().await?;
    debug!(stream = kind.name(), "output forwarding complete");
    Ok(())
}

/// Reads the host stdin FIFO and pushes chunks through the unary
/// WriteStdin RPC, retrying transient failures. FIFO EOF closes the
/// guest stdin.
async fn forward_stdin(
    guest: &dyn GuestStdio,
    fifo: &PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    let mut source = tokio::fs::OpenOptions::new().read(true).open(fifo).await?;
    let mut buf = vec![0u8; STDIN_CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            read = source.read(&mut buf) => read?,
            _ = cancel.cancelled() => {
                debug!("stdin forwarding cancelled");
                return Ok(());
            }
        };
        if n == 0 {
            break;
        }

        // WriteStdin is at-least-once under retry; callers needing
        // at-most-once set deadlines instead.
        let data = buf[..n].to_vec();
        retry_transient("write stdin", || {
            let data = data.clone();
            async { guest.write_stdin(data).await.map(|_| ()) }
        })
        .await?;
    }

    if let Err(err) = guest.close_stdin().await {
        debug!(error = %err, "guest stdin close failed (process may have exited)");
    }
    debug!("stdin forwarding complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedStream {
        chunks: VecDeque<OutputChunk>,
    }

    #[async_trait]
    impl ChunkStream for ScriptedStream {
        async fn next_chunk(&mut self) -> Result<Option<OutputChunk>> {
            Ok(self.chunks.pop_front())
        }
    }

    struct ScriptedGuest {
        stdout: StdMutex<Option<Vec<OutputChunk>>>,
        stderr: StdMutex<Option<Vec<OutputChunk>>>,
        stdin_writes: StdMutex<Vec<Vec<u8>>>,
        stdin_closed: AtomicBool,
        flaky_writes: AtomicBool,
    }

    impl ScriptedGuest {
        fn new(stdout: Vec<OutputChunk>, stderr: Vec<OutputChunk>) -> Arc<Self> {
            Arc::new(Self {
                stdout: StdMutex::new(Some(stdout)),
                stderr: StdMutex::new(Some(stderr)),
                stdin_writes: StdMutex::new(Vec::new()),
                stdin_closed: AtomicBool::new(false),
                flaky_writes: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl GuestStdio for ScriptedGuest {
        async fn open_stdout(&self) -> Result<Box<dyn ChunkStream>> {
            let chunks = self
                .stdout
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::RpcUnavailable("stdout already opened".into()))?;
            Ok(Box::new(ScriptedStream {
                chunks: chunks.into(),
            }))
        }

        async fn open_stderr(&self) -> Result<Box<dyn ChunkStream>> {
            let chunks = self
                .stderr
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::RpcUnavailable("stderr already opened".into()))?;
            Ok(Box::new(ScriptedStream {
                chunks: chunks.into(),
            }))
        }

        async fn write_stdin(&self, data: Vec<u8>) -> Result<u32> {
            if self.flaky_writes.swap(false, Ordering::SeqCst) {
                return Err(Error::RpcUnavailable("flaky".into()));
            }
            let n = data.len() as u32;
            self.stdin_writes.lock().unwrap().push(data);
            Ok(n)
        }

        async fn close_stdin(&self) -> Result<()> {
            self.stdin_closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn chunks(body: &[&[u8]]) -> Vec<OutputChunk> {
        let mut out: Vec<OutputChunk> = body
            .iter()
            .map(|b| OutputChunk::data(b.to_vec()))
            .collect();
        out.push(OutputChunk::eof());
        out
    }

    #[tokio::test]
    async fn pipes_mode_copies_both_streams_to_fifos() {
        let tmp = tempfile::tempdir().unwrap();
        let stdout_path = tmp.path().join("stdout");
        let stderr_path = tmp.path().join("stderr");
        std::fs::write(&stdout_path, b"").unwrap();
        std::fs::write(&stderr_path, b"").unwrap();

        let guest = ScriptedGuest::new(chunks(&[b"out-a", b"out-b"]), chunks(&[b"err"]));
        let forwarder = IoForwarder::new(
            IoMode::Pipes,
            FifoSet {
                stdin: None,
                stdout: Some(stdout_path.clone()),
                stderr: Some(stderr_path.clone()),
            },
            guest,
        );

        forwarder.start();
        assert!(
            forwarder
                .wait_for_complete_timeout(Duration::from_secs(2))
                .await
        );

        assert_eq!(std::fs::read(&stdout_path).unwrap(), b"out-aout-b");
        assert_eq!(std::fs::read(&stderr_path).unwrap(), b"err");
    }

    #[tokio::test]
    async fn tty_mode_ignores_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let stdout_path = tmp.path().join("stdout");
        std::fs::write(&stdout_path, b"").unwrap();

        let guest = ScriptedGuest::new(chunks(&[b"merged"]), chunks(&[b"never"]));
        let forwarder = IoForwarder::new(
            IoMode::Tty,
            FifoSet {
                stdin: None,
                stdout: Some(stdout_path.clone()),
                stderr: Some(tmp.path().join("stderr-unused")),
            },
            Arc::clone(&guest) as Arc<dyn GuestStdio>,
        );

        forwarder.start();
        assert!(
            forwarder
                .wait_for_complete_timeout(Duration::from_secs(2))
                .await
        );
        assert_eq!(std::fs::read(&stdout_path).unwrap(), b"merged");
        // stderr stream never opened
        assert!(guest.stderr.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn stdin_is_chunked_retried_and_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let stdin_path = tmp.path().join("stdin");
        std::fs::write(&stdin_path, b"piped input").unwrap();

        let guest = ScriptedGuest::new(vec![], vec![]);
        guest.flaky_writes.store(true, Ordering::SeqCst);

        let forwarder = IoForwarder::new(
            IoMode::Pipes,
            FifoSet {
                stdin: Some(stdin_path),
                stdout: None,
                stderr: None,
            },
            Arc::clone(&guest) as Arc<dyn GuestStdio>,
        );

        forwarder.start();
        assert!(
            forwarder
                .wait_for_complete_timeout(Duration::from_secs(2))
                .await
        );

        let writes = guest.stdin_writes.lock().unwrap();
        let total: Vec<u8> = writes.iter().flatten().copied().collect();
        assert_eq!(total, b"piped input");
        assert!(guest.stdin_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let guest = ScriptedGuest::new(vec![], vec![]);
        let forwarder = IoForwarder::new(IoMode::Pipes, FifoSet::default(), guest);
        forwarder.start();
        forwarder.start();
        forwarder.wait_for_complete().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight() {
        let tmp = tempfile::tempdir().unwrap();
        let stdout_path = tmp.path().join("stdout");
        std::fs::write(&stdout_path, b"").unwrap();

        // Stream that never delivers EOF: forwarder must still exit on
        // shutdown.
        struct StuckStream;
        #[async_trait]
        impl ChunkStream for StuckStream {
            async fn next_chunk(&mut self) -> Result<Option<OutputChunk>> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
        struct StuckGuest;
        #[async_trait]
        impl GuestStdio for StuckGuest {
            async fn open_stdout(&self) -> Result<Box<dyn ChunkStream>> {
                Ok(Box::new(StuckStream))
            }
            async fn open_stderr(&self) -> Result<Box<dyn ChunkStream>> {
                Ok(Box::new(StuckStream))
            }
            async fn write_stdin(&self, _data: Vec<u8>) -> Result<u32> {
                Ok(0)
            }
            async fn close_stdin(&self) -> Result<()> {
                Ok(())
            }
        }

        let forwarder = IoForwarder::new(
            IoMode::Pipes,
            FifoSet {
                stdin: None,
                stdout: Some(stdout_path),
                stderr: None,
            },
            Arc::new(StuckGuest),
        );
        forwarder.start();

        assert!(
            !forwarder
                .wait_for_complete_timeout(Duration::from_millis(100))
                .await
        );
        forwarder.shutdown();
        assert!(
            forwarder
                .wait_for_complete_timeout(Duration::from_secs(2))
                .await
        );
    }
}
