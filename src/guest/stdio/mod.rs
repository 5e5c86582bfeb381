//! Per-process stdio management with multi-subscriber fan-out.
//!
//! The manager owns the output pipes of every registered process and
//! broadcasts their bytes to zero or more live subscribers (attached RPC
//! streams). When no subscriber is attached, output is kept in a bounded
//! ring so a late subscriber still sees recent history.
//!
//! # Back-pressure policy
//!
//! A slow or stuck subscriber must never be able to back-pressure the
//! process through a blocking write(): fan-out enqueues to each subscriber
//! queue non-blockingly and drops the chunk for that subscriber (with a
//! warning) when the queue is full. Loss past the queue bound is accepted
//! by design.
//!
//! # Exit-time drain protocol
//!
//! [`StdioManager::unregister`] runs five ordered steps:
//!
//! 1. Remove the process from the map; no new lookups can find it.
//! 2. Mark it exited; late subscribers get the synthetic replay path.
//! 3. Wait for the fan-out readers to finish; every chunk, including the
//!    EOF chunk, has reached the subscriber queues.
//! 4. Cancel and close every subscriber queue; safe now, EOF is in.
//! 5. Close stdin if still open.
//!
//! Closing the queues only after step 3 is what guarantees every
//! subscriber observes the EOF chunk. [`StdioManager::wait_for_io_complete`]
//! is the quiescence barrier the task service takes before publishing a
//! process exit: it joins the fan-out readers (unbounded, they always
//! terminate) and then the subscriber streams (bounded by
//! [`SUBSCRIBER_WAIT_TIMEOUT`], a stuck subscriber must not hold the exit
//! event hostage).

pub mod service;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::{
    FANOUT_READ_BUFFER, MAX_BUFFERED_BYTES, SUBSCRIBER_QUEUE_CAPACITY, SUBSCRIBER_WAIT_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::protocol::{OutputChunk, ProcessKey};
use crate::sync::{DoneGuard, WaitGroup};

/// Boxed reader for a process output stream.
pub type OutputSource = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer for a process stdin.
pub type StdinSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Which output stream of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    fn name(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

// =============================================================================
// Per-Process State
// =============================================================================

/// One attached consumer of one output stream.
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<OutputChunk>,
    cancel: CancellationToken,
}

/// Mutable state of one output stream: live subscribers plus the bounded
/// ring buffer used while nobody is attached.
#[derive(Default)]
struct StreamState {
    subscribers: Vec<Subscriber>,
    buffer: VecDeque<OutputChunk>,
    buffered_bytes: usize,
}

impl StreamState {
    /// Appends a chunk to the ring, evicting oldest whole chunks until the
    /// byte total fits the cap again.
    fn buffer_chunk(&mut self, chunk: OutputChunk) {
        self.buffered_bytes += chunk.len();
        self.buffer.push_back(chunk);
        while self.buffered_bytes > MAX_BUFFERED_BYTES {
            match self.buffer.pop_front() {
                Some(evicted) => self.buffered_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    /// Takes all buffered chunks, resetting the byte counter.
    fn drain_buffer(&mut self) -> VecDeque<OutputChunk> {
        self.buffered_bytes = 0;
        std::mem::take(&mut self.buffer)
    }
}

/// State shared by both output streams; a single lock mirrors the fact
/// that exit marking and subscriber edits must be mutually visible.
struct PioState {
    exited: bool,
    stdout: StreamState,
    stderr: StreamState,
}

impl PioState {
    fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamState {
        match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }
}

struct StdinState {
    sink: Option<StdinSink>,
    closed: bool,
}

/// I/O state for one registered process.
struct ProcessIo {
    key: ProcessKey,
    state: Mutex<PioState>,
    stdin: tokio::sync::Mutex<StdinState>,
    /// Joined before subscriber queues are closed; fan-out readers always
    /// terminate once the process side of the pipe closes.
    fanout_wg: WaitGroup,
    /// The quiescence barrier: one guard per attached RPC stream.
    subscriber_wg: WaitGroup,
}

impl ProcessIo {
    /// Distributes a chunk: buffered when nobody listens, otherwise
    /// try-sent to every subscriber with per-subscriber drop on overflow.
    fn deliver(&self, kind: StreamKind, chunk: OutputChunk) {
        let mut state = self.state.lock().expect("stdio state poisoned");
        let stream = state.stream_mut(kind);
        if stream.subscribers.is_empty() {
            stream.buffer_chunk(chunk);
            return;
        }
        for sub in &stream.subscribers {
            if sub.tx.try_send(chunk.clone()).is_err() && !chunk.eof {
                warn!(
                    process = %self.key,
                    stream = kind.name(),
                    "dropping data for slow subscriber"
                );
            }
        }
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// A live subscription to one output stream.
///
/// The holder MUST eventually release [`Subscription::done`] (explicitly or
/// by drop); it backs the quiescence barrier that gates exit publication.
pub struct Subscription {
    /// Chunk queue; closed after the final EOF chunk.
    pub rx: mpsc::Receiver<OutputChunk>,
    /// Fired when the process is torn down; the stream handler should
    /// drain what is queued and finish.
    pub cancel: CancellationToken,
    /// Barrier release; idempotent.
    pub done: SubscriberDone,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Releases a subscriber from the quiescence barrier and detaches it from
/// the fan-out list. Idempotent; also runs on drop.
pub struct SubscriberDone {
    pio: Option<Arc<ProcessIo>>,
    kind: StreamKind,
    sub_id: u64,
    guard: DoneGuard,
}

impl SubscriberDone {
    fn noop() -> Self {
        Self {
            pio: None,
            kind: StreamKind::Stdout,
            sub_id: 0,
            guard: DoneGuard::noop(),
        }
    }

    /// Detaches the subscriber and releases the barrier. Safe to call
    /// repeatedly.
    pub fn done(&mut self) {
        if let Some(pio) = self.pio.take() {
            let mut state = pio.state.lock().expect("stdio state poisoned");
            let stream = state.stream_mut(self.kind);
            stream.subscribers.retain(|s| s.id != self.sub_id);
        }
        self.guard.done();
    }
}

impl Drop for SubscriberDone {
    fn drop(&mut self) {
        self.done();
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Maintains I/O state for all container processes in the guest.
pub struct StdioManager {
    processes: RwLock<HashMap<ProcessKey, Arc<ProcessIo>>>,
    next_sub_id: AtomicU64,
}

impl Default for StdioManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    fn lookup(&self, key: &ProcessKey) -> Result<Arc<ProcessIo>> {
        self.processes
            .read()
            .expect("stdio map poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ProcessNotFound {
                container_id: key.container_id.clone(),
                exec_id: key.exec_id.clone(),
            })
    }

    /// Registers a process with its I/O pipes and spawns one fan-out reader
    /// per output source. The manager takes ownership of the pipes.
    ///
    /// # Errors
    ///
    /// Fails with `FailedPrecondition` if the key is already registered.
    pub fn register(
        &self,
        key: ProcessKey,
        stdin: Option<StdinSink>,
        stdout: Option<OutputSource>,
        stderr: Option<OutputSource>,
    ) -> Result<()> {
        let pio = Arc::new(ProcessIo {
            key: key.clone(),
            state: Mutex::new(PioState {
                exited: false,
                stdout: StreamState::default(),
                stderr: StreamState::default(),
            }),
            stdin: tokio::sync::Mutex::new(StdinState {
                sink: stdin,
                closed: false,
            }),
            fanout_wg: WaitGroup::new(),
            subscriber_wg: WaitGroup::new(),
        });

        {
            let mut map = self.processes.write().expect("stdio map poisoned");
            if map.contains_key(&key) {
                return Err(Error::ProcessAlreadyRegistered {
                    container_id: key.container_id,
                    exec_id: key.exec_id,
                });
            }
            map.insert(key.clone(), Arc::clone(&pio));
        }

        if let Some(source) = stdout {
            let guard = pio.fanout_wg.guard();
            tokio::spawn(fan_out_reader(
                Arc::clone(&pio),
                StreamKind::Stdout,
                source,
                guard,
            ));
        }
        if let Some(source) = stderr {
            let guard = pio.fanout_wg.guard();
            tokio::spawn(fan_out_reader(
                Arc::clone(&pio),
                StreamKind::Stderr,
                source,
                guard,
            ));
        }

        debug!(process = %key, "registered process I/O");
        Ok(())
    }

    /// Tears down a process, running the five-step drain protocol described
    /// in the module docs. Idempotent: unknown keys are a no-op.
    pub async fn unregister(&self, key: &ProcessKey) {
        // Step 1: remove from the map; no new lookups can find it.
        let pio = {
            let mut map = self.processes.write().expect("stdio map poisoned");
            match map.remove(key) {
                Some(pio) => pio,
                None => return,
            }
        };

        // Step 2: mark exited; late subscribers now take the replay path.
        {
            let mut state = pio.state.lock().expect("stdio state poisoned");
            state.exited = true;
        }

        // Step 3: wait for fan-out readers to push everything, EOF included,
        // into the subscriber queues.
        pio.fanout_wg.wait().await;

        // Step 4: cancel and close every subscriber queue. Dropping the
        // sender closes the channel, so each subscriber sees its queued
        // chunks, then the EOF, then end-of-channel.
        {
            let mut state = pio.state.lock().expect("stdio state poisoned");
            for sub in state.stdout.subscribers.drain(..) {
                sub.cancel.cancel();
            }
            for sub in state.stderr.subscribers.drain(..) {
                sub.cancel.cancel();
            }
        }

        // Step 5: close stdin if still open.
        {
            let mut stdin = pio.stdin.lock().await;
            if !stdin.closed {
                if let Some(mut sink) = stdin.sink.take() {
                    let _ = sink.shutdown().await;
                }
                stdin.closed = true;
            }
        }

        debug!(process = %key, "unregistered process I/O");
    }

    /// Writes bytes to a process stdin, returning the count written.
    pub async fn write_stdin(&self, key: &ProcessKey, data: &[u8]) -> Result<usize> {
        let pio = self.lookup(key)?;
        let mut stdin = pio.stdin.lock().await;

        if stdin.closed {
            return Err(Error::StdinUnavailable {
                container_id: key.container_id.clone(),
                exec_id: key.exec_id.clone(),
                reason: "stdin closed".into(),
            });
        }
        let sink = stdin.sink.as_mut().ok_or_else(|| Error::StdinUnavailable {
            container_id: key.container_id.clone(),
            exec_id: key.exec_id.clone(),
            reason: "stdin not available".into(),
        })?;

        sink.write_all(data).await?;
        sink.flush().await?;
        Ok(data.len())
    }

    /// Closes a process stdin.
    ///
    /// # Errors
    ///
    /// Fails with `FailedPrecondition` if stdin is already closed.
    pub async fn close_stdin(&self, key: &ProcessKey) -> Result<()> {
        let pio = self.lookup(key)?;
        let mut stdin = pio.stdin.lock().await;

        if stdin.closed {
            return Err(Error::StdinUnavailable {
                container_id: key.container_id.clone(),
                exec_id: key.exec_id.clone(),
                reason: "stdin already closed".into(),
            });
        }
        if let Some(mut sink) = stdin.sink.take() {
            sink.shutdown().await?;
        }
        stdin.closed = true;
        Ok(())
    }

    /// Subscribes to a process stdout stream.
    ///
    /// The ring buffer is drained into the new subscriber first, so a late
    /// subscriber sees buffered history before live output. A second
    /// subscription after a cancelled one does NOT see chunks the first
    /// drain moved out of the ring; they belonged to that subscriber.
    pub fn subscribe_stdout(&self, key: &ProcessKey) -> Result<Subscription> {
        self.subscribe(key, StreamKind::Stdout)
    }

    /// Subscribes to a process stderr stream. See [`Self::subscribe_stdout`].
    pub fn subscribe_stderr(&self, key: &ProcessKey) -> Result<Subscription> {
        self.subscribe(key, StreamKind::Stderr)
    }

    fn subscribe(&self, key: &ProcessKey, kind: StreamKind) -> Result<Subscription> {
        let pio = self.lookup(key)?;
        let mut state = pio.state.lock().expect("stdio state poisoned");
        let exited = state.exited;
        let buffered = state.stream_mut(kind).drain_buffer();

        if exited {
            drop(state);
            return Ok(Self::subscribe_to_exited(key, kind, buffered));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);

        // Replay buffered history into the fresh queue before the
        // subscriber goes live; anything that does not fit is dropped.
        let buffered_chunks = buffered.len();
        for chunk in buffered {
            if tx.try_send(chunk).is_err() {
                warn!(process = %key, stream = kind.name(), "dropping buffered data for slow subscriber");
            }
        }

        let stream = state.stream_mut(kind);
        stream.subscribers.push(Subscriber {
            id: sub_id,
            tx,
            cancel: cancel.clone(),
        });
        let guard = pio.subscriber_wg.guard();
        drop(state);

        debug!(
            process = %key,
            stream = kind.name(),
            buffered_chunks,
            "subscriber registered"
        );

        Ok(Subscription {
            rx,
            cancel,
            done: SubscriberDone {
                pio: Some(pio),
                kind,
                sub_id,
                guard,
            },
        })
    }

    /// Builds the synthetic, already-closed queue handed to a subscriber of
    /// a process that has exited: buffered history, one EOF, end of channel.
    fn subscribe_to_exited(
        key: &ProcessKey,
        kind: StreamKind,
        buffered: VecDeque<OutputChunk>,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(buffered.len() + 1);
        let buffered_chunks = buffered.len();
        let mut saw_eof = false;
        for chunk in buffered {
            saw_eof = saw_eof || chunk.eof;
            let _ = tx.try_send(chunk);
        }
        if !saw_eof {
            let _ = tx.try_send(OutputChunk::eof());
        }
        drop(tx);

        debug!(
            process = %key,
            stream = kind.name(),
            buffered_chunks,
            "late subscriber received buffered data (process already exited)"
        );

        Subscription {
            rx,
            cancel: CancellationToken::new(),
            done: SubscriberDone::noop(),
        }
    }

    /// The quiescence barrier: waits for the fan-out readers, then for all
    /// subscriber streams up to [`SUBSCRIBER_WAIT_TIMEOUT`]. On expiry a
    /// warning is recorded and processing continues; a leaked subscriber
    /// must not block exit delivery. No-op for unknown keys.
    pub async fn wait_for_io_complete(&self, key: &ProcessKey) {
        let pio = match self.lookup(key) {
            Ok(pio) => pio,
            Err(_) => return,
        };

        pio.fanout_wg.wait().await;
        debug!(process = %key, "fan-out readers complete");

        if pio
            .subscriber_wg
            .wait_timeout(SUBSCRIBER_WAIT_TIMEOUT)
            .await
        {
            debug!(process = %key, "I/O complete (all subscribers finished)");
        } else {
            warn!(
                process = %key,
                "timeout waiting for subscriber streams, proceeding (possible subscriber leak)"
            );
        }
    }

    /// Fast predicate: is the key registered?
    #[must_use]
    pub fn has_process(&self, key: &ProcessKey) -> bool {
        self.processes
            .read()
            .expect("stdio map poisoned")
            .contains_key(key)
    }
}

/// Reads one output stream and distributes chunks until EOF or error, then
/// delivers the terminal EOF chunk.
async fn fan_out_reader(
    pio: Arc<ProcessIo>,
    kind: StreamKind,
    mut source: OutputSource,
    mut guard: DoneGuard,
) {
    let mut buf = vec![0u8; FANOUT_READ_BUFFER];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => pio.deliver(kind, OutputChunk::data(buf[..n].to_vec())),
            Err(err) => {
                warn!(
                    process = %pio.key,
                    stream = kind.name(),
                    error = %err,
                    "error reading from process"
                );
                break;
            }
        }
    }
    pio.deliver(kind, OutputChunk::eof());
    guard.done();
}
