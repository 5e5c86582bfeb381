//! RPC surface over the stdio manager.
//!
//! The streaming read path is where shutdown correctness lives: the handler
//! runs a **biased drain loop** that always tries a non-blocking receive
//! before honoring cancellation, and on cancellation drains whatever is
//! already queued before returning. Chunks sitting in the queue at cancel
//! time are therefore never lost; only output the process has not yet
//! produced can be cut off.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{StdioManager, Subscription};
use crate::error::Result;
use crate::protocol::{OutputChunk, ProcessKey, WriteStdinRequest};

/// Sink for output frames; implemented by the RPC connection writer.
#[async_trait]
pub trait ChunkSink: Send {
    /// Sends one chunk frame to the peer.
    async fn send(&mut self, chunk: OutputChunk) -> Result<()>;
}

/// The StdIO service: stdin writes plus server-streamed output reads.
pub struct StdioService {
    manager: Arc<StdioManager>,
}

impl StdioService {
    /// Creates a service backed by the given manager.
    #[must_use]
    pub fn new(manager: Arc<StdioManager>) -> Self {
        Self { manager }
    }

    /// Writes bytes to a process stdin, returning the count written.
    pub async fn write_stdin(&self, req: &WriteStdinRequest) -> Result<u32> {
        let key = ProcessKey {
            container_id: req.container_id.clone(),
            exec_id: req.exec_id.clone(),
        };
        debug!(process = %key, len = req.data.len(), "WriteStdin");
        let n = self.manager.write_stdin(&key, &req.data).await?;
        Ok(n as u32)
    }

    /// Closes a process stdin.
    pub async fn close_stdin(&self, key: &ProcessKey) -> Result<()> {
        debug!(process = %key, "CloseStdin");
        self.manager.close_stdin(key).await
    }

    /// Streams stdout chunks to the sink until EOF or cancellation.
    pub async fn read_stdout<S: ChunkSink>(
        &self,
        key: &ProcessKey,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> Result<()> {
        let sub = self.manager.subscribe_stdout(key)?;
        stream_output(sub, sink, cancel).await
    }

    /// Streams stderr chunks to the sink until EOF or cancellation.
    pub async fn read_stderr<S: ChunkSink>(
        &self,
        key: &ProcessKey,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> Result<()> {
        let sub = self.manager.subscribe_stderr(key)?;
        stream_output(sub, sink, cancel).await
    }
}

/// Outcome of pushing one queue item to the sink.
enum StreamStep {
    /// Keep pumping.
    Continue,
    /// Stream finished (EOF frame delivered or peer gone).
    Done,
}

/// Pumps a subscription into the sink with the biased drain discipline.
///
/// The subscription's done-guard is released on every exit path; it backs
/// the manager's quiescence barrier, and holding it past return would stall
/// exit publication for the full subscriber timeout.
async fn stream_output<S: ChunkSink>(
    sub: Subscription,
    sink: &mut S,
    cancel: CancellationToken,
) -> Result<()> {
    let Subscription {
        mut rx,
        cancel: manager_cancel,
        mut done,
    } = sub;

    let result = async {
        loop {
            // Biased: always consume ready chunks before looking at
            // cancellation.
            loop {
                match rx.try_recv() {
                    Ok(chunk) => match handle_chunk(sink, chunk).await? {
                        StreamStep::Done => return Ok(()),
                        StreamStep::Continue => {}
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        // Queue closed by teardown: emit the final EOF frame.
                        sink.send(OutputChunk::eof()).await?;
                        return Ok(());
                    }
                }
            }

            // Nothing ready: wait for a chunk or for cancellation.
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => match handle_chunk(sink, chunk).await? {
                        StreamStep::Done => return Ok(()),
                        StreamStep::Continue => {}
                    },
                    None => {
                        sink.send(OutputChunk::eof()).await?;
                        return Ok(());
                    }
                },
                _ = cancel.cancelled() => {
                    return drain_remaining(&mut rx, sink).await;
                }
                _ = manager_cancel.cancelled() => {
                    return drain_remaining(&mut rx, sink).await;
                }
            }
        }
    }
    .await;

    done.done();
    result
}

async fn handle_chunk<S: ChunkSink>(sink: &mut S, chunk: OutputChunk) -> Result<StreamStep> {
    let eof = chunk.eof;
    sink.send(chunk).await?;
    Ok(if eof {
        StreamStep::Done
    } else {
        StreamStep::Continue
    })
}

/// After cancellation: push the chunks that are already queued, then stop.
/// Returning Ok here is deliberate: the stream was drained successfully,
/// the peer just asked us to stop.
async fn drain_remaining<S: ChunkSink>(
    rx: &mut tokio::sync::mpsc::Receiver<OutputChunk>,
    sink: &mut S,
) -> Result<()> {
    loop {
        match rx.try_recv() {
            Ok(chunk) => {
                let eof = chunk.eof;
                if sink.send(chunk).await.is_err() {
                    // Peer already gone; nothing more to deliver.
                    return Ok(());
                }
                if eof {
                    return Ok(());
                }
            }
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => {
                let _ = sink.send(OutputChunk::eof()).await;
                return Ok(());
            }
        }
    }
}
