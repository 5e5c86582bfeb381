//! Vsock client management for one VM.
//!
//! Unary task RPCs and the event stream take different channels: unary
//! clients are leased per call (each request dials fresh, so a stale fd
//! never poisons a later call), while the event stream is one long-lived
//! connection re-dialed on transient failure. EBADF/ENODEV classes map to
//! `Unavailable` in the error layer and are what the re-dial loop retries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::constants::{
    OUTPUT_RETRY_INITIAL_DELAY, OUTPUT_RETRY_MAX_DELAY, TRANSIENT_RETRY_ATTEMPTS,
};
use crate::error::{Error, Result};
use crate::host::client::GuestClient;

/// Retries an operation on transient (`Unavailable`) errors with
/// exponential backoff and jitter, capped in delay and attempts.
pub async fn retry_transient<T, F, Fut>(operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = OUTPUT_RETRY_INITIAL_DELAY;
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < TRANSIENT_RETRY_ATTEMPTS => {
                attempt += 1;
                debug!(operation, attempt, error = %err, "transient failure, backing off");
                tokio::time::sleep(with_jitter(delay)).await;
                delay = (delay * 2).min(OUTPUT_RETRY_MAX_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Adds up to 25% jitter so synchronized retries from many shims spread
/// out. Derived from the clock; no RNG dependency needed for this.
fn with_jitter(delay: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter_num = u64::from(nanos % 256);
    delay + delay.mul_f64(jitter_num as f64 / 1024.0)
}

/// Pools and repairs the vsock clients of one VM.
pub struct ConnectionManager {
    cid: u32,
    closed: AtomicBool,
    outstanding: Arc<AtomicUsize>,
}

impl ConnectionManager {
    /// Manager for a guest CID.
    #[must_use]
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            closed: AtomicBool::new(false),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The guest CID.
    #[must_use]
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Leases a client for unary task RPCs. The lease tracks outstanding
    /// use; dropping it releases the slot.
    pub fn get_task_client(&self) -> Result<TaskClientLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RpcUnavailable("connection manager closed".into()));
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(TaskClientLease {
            client: GuestClient::new(self.cid),
            outstanding: Arc::clone(&self.outstanding),
        })
    }

    /// Opens the streaming event channel, re-dialing on transient errors.
    #[cfg(target_os = "linux")]
    pub async fn get_event_stream(
        &self,
    ) -> Result<crate::host::client::FrameStream<tokio_vsock::VsockStream>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RpcUnavailable("connection manager closed".into()));
        }
        let cid = self.cid;
        retry_transient("open event stream", || async {
            GuestClient::new(cid).stream_events().await
        })
        .await
    }

    /// Number of leased unary clients.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Marks the manager closed; subsequent leases fail `Unavailable`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A leased unary client; releases its slot on drop.
#[derive(Debug)]
pub struct TaskClientLease {
    client: GuestClient,
    outstanding: Arc<AtomicUsize>,
}

impl std::ops::Deref for TaskClientLease {
    type Target = GuestClient;

    fn deref(&self) -> &GuestClient {
        &self.client
    }
}

impl Drop for TaskClientLease {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_transient("test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::RpcUnavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let err = retry_transient("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::InvalidArgument("bad".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_is_bounded() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let err = retry_transient("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::RpcUnavailable("always down".into())) }
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), TRANSIENT_RETRY_ATTEMPTS);
    }

    #[test]
    fn lease_tracks_outstanding() {
        let manager = ConnectionManager::new(3);
        assert_eq!(manager.outstanding(), 0);
        let lease = manager.get_task_client().unwrap();
        assert_eq!(manager.outstanding(), 1);
        assert_eq!(lease.cid(), 3);
        drop(lease);
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn closed_manager_rejects_leases() {
        let manager = ConnectionManager::new(3);
        manager.close();
        let err = manager.get_task_client().unwrap_err();
        assert_eq!(err.code(), crate::error::Code::Unavailable);
    }

    #[test]
    fn jitter_stays_bounded() {
        let base = Duration::from_millis(100);
        for _ in 0..16 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + base.mul_f64(0.25));
        }
    }
}
