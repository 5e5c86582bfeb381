//! Constants for the shim and guest init.
//!
//! All limits, timeouts, and protocol values are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.
//!
//! # I/O Timeout Hierarchy
//!
//! The guest-side and host-side exit timeouts are a coordinated pair, not
//! independent tunables. On process exit:
//!
//! ```text
//! 1. Process exits in guest
//! 2. Fan-out readers detect EOF, deliver it to subscriber queues
//! 3. Guest waits up to SUBSCRIBER_WAIT_TIMEOUT for RPC streams to drain
//! 4. Guest publishes TaskExit
//! 5. Host receives TaskExit, waits up to HOST_IO_WAIT_TIMEOUT for the
//!    I/O forwarder to report complete
//! 6. Host forwards TaskExit to containerd
//! ```
//!
//! If the guest timeout fires first, the host sees the forwarder complete
//! quickly (the RPC streams have ended). The host timeout is a safety net
//! for a stuck forwarder. `HOST_IO_WAIT_TIMEOUT` must stay well above
//! `SUBSCRIBER_WAIT_TIMEOUT` plus vsock latency and FIFO flush time; this
//! crate keeps at least a 12 second margin between them.

use std::time::Duration;

// =============================================================================
// Stdio Buffering
// =============================================================================

/// Buffer size (in chunks) for subscriber output queues.
///
/// This queue provides slack between the fan-out task (which reads from the
/// process) and the RPC stream sender. Without buffering, a slow network
/// would block the fan-out, which in turn would block the process on write().
///
/// 64 chunks at up to 32 KiB per chunk is ~2 MiB before chunks are dropped,
/// enough for typical bursts like a stack-trace dump or a large JSON blob.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Maximum bytes buffered per output stream for late subscribers.
///
/// When no subscriber is attached, output is kept so a late subscriber
/// (e.g. an attach after container start) can see recent output. The buffer
/// is a bounded ring: whole chunks are evicted oldest-first when the byte
/// total exceeds this cap. Delivery from the ring is convenience, not a
/// guarantee.
pub const MAX_BUFFERED_BYTES: usize = 256 * 1024;

/// Scratch buffer size for fan-out reads from process pipes.
pub const FANOUT_READ_BUFFER: usize = 32 * 1024;

/// Chunk size for host-side stdin forwarding over the unary WriteStdin RPC.
pub const STDIN_CHUNK_SIZE: usize = 32 * 1024;

// =============================================================================
// I/O Quiescence Timeouts (coordinated pair, see module docs)
// =============================================================================

/// Maximum time the guest waits for subscriber RPC streams to finish after
/// the process exits and the fan-out readers have drained.
///
/// Prevents the quiescence barrier from blocking forever if a subscriber
/// never releases its done-guard. If this fires, investigate the RPC stream
/// handling; well-behaved subscribers finish quickly.
pub const SUBSCRIBER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time the host waits for the I/O forwarder to complete before
/// forwarding a TaskExit event to containerd.
///
/// Covers the guest subscriber timeout (10 s), vsock latency (~1 s worst
/// case), host FIFO flush (~1 s worst case), and a safety margin. If this
/// fires, the exit event is forwarded anyway: delivering the exit with
/// possibly-truncated trailing output beats blocking forever.
pub const HOST_IO_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Retry Policy
// =============================================================================

/// Initial delay for retrying transient output-forwarding failures.
pub const OUTPUT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Maximum delay between output-forwarding retries.
pub const OUTPUT_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Maximum attempts for retried transient RPCs (dial, WriteStdin).
pub const TRANSIENT_RETRY_ATTEMPTS: u32 = 8;

// =============================================================================
// VM Shutdown Ladder
// =============================================================================

/// Timeout for the graceful shutdown request over the QMP control socket.
pub const SHUTDOWN_POWERDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for the guest to quiesce after the ACPI powerdown request.
pub const SHUTDOWN_ACPI_WAIT: Duration = Duration::from_millis(500);

/// Timeout for the QMP quit command.
pub const SHUTDOWN_QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait for the hypervisor process to exit after quit.
pub const SHUTDOWN_QUIT_WAIT: Duration = Duration::from_secs(2);

/// Wait for the hypervisor process to exit after SIGKILL.
pub const SHUTDOWN_KILL_WAIT: Duration = Duration::from_secs(2);

/// Window for the guest to become reachable over vsock during boot.
pub const GUEST_READY_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Vsock Protocol
// =============================================================================

/// Vsock port the guest RPC server listens on.
pub const GUEST_VSOCK_PORT: u32 = 2962;

/// Default timeout for unary guest RPCs.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum length of a single request line (bytes).
pub const MAX_REQUEST_LINE_LEN: usize = 1024 * 1024;

/// Maximum concurrent connections accepted by the guest RPC server.
pub const MAX_GUEST_CONNECTIONS: usize = 64;

// =============================================================================
// Events
// =============================================================================

/// Capacity of the guest event-exchange subscriber queues and the host
/// `events` forwarding channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Exit status reported when a process failed to launch.
pub const FAILED_TO_LAUNCH_STATUS: i32 = 255;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_timeout_exceeds_guest_timeout_with_margin() {
        // The two-tier hierarchy is a contract: the host cap must exceed the
        // guest cap by at least 12 seconds of network and flush margin.
        assert!(
            HOST_IO_WAIT_TIMEOUT >= SUBSCRIBER_WAIT_TIMEOUT + Duration::from_secs(12),
            "host I/O wait must exceed guest subscriber wait by >= 12s"
        );
    }

    #[test]
    fn shutdown_ladder_bounded() {
        let total = SHUTDOWN_POWERDOWN_TIMEOUT
            + SHUTDOWN_ACPI_WAIT
            + SHUTDOWN_QUIT_TIMEOUT
            + SHUTDOWN_QUIT_WAIT
            + SHUTDOWN_KILL_WAIT;
        assert!(
            total <= Duration::from_secs(10),
            "total shutdown ladder must not exceed 10 seconds"
        );
    }

    #[test]
    fn retry_delays_ordered() {
        assert!(OUTPUT_RETRY_INITIAL_DELAY < OUTPUT_RETRY_MAX_DELAY);
    }
}
