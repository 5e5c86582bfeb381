//! Tests for the coordinated timeout and buffering contracts.
//!
//! These values are contracts between the host and guest halves, not
//! tunables: the assertions here are the first thing that should break
//! when someone edits one side without the other.

use std::time::Duration;

use kvmbox::constants::{
    EVENT_CHANNEL_CAPACITY, FANOUT_READ_BUFFER, HOST_IO_WAIT_TIMEOUT, MAX_BUFFERED_BYTES,
    OUTPUT_RETRY_INITIAL_DELAY, OUTPUT_RETRY_MAX_DELAY, SHUTDOWN_ACPI_WAIT, SHUTDOWN_KILL_WAIT,
    SHUTDOWN_POWERDOWN_TIMEOUT, SHUTDOWN_QUIT_TIMEOUT, SHUTDOWN_QUIT_WAIT,
    SUBSCRIBER_QUEUE_CAPACITY, SUBSCRIBER_WAIT_TIMEOUT,
};

// =============================================================================
// Two-Tier Exit Timeout Hierarchy
// =============================================================================

#[test]
fn test_host_wait_exceeds_guest_wait_by_margin() {
    // The guest drains subscribers for at most 10 s before publishing a
    // task exit; the host must outwait that plus vsock latency and FIFO
    // flush. The design margin is at least 12 s.
    assert_eq!(SUBSCRIBER_WAIT_TIMEOUT, Duration::from_secs(10));
    assert_eq!(HOST_IO_WAIT_TIMEOUT, Duration::from_secs(30));
    assert!(HOST_IO_WAIT_TIMEOUT >= SUBSCRIBER_WAIT_TIMEOUT + Duration::from_secs(12));
}

// =============================================================================
// Stdio Buffering
// =============================================================================

#[test]
fn test_subscriber_queue_and_ring_sizes() {
    assert_eq!(SUBSCRIBER_QUEUE_CAPACITY, 64);
    assert_eq!(MAX_BUFFERED_BYTES, 256 * 1024);
    assert_eq!(FANOUT_READ_BUFFER, 32 * 1024);

    // The queue must be able to absorb a burst of several full-size
    // reads without dropping.
    assert!(SUBSCRIBER_QUEUE_CAPACITY * FANOUT_READ_BUFFER >= 2 * 1024 * 1024);
}

// =============================================================================
// Retry Policy
// =============================================================================

#[test]
fn test_retry_backoff_bounds() {
    assert_eq!(OUTPUT_RETRY_INITIAL_DELAY, Duration::from_millis(100));
    assert_eq!(OUTPUT_RETRY_MAX_DELAY, Duration::from_secs(2));
}

// =============================================================================
// VM Shutdown Ladder
// =============================================================================

#[test]
fn test_shutdown_ladder_step_budgets() {
    assert_eq!(SHUTDOWN_POWERDOWN_TIMEOUT, Duration::from_secs(2));
    assert_eq!(SHUTDOWN_ACPI_WAIT, Duration::from_millis(500));
    assert_eq!(SHUTDOWN_QUIT_TIMEOUT, Duration::from_secs(1));
    assert_eq!(SHUTDOWN_QUIT_WAIT, Duration::from_secs(2));
    assert_eq!(SHUTDOWN_KILL_WAIT, Duration::from_secs(2));

    let total = SHUTDOWN_POWERDOWN_TIMEOUT
        + SHUTDOWN_ACPI_WAIT
        + SHUTDOWN_QUIT_TIMEOUT
        + SHUTDOWN_QUIT_WAIT
        + SHUTDOWN_KILL_WAIT;
    assert!(
        total <= Duration::from_secs(10),
        "shutdown ladder exceeds its 10 s budget: {total:?}"
    );
}

#[test]
fn test_event_channel_is_bounded() {
    assert!(EVENT_CHANNEL_CAPACITY >= 64);
    assert!(EVENT_CHANNEL_CAPACITY <= 1024);
}
