//! # kvmbox
//!
//! **A containerd runtime shim that runs each OCI container inside a
//! dedicated QEMU/KVM microVM.**
//!
//! The crate has two halves that talk over vsock:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Host                                                                 │
//! │  containerd ──ttrpc──► ShimTaskService                               │
//! │                         ├── Bundle transform (bind mounts, netns)    │
//! │                         ├── NetworkManager (CNI ADD/DEL, TAP fd)     │
//! │                         ├── VmInstance (QEMU child, QMP, shutdown)   │
//! │                         ├── ConnectionManager (vsock client pool)    │
//! │                         └── IoForwarder (FIFO ⇄ guest stdio RPC)     │
//! │                                      │ vsock                         │
//! │  ┌───────────────────────────────────▼──────────────────────────┐    │
//! │  │ MicroVM                                                      │    │
//! │  │  vminit (PID 1)                                              │    │
//! │  │   ├── TaskService (create/start/exec/kill via OCI runtime)   │    │
//! │  │   ├── StdioManager (fan-out, ring buffers, quiescence)       │    │
//! │  │   ├── ExitTracker (early exits, exec-before-init ordering)   │    │
//! │  │   └── EventExchange (lifecycle event stream)                 │    │
//! │  └──────────────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Exit Coordination
//!
//! The hard part of the design is making sure containerd never sees a task
//! exit before the task's output has been delivered, without ever blocking
//! forever on a stuck consumer. Two coordinated timeouts implement this:
//! the guest waits up to 10 s for subscriber RPC streams to drain
//! ([`constants::SUBSCRIBER_WAIT_TIMEOUT`]), and the host waits up to 30 s
//! for its I/O forwarder ([`constants::HOST_IO_WAIT_TIMEOUT`]) before
//! forwarding the exit event regardless. Output loss past those bounds is
//! accepted by design.
//!
//! # Ordering Guarantees
//!
//! - Per subscriber, chunks arrive in fan-out observation order, followed
//!   by exactly one EOF chunk.
//! - Per container, the init exit event is published strictly after every
//!   exec exit event.
//! - VM states only move `New → Starting → Running → Shutdown`.

// =============================================================================
// Shared Leaves
// =============================================================================

pub mod bundle;
pub mod constants;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod sync;

// =============================================================================
// Guest (vminit)
// =============================================================================

/// Guest-side services hosted by the `vminit` binary: stdio fan-out, exit
/// tracking, the task service, the event exchange, and the vsock RPC server.
pub mod guest;

// =============================================================================
// Host (shim)
// =============================================================================

/// Host-side shim: the containerd-facing task service, VM lifecycle,
/// networking, vsock clients, and I/O forwarding.
pub mod host;

pub use error::{Code, Error, Result};
