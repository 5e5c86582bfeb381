//! Container lifecycle state machine.
//!
//! Transitions are compare-and-swap on a single atomic, so concurrent RPCs
//! race safely: exactly one wins the transition, the others observe the
//! current state in the `FailedPrecondition` error. Multi-step operations
//! take a [`TransitionGuard`] through the transitional state; if the
//! operation fails before committing, dropping the guard rolls the state
//! back to the prior stable state.
//!
//! ```text
//! None → Creating → Created → Starting → Running
//!                                          │  ▲
//!                                  Pausing ▼  │ Resuming
//!                                        Paused
//! Running | Paused | Created → Stopping → Stopped
//! any → Failed          Stopped | Failed → Deleted
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// Lifecycle state of one container on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContainerState {
    /// No container yet.
    None = 0,
    /// Create in progress.
    Creating = 1,
    /// Created, not started.
    Created = 2,
    /// Start in progress.
    Starting = 3,
    /// Running.
    Running = 4,
    /// Pause in progress.
    Pausing = 5,
    /// Paused.
    Paused = 6,
    /// Resume in progress.
    Resuming = 7,
    /// Stop in progress.
    Stopping = 8,
    /// Stopped; exit status known.
    Stopped = 9,
    /// Deleted (terminal).
    Deleted = 10,
    /// Unrecoverable failure; only delete is permitted.
    Failed = 11,
}

impl ContainerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Creating,
            2 => Self::Created,
            3 => Self::Starting,
            4 => Self::Running,
            5 => Self::Pausing,
            6 => Self::Paused,
            7 => Self::Resuming,
            8 => Self::Stopping,
            9 => Self::Stopped,
            10 => Self::Deleted,
            _ => Self::Failed,
        }
    }

    /// Containerd-facing status string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "unknown",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }

    fn allows(self, to: ContainerState) -> bool {
        use ContainerState::*;
        if to == Failed {
            return true;
        }
        matches!(
            (self, to),
            (None, Creating)
                | (Creating, Created)
                | (Created, Starting)
                | (Starting, Running)
                | (Running, Pausing)
                | (Pausing, Paused)
                | (Paused, Resuming)
                | (Resuming, Running)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Created, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Deleted)
                | (Failed, Deleted)
        )
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder of a container's state.
#[derive(Debug)]
pub struct StateMachine {
    id: String,
    state: AtomicU8,
}

impl StateMachine {
    /// Creates a machine in [`ContainerState::None`].
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: AtomicU8::new(ContainerState::None as u8),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Compare-and-swap transition. On contention or an illegal edge the
    /// observed state is reported in the error.
    pub fn transition(&self, from: ContainerState, to: ContainerState) -> Result<()> {
        if !from.allows(to) {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                state: from.to_string(),
                expected: format!("a state allowing {to}"),
            });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|observed| Error::InvalidState {
                id: self.id.clone(),
                state: ContainerState::from_u8(observed).to_string(),
                expected: from.to_string(),
            })?;
        Ok(())
    }

    /// Unconditionally enters [`ContainerState::Failed`].
    pub fn fail(&self) {
        self.state
            .store(ContainerState::Failed as u8, Ordering::SeqCst);
    }

    /// Begins a guarded transition into a transitional state; the guard
    /// rolls back to `from` unless committed.
    pub fn begin(
        &self,
        from: ContainerState,
        transitional: ContainerState,
    ) -> Result<TransitionGuard<'_>> {
        self.transition(from, transitional)?;
        Ok(TransitionGuard {
            machine: self,
            rollback_to: from,
            transitional,
            committed: false,
        })
    }
}

/// Rolls a transitional state back to the prior stable state on drop
/// unless [`TransitionGuard::commit`] ran.
pub struct TransitionGuard<'a> {
    machine: &'a StateMachine,
    rollback_to: ContainerState,
    transitional: ContainerState,
    committed: bool,
}

impl TransitionGuard<'_> {
    /// Completes the transition into the target stable state.
    pub fn commit(mut self, to: ContainerState) -> Result<()> {
        self.committed = true;
        self.machine.transition(self.transitional, to)
    }

    /// Marks the operation failed permanently; no rollback happens.
    pub fn fail(mut self) {
        self.committed = true;
        self.machine.fail();
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // Roll back only if the state is still the transitional one;
            // a concurrent fail() wins.
            let _ = self.machine.state.compare_exchange(
                self.transitional as u8,
                self.rollback_to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}
