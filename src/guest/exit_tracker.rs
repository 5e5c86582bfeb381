//! Exit-to-start matching and init-exit ordering.
//!
//! Two races make exit handling hard:
//!
//! 1. A process can exit before its `start` call finishes bookkeeping
//!    ("early exit"). Every start therefore opens a subscription first;
//!    exits that arrive while the subscription is live are captured per
//!    pid, and `handle_start` returns them instead of registering a
//!    process that is already gone.
//! 2. Within a container, containerd must see every exec exit before the
//!    init exit. The tracker counts running execs per container; an init
//!    exit is stashed and its publication delayed until the count drains
//!    to zero.
//!
//! All state lives behind one mutex that is held only for map edits; the
//! waiting itself happens on a oneshot handed back to the caller.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::protocol::ExitRecord;

/// Init vs exec; the tracker pattern-matches on this instead of inspecting
/// exec-id strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessKind {
    /// The container's first process.
    Init,
    /// An auxiliary exec process.
    Exec {
        /// Exec identifier within the container.
        exec_id: String,
    },
}

impl ProcessKind {
    /// True for the init variant.
    #[must_use]
    pub fn is_init(&self) -> bool {
        matches!(self, ProcessKind::Init)
    }
}

/// A process known to be running: which container it belongs to and which
/// kind it is. Multiple entries may transiently share a pid after reuse.
#[derive(Debug, Clone)]
pub struct ContainerProcess {
    /// Owning container.
    pub container_id: String,
    /// Init or exec.
    pub process: ProcessKind,
}

#[derive(Default)]
struct TrackerState {
    next_sub_id: u64,
    /// Subscription id → exits captured while the subscription was live.
    active_subscriptions: HashMap<u64, HashMap<i32, Vec<ExitRecord>>>,
    /// Pid → running processes (usually 1; pid reuse can alias more).
    running: HashMap<i32, Vec<ContainerProcess>>,
    /// Running exec count per container.
    running_execs: HashMap<String, i64>,
    /// Waiters parked until the exec count reaches zero.
    exec_waiters: HashMap<String, oneshot::Sender<()>>,
    /// Init exits stashed while execs drain.
    init_exits: HashMap<String, ExitRecord>,
}

/// Matches exit notifications to starts and orders init-exit publication
/// after all exec exits.
#[derive(Default)]
pub struct ExitTracker {
    state: Mutex<TrackerState>,
}

/// An open interest in exits; exactly one of [`ExitTracker::handle_start`]
/// or [`ExitTracker::cancel`] must consume it.
#[derive(Debug)]
pub struct ExitSubscription {
    id: u64,
}

impl ExitTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in exits that occur before a start completes.
    ///
    /// When restarting an existing container, pass its current init pid:
    /// the stale running entry is removed so an exit racing the restart is
    /// treated as early rather than attributed to the dead incarnation.
    pub fn subscribe(&self, restarting: Option<(&str, i32)>) -> ExitSubscription {
        let mut state = self.state.lock().expect("exit tracker poisoned");
        state.next_sub_id += 1;
        let id = state.next_sub_id;
        state.active_subscriptions.insert(id, HashMap::new());

        if let Some((container_id, pid)) = restarting {
            if let Some(entries) = state.running.get_mut(&pid) {
                entries.retain(|cp| cp.container_id != container_id);
                if entries.is_empty() {
                    state.running.remove(&pid);
                }
            }
        }

        ExitSubscription { id }
    }

    /// Completes a start: consumes the subscription, returns any early
    /// exits for the pid, and otherwise records the process as running.
    ///
    /// A pid of 0 means the start failed; captured exits are returned
    /// without registering anything.
    pub fn handle_start(
        &self,
        sub: ExitSubscription,
        container_id: &str,
        process: ProcessKind,
        pid: i32,
    ) -> Vec<ExitRecord> {
        let mut state = self.state.lock().expect("exit tracker poisoned");
        let exits = state
            .active_subscriptions
            .remove(&sub.id)
            .unwrap_or_default();

        let early = exits.get(&pid).cloned().unwrap_or_default();
        if pid == 0 || !early.is_empty() {
            return early;
        }

        let is_exec = !process.is_init();
        state.running.entry(pid).or_default().push(ContainerProcess {
            container_id: container_id.to_string(),
            process,
        });
        if is_exec {
            *state.running_execs.entry(container_id.to_string()).or_insert(0) += 1;
        }

        Vec::new()
    }

    /// Abandons a subscription without registering a start.
    pub fn cancel(&self, sub: ExitSubscription) {
        let mut state = self.state.lock().expect("exit tracker poisoned");
        state.active_subscriptions.remove(&sub.id);
    }

    /// Records an exit: copies it into every live subscription, resolves
    /// the running entries for the pid (all of them, see below), and
    /// stashes the record for any init among them.
    ///
    /// Pid reuse can leave more than one process registered under a pid;
    /// one exit resolves them all rather than leaving a waiter orphaned.
    pub fn notify_exit(&self, exit: ExitRecord) -> Vec<ContainerProcess> {
        let mut state = self.state.lock().expect("exit tracker poisoned");

        for exits in state.active_subscriptions.values_mut() {
            exits.entry(exit.pid).or_default().push(exit);
        }

        let resolved = state.running.remove(&exit.pid).unwrap_or_default();
        for cp in &resolved {
            if cp.process.is_init() {
                state.init_exits.insert(cp.container_id.clone(), exit);
            }
        }

        resolved
    }

    /// Decides whether an init exit must wait for execs.
    ///
    /// Returns `None` when no execs are running (publish immediately; the
    /// container's exec-count entry is dropped) or a receiver that fires
    /// once the last exec exit has been published.
    pub fn should_delay_init_exit(&self, container_id: &str) -> Option<oneshot::Receiver<()>> {
        let mut state = self.state.lock().expect("exit tracker poisoned");

        match state.running_execs.get(container_id) {
            None | Some(0) => {
                state.running_execs.remove(container_id);
                None
            }
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                state.exec_waiters.insert(container_id.to_string(), tx);
                Some(rx)
            }
        }
    }

    /// Marks one exec exit as published; when the count drains to zero a
    /// parked init-exit waiter is released.
    pub fn notify_exec_exit(&self, container_id: &str) {
        let mut state = self.state.lock().expect("exit tracker poisoned");

        let remaining = {
            let count = state
                .running_execs
                .entry(container_id.to_string())
                .or_insert(0);
            *count -= 1;
            *count
        };

        if remaining <= 0 {
            state.running_execs.remove(container_id);
            if let Some(waiter) = state.exec_waiters.remove(container_id) {
                let _ = waiter.send(());
            }
        }
    }

    /// Decrements the exec count for a start that failed after subscribe.
    pub fn decrement_exec_count(&self, container_id: &str) {
        self.notify_exec_exit(container_id);
    }

    /// Takes the stashed init exit for a container, if any.
    pub fn take_init_exit(&self, container_id: &str) -> Option<ExitRecord> {
        let mut state = self.state.lock().expect("exit tracker poisoned");
        state.init_exits.remove(container_id)
    }

    /// True if an init exit is stashed for the container.
    #[must_use]
    pub fn init_has_exited(&self, container_id: &str) -> bool {
        let state = self.state.lock().expect("exit tracker poisoned");
        state.init_exits.contains_key(container_id)
    }

    /// Number of live subscriptions; drains to zero at quiescence.
    #[must_use]
    pub fn active_subscription_count(&self) -> usize {
        let state = self.state.lock().expect("exit tracker poisoned");
        state.active_subscriptions.len()
    }

    /// Drops all tracking state for a container on delete.
    pub fn cleanup(&self, container_id: &str) {
        let mut state = self.state.lock().expect("exit tracker poisoned");

        state.init_exits.remove(container_id);
        state.running_execs.remove(container_id);
        state.exec_waiters.remove(container_id);

        state.running.retain(|_, entries| {
            entries.retain(|cp| cp.container_id != container_id);
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn exit(pid: i32, status: i32) -> ExitRecord {
        ExitRecord {
            pid,
            status,
            exited_at: Utc::now(),
        }
    }

    #[test]
    fn start_then_exit_resolves_process() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        let early = t.handle_start(sub, "c1", ProcessKind::Init, 100);
        assert!(early.is_empty());

        let resolved = t.notify_exit(exit(100, 0));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].container_id, "c1");
        assert!(resolved[0].process.is_init());
        assert!(t.init_has_exited("c1"));
        assert_eq!(t.take_init_exit("c1").unwrap().pid, 100);
        assert!(!t.init_has_exited("c1"));
    }

    #[test]
    fn early_exit_is_returned_by_handle_start() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);

        // Exit lands before handle_start bookkeeping completes.
        let resolved = t.notify_exit(exit(100, 7));
        assert!(resolved.is_empty(), "nothing registered yet");

        let early = t.handle_start(sub, "c1", ProcessKind::Init, 100);
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].status, 7);

        // The process was never registered as running.
        assert!(t.notify_exit(exit(100, 7)).is_empty());
    }

    #[test]
    fn failed_start_returns_captured_exits_without_registering() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        let early = t.handle_start(sub, "c1", ProcessKind::Init, 0);
        assert!(early.is_empty());
        assert!(t.notify_exit(exit(0, 0)).is_empty());
    }

    #[test]
    fn cancel_clears_subscription() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        assert_eq!(t.active_subscription_count(), 1);
        t.cancel(sub);
        assert_eq!(t.active_subscription_count(), 0);
    }

    #[test]
    fn init_exit_waits_for_execs() {
        let t = ExitTracker::new();

        let sub = t.subscribe(None);
        assert!(t.handle_start(sub, "c1", ProcessKind::Init, 100).is_empty());
        let sub = t.subscribe(None);
        assert!(t
            .handle_start(
                sub,
                "c1",
                ProcessKind::Exec {
                    exec_id: "e1".into()
                },
                200
            )
            .is_empty());

        t.notify_exit(exit(100, 0));

        let mut rx = t
            .should_delay_init_exit("c1")
            .expect("init exit must be delayed while an exec runs");
        assert!(rx.try_recv().is_err(), "waiter must not fire early");

        t.notify_exit(exit(200, 0));
        t.notify_exec_exit("c1");
        assert!(rx.try_recv().is_ok(), "waiter fires after last exec exit");
    }

    #[test]
    fn init_exit_immediate_without_execs() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        t.handle_start(sub, "c1", ProcessKind::Init, 100);
        t.notify_exit(exit(100, 0));
        assert!(t.should_delay_init_exit("c1").is_none());
    }

    #[test]
    fn restart_subscription_treats_racing_exit_as_early() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        t.handle_start(sub, "c1", ProcessKind::Init, 100);

        // Restart: prior init pid entry is dropped so its exit is early.
        let sub = t.subscribe(Some(("c1", 100)));
        let resolved = t.notify_exit(exit(100, 1));
        assert!(resolved.is_empty(), "stale entry must not resolve");

        let early = t.handle_start(sub, "c1", ProcessKind::Init, 100);
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].status, 1);
    }

    #[test]
    fn pid_reuse_resolves_all_aliases() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        t.handle_start(sub, "c1", ProcessKind::Init, 100);
        let sub = t.subscribe(None);
        t.handle_start(
            sub,
            "c2",
            ProcessKind::Exec {
                exec_id: "e1".into(),
            },
            100,
        );

        let resolved = t.notify_exit(exit(100, 0));
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn exactly_one_running_entry_per_successful_start() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        let early = t.handle_start(sub, "c1", ProcessKind::Init, 42);
        assert!(early.is_empty());
        let resolved = t.notify_exit(exit(42, 0));
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn cleanup_drops_all_container_state() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        t.handle_start(sub, "c1", ProcessKind::Init, 100);
        let sub = t.subscribe(None);
        t.handle_start(
            sub,
            "c1",
            ProcessKind::Exec {
                exec_id: "e1".into(),
            },
            200,
        );
        t.notify_exit(exit(100, 0));

        t.cleanup("c1");
        assert!(!t.init_has_exited("c1"));
        assert!(t.should_delay_init_exit("c1").is_none());
        assert!(t.notify_exit(exit(200, 0)).is_empty());
    }

    #[test]
    fn failed_exec_start_decrements_count() {
        let t = ExitTracker::new();
        let sub = t.subscribe(None);
        t.handle_start(sub, "c1", ProcessKind::Init, 100);
        let sub = t.subscribe(None);
        t.handle_start(
            sub,
            "c1",
            ProcessKind::Exec {
                exec_id: "e1".into(),
            },
            200,
        );

        // A second exec fails after its count was taken; the caller
        // compensates with decrement_exec_count.
        let sub = t.subscribe(None);
        t.handle_start(
            sub,
            "c1",
            ProcessKind::Exec {
                exec_id: "e2".into(),
            },
            300,
        );
        t.decrement_exec_count("c1");

        t.notify_exit(exit(100, 0));
        let rx = t.should_delay_init_exit("c1");
        assert!(rx.is_some(), "one exec still running");

        t.notify_exit(exit(200, 0));
        t.notify_exec_exit("c1");
        assert!(rx.unwrap().try_recv().is_ok());
    }
}
