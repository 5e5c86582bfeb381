//! Concurrency primitives shared by the host and guest.
//!
//! Two small tools live here:
//!
//! - [`WaitGroup`]: a counter-plus-notify completion group. The stdio
//!   manager uses one to join its fan-out readers and another as the
//!   subscriber quiescence barrier. Unlike joining task handles, a
//!   `WaitGroup` supports multiple concurrent waiters and repeated waits.
//! - [`OrderedMutex`]: an async mutex with a rank. Lock acquisitions must
//!   happen in strictly increasing rank order within a task; violations
//!   panic in debug builds. The host uses rank 0 for container state and
//!   rank 1 for hotplug controllers, which makes the container-mutex →
//!   controller-mutex ordering checkable by tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

// =============================================================================
// WaitGroup
// =============================================================================

/// A completion group: tasks register with [`WaitGroup::guard`], waiters
/// block in [`WaitGroup::wait`] until every guard has been dropped or
/// released.
///
/// Guards release on drop, so a panicking task still decrements the count.
/// [`DoneGuard::done`] is idempotent; calling it twice releases once.
#[derive(Debug, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Debug, Default)]
struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    /// Creates an empty wait group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one unit of pending work and returns its release guard.
    #[must_use]
    pub fn guard(&self) -> DoneGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        DoneGuard {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Current number of outstanding guards.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Waits until the count reaches zero.
    pub async fn wait(&self) {
        loop {
            // Arm the waiter before re-checking the count so a release
            // between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the count reaches zero or the timeout expires.
    ///
    /// Returns `true` if the group drained in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// Releases one unit of [`WaitGroup`] work, on `done()` or on drop.
#[derive(Debug)]
pub struct DoneGuard {
    inner: Option<Arc<WaitGroupInner>>,
}

impl DoneGuard {
    /// Releases the guard. Safe to call more than once.
    pub fn done(&mut self) {
        if let Some(inner) = self.inner.take() {
            let prev = inner.count.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev > 0, "wait group count underflow");
            if prev == 1 {
                inner.notify.notify_waiters();
            }
        }
    }

    /// A guard that releases nothing; handed to subscribers of already
    /// exited processes.
    #[must_use]
    pub fn noop() -> Self {
        Self { inner: None }
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.done();
    }
}

// =============================================================================
// OrderedMutex
// =============================================================================

tokio::task_local! {
    /// Ranks of ordered locks currently held by this task, outermost first.
    static HELD_RANKS: std::cell::RefCell<Vec<u32>>;
}

/// An async mutex that participates in a global lock order.
///
/// Each mutex carries a rank; a task may only acquire a rank strictly
/// greater than any rank it already holds. Ordering is enforced with
/// `debug_assert!` through a task-local rank stack, so release builds pay
/// nothing. Tasks not running inside [`with_lock_tracking`] skip the check.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    rank: u32,
    inner: tokio::sync::Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Creates a mutex at the given rank.
    pub fn new(rank: u32, value: T) -> Self {
        Self {
            rank,
            inner: tokio::sync::Mutex::new(value),
        }
    }

    /// The rank of this mutex.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Locks, asserting the rank order when tracking is active.
    pub async fn lock(&self) -> OrderedMutexGuard<'_, T> {
        let tracked = HELD_RANKS
            .try_with(|ranks| {
                let held = ranks.borrow();
                if let Some(&top) = held.last() {
                    debug_assert!(
                        self.rank > top,
                        "lock order violation: acquiring rank {} while holding rank {}",
                        self.rank,
                        top
                    );
                }
                drop(held);
                ranks.borrow_mut().push(self.rank);
                true
            })
            .unwrap_or(false);

        let guard = self.inner.lock().await;
        OrderedMutexGuard {
            rank: self.rank,
            tracked,
            guard,
        }
    }
}

/// Guard returned by [`OrderedMutex::lock`]; pops the rank stack on drop.
pub struct OrderedMutexGuard<'a, T> {
    rank: u32,
    tracked: bool,
    guard: tokio::sync::MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.tracked {
            let _ = HELD_RANKS.try_with(|ranks| {
                let mut held = ranks.borrow_mut();
                if let Some(pos) = held.iter().rposition(|&r| r == self.rank) {
                    held.remove(pos);
                }
            });
        }
    }
}

/// Runs a future with lock-order tracking enabled.
///
/// Production code runs untracked; tests wrap suspect paths in this to get
/// ordering assertions.
pub async fn with_lock_tracking<F, R>(fut: F) -> R
where
    F: std::future::Future<Output = R>,
{
    HELD_RANKS
        .scope(std::cell::RefCell::new(Vec::new()), fut)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_group_drains() {
        let wg = WaitGroup::new();
        let mut g1 = wg.guard();
        let g2 = wg.guard();
        assert_eq!(wg.pending(), 2);

        g1.done();
        g1.done(); // idempotent
        assert_eq!(wg.pending(), 1);

        drop(g2);
        assert_eq!(wg.pending(), 0);
        wg.wait().await;
    }

    #[tokio::test]
    async fn wait_group_wakes_waiter() {
        let wg = Arc::new(WaitGroup::new());
        let guard = wg.guard();

        let waiter = {
            let wg = Arc::clone(&wg);
            tokio::spawn(async move { wg.wait().await })
        };

        tokio::task::yield_now().await;
        drop(guard);
        waiter.await.expect("waiter should finish");
    }

    #[tokio::test]
    async fn wait_group_timeout_expires() {
        let wg = WaitGroup::new();
        let _guard = wg.guard();
        assert!(!wg.wait_timeout(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn ordered_locks_in_order() {
        let low = OrderedMutex::new(0, ());
        let high = OrderedMutex::new(1, ());

        with_lock_tracking(async {
            let _a = low.lock().await;
            let _b = high.lock().await;
        })
        .await;
    }

    #[tokio::test]
    #[should_panic(expected = "lock order violation")]
    async fn ordered_locks_out_of_order_panics() {
        let low = OrderedMutex::new(0, ());
        let high = OrderedMutex::new(1, ());

        with_lock_tracking(async {
            let _b = high.lock().await;
            let _a = low.lock().await;
        })
        .await;
    }

    #[tokio::test]
    async fn untracked_tasks_skip_ordering() {
        let low = OrderedMutex::new(0, ());
        let high = OrderedMutex::new(1, ());

        // No with_lock_tracking wrapper: any order is allowed.
        let _b = high.lock().await;
        let _a = low.lock().await;
    }
}
