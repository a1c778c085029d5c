//! A non-fair, non-reentrant, cancellable lock
//!
//! The single-object pool hands resource ownership between threads, so the
//! lock deliberately has no RAII guard: `lock` may run on one thread and
//! `unlock` on another, with the borrowed resource travelling in between.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};

use crate::errors::{PoolError, PoolResult};
use crate::interrupt;

const WAITING: u8 = 0;
const RETIRED: u8 = 1;

/// One enqueued waiter. Only the owning thread transitions `state` to
/// `RETIRED`, and nodes are unlinked and reclaimed strictly after that
/// transition; the owner may therefore touch its own node freely until it
/// retires it, and never afterwards.
struct Waiter {
    thread: Thread,
    state: AtomicU8,
    next: Atomic<Waiter>,
}

impl Waiter {
    fn new(state: u8) -> Self {
        Self {
            thread: thread::current(),
            state: AtomicU8::new(state),
            next: Atomic::null(),
        }
    }

    /// Caller must own the node and must not touch it again afterwards.
    unsafe fn retire(node: *const Waiter) {
        (*node).state.store(RETIRED, Ordering::Release);
    }
}

/// Lock-free singly linked queue of parked waiters: Michael–Scott insertion
/// at the tail, lazy unlink of retired nodes at the head, epoch-based
/// reclamation. The queue orders unparks; it does not control admission.
struct WaitQueue {
    head: Atomic<Waiter>,
    tail: Atomic<Waiter>,
}

impl WaitQueue {
    fn new() -> Self {
        let queue = Self {
            head: Atomic::null(),
            tail: Atomic::null(),
        };
        // Sentinel; already retired so traversals skip it.
        let sentinel = Owned::new(Waiter::new(RETIRED)).into_shared(unsafe { epoch::unprotected() });
        queue.head.store(sentinel, Ordering::Relaxed);
        queue.tail.store(sentinel, Ordering::Relaxed);
        queue
    }

    /// Enqueue a node for the calling thread, returning a token the owner
    /// uses to identify its own entry.
    fn push(&self, guard: &Guard) -> *const Waiter {
        let node = Owned::new(Waiter::new(WAITING)).into_shared(guard);
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                // Stale tail; help it along.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed, guard);
                continue;
            }
            if tail_ref
                .next
                .compare_exchange(Shared::null(), node, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed, guard);
                return node.as_raw();
            }
        }
    }

    /// First node still waiting, unlinking retired nodes encountered at the
    /// head along the way.
    fn first_waiting<'g>(&self, guard: &'g Guard) -> Option<&'g Waiter> {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, guard);
            let node = unsafe { next.as_ref() }?;
            if node.state.load(Ordering::Acquire) == WAITING {
                return Some(node);
            }
            let tail = self.tail.load(Ordering::Acquire, guard);
            if head == tail {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed, guard);
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                unsafe { guard.defer_destroy(head) };
            }
        }
    }

    fn is_front(&self, token: *const Waiter, guard: &Guard) -> bool {
        self.first_waiting(guard)
            .is_some_and(|node| ptr::eq(node, token))
    }

    fn front_thread(&self, guard: &Guard) -> Option<Thread> {
        self.first_waiting(guard).map(|node| node.thread.clone())
    }

    fn unpark_waiters(&self, guard: &Guard) {
        let head = self.head.load(Ordering::Acquire, guard);
        let mut current = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { current.as_ref() } {
            if node.state.load(Ordering::Acquire) == WAITING {
                node.thread.unpark();
            }
            current = node.next.load(Ordering::Acquire, guard);
        }
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let next = current.deref().next.load(Ordering::Relaxed, guard);
                drop(current.into_owned());
                current = next;
            }
        }
    }
}

/// A non-fair and non-reentrant lock.
///
/// A single lock bit is acquired by compare-and-swap independently of queue
/// position, so any caller may barge in the instant the bit is free. Losers
/// enqueue themselves and park; `unlock` unparks the queue front, which
/// re-attempts the swap and proceeds only if it is both at the front and
/// wins. The lock is cancellable (one-shot, for pool shutdown) and every
/// blocking entry point honors [thread interruption](crate::interrupt), with
/// interruption taking precedence over cancellation.
///
/// Not reentrant: a thread that locks twice deadlocks by contract.
///
/// # Examples
///
/// ```
/// use sealpool::Mutex;
/// use std::time::Duration;
///
/// let mutex = Mutex::new();
/// mutex.lock().unwrap();
/// assert!(!mutex.try_lock(Duration::ZERO, true).unwrap());
/// mutex.unlock();
/// assert!(mutex.try_lock(Duration::ZERO, true).unwrap());
/// ```
pub struct Mutex {
    locked: AtomicBool,
    cancelled: AtomicBool,
    waiters: WaitQueue,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            waiters: WaitQueue::new(),
        }
    }

    /// Acquire the lock, parking until it is available.
    ///
    /// Fails with [`PoolError::Interrupted`] if the calling thread is or
    /// becomes interrupted (consuming the flag), and with
    /// [`PoolError::Cancelled`] if the mutex is or becomes cancelled.
    pub fn lock(&self) -> PoolResult<()> {
        if interrupt::take_interrupted() {
            return Err(PoolError::Interrupted);
        }
        if self.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        if self.try_acquire() {
            return Ok(());
        }
        let acquired = self.await_lock(None, true)?;
        debug_assert!(acquired, "indefinite wait must acquire the lock");
        Ok(())
    }

    /// Attempt to acquire the lock within `timeout`.
    ///
    /// A zero timeout never blocks. Returns `Ok(true)` on acquisition,
    /// `Ok(false)` on timeout; fails as [`lock`](Self::lock) does, except
    /// that cancellation is only observed when `cancellable` is true.
    /// (Negative timeouts are unrepresentable with [`Duration`].)
    pub fn try_lock(&self, timeout: Duration, cancellable: bool) -> PoolResult<bool> {
        if interrupt::take_interrupted() {
            return Err(PoolError::Interrupted);
        }
        if cancellable && self.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        self.await_lock(Some(timeout), cancellable)
    }

    /// Release the lock and unpark the queue front. The front is not
    /// guaranteed to be the next holder; barging is permitted.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
        let guard = epoch::pin();
        if let Some(thread) = self.waiters.front_thread(&guard) {
            thread.unpark();
        }
    }

    /// Cancel the mutex, permanently. Returns true only for the call that
    /// performed the cancellation. All waiters are best-effort unparked so
    /// they can observe the cancellation without waiting out a timeout.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.attempt_unpark_waiters();
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Best effort to unpark every waiting thread.
    pub fn attempt_unpark_waiters(&self) {
        let guard = epoch::pin();
        self.waiters.unpark_waiters(&guard);
    }

    /// Run `f` under the lock if it can be acquired immediately, ignoring
    /// interruption and cancellation. Used by eviction passes, which must
    /// stay opportunistic and must keep working on a cancelled pool.
    pub fn with_try_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.try_acquire() {
            return None;
        }
        let _unlock = UnlockOnDrop(self);
        Some(f())
    }

    /// Run `f` under the lock if it can be acquired within `timeout`.
    pub fn with_try_lock_for<R>(
        &self,
        timeout: Duration,
        cancellable: bool,
        f: impl FnOnce() -> R,
    ) -> PoolResult<Option<R>> {
        if self.try_lock(timeout, cancellable)? {
            let _unlock = UnlockOnDrop(self);
            Ok(Some(f()))
        } else {
            Ok(None)
        }
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Park until the lock is acquired, the timeout elapses, or the wait is
    /// aborted. `timeout` of `None` waits indefinitely; zero never parks.
    /// Every wake re-attempts acquisition, and only the queue front that
    /// also wins the lock bit proceeds.
    fn await_lock(&self, timeout: Option<Duration>, cancellable: bool) -> PoolResult<bool> {
        let token = {
            let guard = epoch::pin();
            self.waiters.push(&guard)
        };
        let deadline = timeout.map(|interval| Instant::now() + interval);
        let mut remaining = timeout;
        loop {
            let at_front = {
                let guard = epoch::pin();
                self.waiters.is_front(token, &guard)
            };
            if at_front && self.try_acquire() {
                unsafe { Waiter::retire(token) };
                return Ok(true);
            }
            match timeout {
                None => thread::park(),
                Some(interval) if interval.is_zero() => {
                    self.remove_waiter_notifying_next(token);
                    return Ok(false);
                }
                Some(_) => thread::park_timeout(remaining.unwrap_or_default()),
            }
            if interrupt::take_interrupted() {
                self.remove_waiter_notifying_next(token);
                return Err(PoolError::Interrupted);
            }
            if cancellable && self.is_cancelled() {
                self.remove_waiter_notifying_next(token);
                return Err(PoolError::Cancelled);
            }
            if let Some(deadline) = deadline {
                // Zero timeouts have already returned; recompute what is
                // left so spurious wake-ups never extend the wait.
                let now = Instant::now();
                if now >= deadline {
                    self.remove_waiter_notifying_next(token);
                    return Ok(false);
                }
                remaining = Some(deadline - now);
            }
        }
    }

    /// Retire the caller's own node; if it was the queue front, pass the
    /// wake-up on so `unlock`'s unpark is not lost with us.
    fn remove_waiter_notifying_next(&self, token: *const Waiter) {
        let guard = epoch::pin();
        let was_front = self.waiters.is_front(token, &guard);
        unsafe { Waiter::retire(token) };
        if was_front {
            if let Some(thread) = self.waiters.front_thread(&guard) {
                thread.unpark();
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

struct UnlockOnDrop<'a>(&'a Mutex);

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}
