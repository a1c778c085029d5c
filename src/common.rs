//! Bounded pool of interchangeable secondary resources

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::interrupt;
use crate::pools::{is_high, ObjectFactory, ObjectPool, PooledObject, Priority};
use crate::scheduler::{EvictionScheduler, ScheduledTask};
use crate::single::SingleObjectPool;

/// Manages up to `max_total` interchangeable resources, spilling over into
/// the paired [`SingleObjectPool`] when exhausted rather than blocking while
/// the primary resource sits idle.
///
/// Returns push to the front of the idle set and borrows pop from the back,
/// so idle resources cycle in FIFO order and eviction scans the cold end
/// first. Each idle resource carries the generation tag it was returned
/// under; a non-priority eviction pass removes resources whose tag has gone
/// stale and then flips the pool's tag, giving everything returned since the
/// previous pass one full interval of grace.
pub struct CommonObjectPool<K, T> {
    factory: Arc<dyn ObjectFactory<Object = T>>,
    scheduler: Arc<EvictionScheduler>,
    configuration: PoolConfiguration,
    other_pool: Arc<SingleObjectPool<K, T>>,
    is_closed: AtomicBool,
    inner: Mutex<Inner<T>>,
    weak: Weak<Self>,
    _key: PhantomData<fn(&K)>,
}

struct Inner<T> {
    idle: VecDeque<T>,
    count: usize,
    task: Option<ScheduledTask>,
    tag: bool,
    sleepers: VecDeque<Sleeper>,
}

/// One blocked borrower. FIFO admission: signals pop from the front, and a
/// sleeper that wakes without being signalled re-parks without losing its
/// place.
#[derive(Clone)]
struct Sleeper {
    thread: Thread,
    notified: Arc<AtomicBool>,
}

impl<K, T> CommonObjectPool<K, T>
where
    K: 'static,
    T: PooledObject<K> + 'static,
{
    pub fn new(
        factory: Arc<dyn ObjectFactory<Object = T>>,
        scheduler: Arc<EvictionScheduler>,
        configuration: PoolConfiguration,
        other_pool: Arc<SingleObjectPool<K, T>>,
    ) -> PoolResult<Arc<Self>> {
        if configuration.max_total < 1 {
            return Err(PoolError::Configuration(
                "pool configuration must allow at least one object",
            ));
        }
        Ok(Arc::new_cyclic(|weak| Self {
            factory,
            scheduler,
            configuration,
            other_pool,
            is_closed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                count: 0,
                task: None,
                tag: false,
                sleepers: VecDeque::new(),
            }),
            weak: weak.clone(),
            _key: PhantomData,
        }))
    }

    pub fn borrow_object(&self) -> PoolResult<T> {
        self.internal_borrow_object(|_| None)
    }

    pub fn borrow_object_matching(&self, key: &K) -> PoolResult<T> {
        self.internal_borrow_object(|inner| {
            inner
                .idle
                .iter()
                .position(|obj| obj.matches(key))
                .and_then(|index| inner.idle.remove(index))
        })
    }

    fn internal_borrow_object(
        &self,
        preferred: impl Fn(&mut Inner<T>) -> Option<T>,
    ) -> PoolResult<T> {
        if interrupt::take_interrupted() {
            return Err(PoolError::Interrupted);
        }
        let mut guard = self.inner.lock();
        while !self.is_closed() {
            if let Some(obj) = preferred(&mut guard) {
                return Ok(obj);
            }
            if let Some(obj) = guard.idle.pop_back() {
                return Ok(obj);
            }
            if guard.count < self.configuration.max_total {
                guard.count += 1;
                self.attempt_schedule_eviction(&mut guard);
                drop(guard);
                return match self.factory.make_object() {
                    Ok(obj) => {
                        debug!("created secondary object");
                        Ok(obj)
                    }
                    Err(error) => {
                        // A failed creation must never strand capacity.
                        let mut guard = self.inner.lock();
                        guard.count -= 1;
                        Self::signal(&mut guard);
                        Err(error)
                    }
                };
            }
            if let Some(obj) = self.other_pool.borrow_object_or_null()? {
                return Ok(obj);
            }
            loop {
                self.await_available(&mut guard)?;
                if self.is_closed()
                    || !(guard.idle.is_empty() && guard.count == self.configuration.max_total)
                {
                    break;
                }
            }
        }
        Err(PoolError::Closed)
    }

    /// Tag the resource with the current generation and make it available to
    /// one waiter. Never fails due to the calling thread's interruption
    /// state; a close that raced the checkout triggers the final eviction.
    pub fn return_object(&self, mut obj: T) -> PoolResult<()> {
        {
            let mut guard = self.inner.lock();
            let tag = guard.tag;
            obj.set_tag(tag);
            guard.idle.push_front(obj);
            Self::signal(&mut guard);
        }
        if self.is_closed() {
            self.evict(None)?;
        }
        Ok(())
    }

    /// Trigger an eviction pass at the given priority on the scheduler.
    pub fn clear(&self, priority: Priority) {
        let weak = self.weak.clone();
        self.scheduler.execute(move || {
            if let Some(pool) = weak.upgrade() {
                if let Err(error) = pool.evict(Some(priority)) {
                    warn!("priority eviction failed: {error}");
                }
            }
        });
    }

    /// Close the pool: unblock waiters, then destroy everything idle.
    /// Idempotent; outstanding borrows may still be returned.
    pub fn close(&self) -> PoolResult<()> {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing common object pool");
        if let Some(mut guard) = self.inner.try_lock() {
            Self::signal_all(&mut guard);
        }
        self.evict(None)
    }

    pub(crate) fn evict(&self, priority: Option<Priority>) -> PoolResult<()> {
        let removed;
        {
            // High-priority and close-path passes may barge; the scheduled
            // pass takes the zero-wait slot so it never competes with
            // borrowers.
            let guard = if self.is_closed() || is_high(priority) {
                self.inner.try_lock()
            } else {
                self.inner.try_lock_for(Duration::ZERO)
            };
            let Some(mut guard) = guard else {
                return Ok(());
            };
            if self.is_closed() {
                self.factory.close();
                Self::signal_all(&mut guard);
            }
            if guard.count == 0 {
                Self::cancel_scheduled_eviction(&mut guard);
                return Ok(());
            }
            if priority.is_some() {
                // Memory-pressure hook, applied even to survivors.
                for obj in guard.idle.iter_mut().rev() {
                    obj.release_memory();
                }
            }
            removed = self.evictions(&mut guard, priority);
        }
        self.destroy_each(removed)
    }

    fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Remove qualifying resources from the cold end of the idle set,
    /// stopping at the first survivor; the idle set is tag-sorted by
    /// construction. Flips the generation tag after a non-priority pass.
    fn evictions(&self, guard: &mut Inner<T>, priority: Option<Priority>) -> Vec<T> {
        let mut removed = Vec::new();
        while self.should_remove_last(guard, priority) {
            if let Some(obj) = guard.idle.pop_back() {
                guard.count -= 1;
                Self::signal(guard);
                removed.push(obj);
            }
        }
        if priority.is_none() {
            guard.tag = !guard.tag;
        }
        removed
    }

    fn should_remove_last(&self, guard: &Inner<T>, priority: Option<Priority>) -> bool {
        let Some(obj) = guard.idle.back() else {
            return false;
        };
        let stale = obj.tag() != guard.tag;
        stale
            && (priority.is_some()
                || guard.task.as_ref().is_some_and(|task| !task.is_cancelled()))
            || self.is_closed()
            || is_high(priority)
    }

    /// Destroy outside the lock; every destruction is attempted and the
    /// first failure is re-raised afterwards.
    fn destroy_each(&self, objects: Vec<T>) -> PoolResult<()> {
        let mut first_error = None;
        for obj in objects {
            if let Err(error) = self.factory.destroy_object(obj) {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn attempt_schedule_eviction(&self, guard: &mut Inner<T>) {
        if guard.task.as_ref().is_some_and(|task| !task.is_cancelled())
            || self.configuration.eviction_interval_millis < 0
            || self.is_closed()
        {
            return;
        }
        let weak = self.weak.clone();
        guard.task = Some(self.scheduler.schedule_at_fixed_rate(
            Duration::from_millis(self.configuration.eviction_delay_millis),
            Duration::from_millis(self.configuration.eviction_interval_millis as u64),
            move || match weak.upgrade() {
                Some(pool) => {
                    if let Err(error) = pool.evict(None) {
                        warn!("scheduled eviction failed: {error}");
                    }
                    true
                }
                None => false,
            },
        ));
    }

    fn cancel_scheduled_eviction(guard: &mut Inner<T>) {
        if let Some(task) = guard.task.take() {
            task.cancel();
        }
    }

    /// Block until signalled. FIFO and spurious-wakeup safe; on
    /// interruption the sleeper withdraws, forwarding any signal it had
    /// already consumed so no wake-up is lost.
    fn await_available(&self, guard: &mut MutexGuard<'_, Inner<T>>) -> PoolResult<()> {
        let sleeper = Sleeper {
            thread: thread::current(),
            notified: Arc::new(AtomicBool::new(false)),
        };
        guard.sleepers.push_back(sleeper.clone());
        loop {
            let mut interrupted = false;
            MutexGuard::unlocked(guard, || {
                thread::park();
                interrupted = interrupt::take_interrupted();
            });
            if interrupted {
                let position = guard
                    .sleepers
                    .iter()
                    .position(|entry| Arc::ptr_eq(&entry.notified, &sleeper.notified));
                match position {
                    Some(index) => {
                        guard.sleepers.remove(index);
                    }
                    None => Self::signal(guard),
                }
                return Err(PoolError::Interrupted);
            }
            if sleeper.notified.load(Ordering::Acquire) {
                return Ok(());
            }
        }
    }

    fn signal(guard: &mut Inner<T>) {
        if let Some(sleeper) = guard.sleepers.pop_front() {
            sleeper.notified.store(true, Ordering::Release);
            sleeper.thread.unpark();
        }
    }

    fn signal_all(guard: &mut Inner<T>) {
        while let Some(sleeper) = guard.sleepers.pop_front() {
            sleeper.notified.store(true, Ordering::Release);
            sleeper.thread.unpark();
        }
    }
}

impl<K, T> ObjectPool<K, T> for CommonObjectPool<K, T>
where
    K: 'static,
    T: PooledObject<K> + 'static,
{
    fn borrow_object(&self) -> PoolResult<T> {
        CommonObjectPool::borrow_object(self)
    }

    fn borrow_object_matching(&self, key: &K) -> PoolResult<T> {
        CommonObjectPool::borrow_object_matching(self, key)
    }

    fn return_object(&self, obj: T) -> PoolResult<()> {
        CommonObjectPool::return_object(self, obj)
    }

    fn clear(&self, priority: Priority) {
        CommonObjectPool::clear(self, priority)
    }

    fn close(&self) -> PoolResult<()> {
        CommonObjectPool::close(self)
    }
}
