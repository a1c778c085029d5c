//! Pool of a single primary resource

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::errors::{PoolError, PoolResult};
use crate::mutex::Mutex;
use crate::pools::{is_high, ObjectFactory, ObjectPool, PooledObject, Priority};
use crate::scheduler::{EvictionScheduler, ScheduledTask};

/// Manages exactly one shared primary resource behind a [`Mutex`].
///
/// Borrowing locks the mutex and lazily creates the resource; the lock is
/// held for the entire checkout and released by
/// [`return_object`](Self::return_object), possibly on a different thread.
/// Eviction is opportunistic: every pass takes the mutex with a zero-wait
/// attempt and simply skips a checked-out resource. An idle resource
/// survives one full eviction interval before it becomes eligible (the
/// can-evict flag is armed by the pass that spares it).
pub struct SingleObjectPool<K, T> {
    factory: Arc<dyn ObjectFactory<Object = T>>,
    scheduler: Arc<EvictionScheduler>,
    eviction_delay_millis: u64,
    eviction_interval_millis: i64,
    mutex: Mutex,
    state: UnsafeCell<State<T>>,
    weak: Weak<Self>,
    _key: PhantomData<fn(&K)>,
}

// `state` is only touched while holding `mutex`.
unsafe impl<K, T: Send> Send for SingleObjectPool<K, T> {}
unsafe impl<K, T: Send> Sync for SingleObjectPool<K, T> {}

struct State<T> {
    obj: Option<T>,
    can_evict: bool,
    task: Option<ScheduledTask>,
}

impl<K, T> SingleObjectPool<K, T>
where
    K: 'static,
    T: PooledObject<K> + 'static,
{
    pub fn new(
        factory: Arc<dyn ObjectFactory<Object = T>>,
        scheduler: Arc<EvictionScheduler>,
        eviction_delay_millis: u64,
        eviction_interval_millis: i64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            factory,
            scheduler,
            eviction_delay_millis,
            eviction_interval_millis,
            mutex: Mutex::new(),
            state: UnsafeCell::new(State {
                obj: None,
                can_evict: false,
                task: None,
            }),
            weak: weak.clone(),
            _key: PhantomData,
        })
    }

    /// Borrow the primary resource, blocking until the current holder
    /// returns it.
    pub fn borrow_object(&self) -> PoolResult<T> {
        self.mutex.lock().map_err(cancelled_as_closed)?;
        self.acquire_object()
    }

    /// Zero-wait borrow; `Ok(None)` if the resource is checked out. Used by
    /// the common pool's spillover path.
    pub fn borrow_object_or_null(&self) -> PoolResult<Option<T>> {
        if self
            .mutex
            .try_lock(Duration::ZERO, true)
            .map_err(cancelled_as_closed)?
        {
            self.acquire_object().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Return the borrowed resource, releasing the mutex. Completes even on
    /// an interrupted thread; if the pool closed during the checkout, the
    /// resource is destroyed after the mutex is released.
    pub fn return_object(&self, obj: T) -> PoolResult<()> {
        // The caller still holds the mutex from its borrow.
        let state = unsafe { self.state() };
        state.can_evict = false;
        state.obj = Some(obj);
        if self.is_closed() {
            self.process_close_then_unlock()
        } else {
            self.mutex.unlock();
            Ok(())
        }
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

    /// Close the pool. One-shot; later borrows fail fast and the resource is
    /// destroyed through the same opportunistic eviction path, here or on
    /// the outstanding borrow's return.
    pub fn close(&self) -> PoolResult<()> {
        if !self.mutex.cancel() {
            return Ok(());
        }
        debug!("closing single object pool");
        self.evict(None)
    }

    pub(crate) fn evict(&self, priority: Option<Priority>) -> PoolResult<()> {
        let removed = if self.is_closed() {
            let removed = self.mutex.with_try_lock(|| {
                self.factory.close();
                unsafe { self.evictions(None) }
            });
            self.mutex.attempt_unpark_waiters();
            removed
        } else if is_high(priority) {
            self.mutex.with_try_lock(|| unsafe { self.evictions(priority) })
        } else {
            self.mutex.with_try_lock_for(Duration::ZERO, false, || unsafe {
                if priority.is_some() {
                    if let Some(obj) = self.state().obj.as_mut() {
                        obj.release_memory();
                    }
                }
                self.evictions(priority)
            })?
        };
        if let Some(Some(obj)) = removed {
            debug!("destroying evicted primary object");
            self.factory.destroy_object(obj)?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.mutex.is_cancelled()
    }

    /// Caller must hold `mutex`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut State<T> {
        &mut *self.state.get()
    }

    /// Caller holds `mutex`; on factory failure the mutex is released and
    /// the pool is left empty rather than partially constructed.
    fn acquire_object(&self) -> PoolResult<T> {
        let state = unsafe { self.state() };
        if let Some(obj) = state.obj.take() {
            return Ok(obj);
        }
        state.can_evict = false;
        match self.factory.make_primary_object() {
            Ok(obj) => {
                debug!("created primary object");
                self.attempt_schedule_eviction(state);
                Ok(obj)
            }
            Err(error) => {
                self.mutex.unlock();
                Err(error)
            }
        }
    }

    /// Caller must hold `mutex`. Returns the resource to destroy, if any,
    /// and arms the can-evict flag after a pass that spares the resource.
    unsafe fn evictions(&self, priority: Option<Priority>) -> Option<T> {
        let state = self.state();
        let removed = if state.obj.is_some() && self.should_remove(state, priority) {
            self.cancel_scheduled_eviction(state);
            state.obj.take()
        } else {
            None
        };
        state.can_evict = state.can_evict || priority.is_none();
        removed
    }

    fn should_remove(&self, state: &State<T>, priority: Option<Priority>) -> bool {
        state.can_evict
            && (priority.is_some() || state.task.as_ref().is_some_and(|task| !task.is_cancelled()))
            || self.is_closed()
            || is_high(priority)
    }

    /// Caller must hold `mutex`.
    fn attempt_schedule_eviction(&self, state: &mut State<T>) {
        if self.eviction_interval_millis < 0 || self.is_closed() {
            return;
        }
        let weak = self.weak.clone();
        state.task = Some(self.scheduler.schedule_at_fixed_rate(
            Duration::from_millis(self.eviction_delay_millis),
            Duration::from_millis(self.eviction_interval_millis as u64),
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

    fn cancel_scheduled_eviction(&self, state: &mut State<T>) {
        if let Some(task) = state.task.take() {
            task.cancel();
        }
    }

    fn process_close_then_unlock(&self) -> PoolResult<()> {
        self.factory.close();
        let removed = unsafe { self.evictions(None) };
        self.mutex.unlock();
        if let Some(obj) = removed {
            self.factory.destroy_object(obj)?;
        }
        Ok(())
    }
}

impl<K, T> ObjectPool<K, T> for SingleObjectPool<K, T>
where
    K: 'static,
    T: PooledObject<K> + 'static,
{
    fn borrow_object(&self) -> PoolResult<T> {
        SingleObjectPool::borrow_object(self)
    }

    /// The single pool has only one resource; the key is irrelevant.
    fn borrow_object_matching(&self, _key: &K) -> PoolResult<T> {
        SingleObjectPool::borrow_object(self)
    }

    fn return_object(&self, obj: T) -> PoolResult<()> {
        SingleObjectPool::return_object(self, obj)
    }

    fn clear(&self, priority: Priority) {
        SingleObjectPool::clear(self, priority)
    }

    fn close(&self) -> PoolResult<()> {
        SingleObjectPool::close(self)
    }
}

fn cancelled_as_closed(error: PoolError) -> PoolError {
    match error {
        PoolError::Cancelled => PoolError::Closed,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    struct TestObject {
        id: usize,
        tag: bool,
        released: Arc<AtomicUsize>,
    }

    impl PooledObject<String> for TestObject {
        fn is_primary(&self) -> bool {
            true
        }

        fn tag(&self) -> bool {
            self.tag
        }

        fn set_tag(&mut self, tag: bool) {
            self.tag = tag;
        }

        fn matches(&self, _key: &String) -> bool {
            true
        }

        fn release_memory(&mut self) {
            self.released.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[derive(Default)]
    struct TestFactory {
        made: AtomicUsize,
        destroyed: AtomicUsize,
        released: Arc<AtomicUsize>,
        fail_next: AtomicBool,
    }

    impl ObjectFactory for TestFactory {
        type Object = TestObject;

        fn make_object(&self) -> PoolResult<TestObject> {
            self.make_primary_object()
        }

        fn make_primary_object(&self) -> PoolResult<TestObject> {
            if self.fail_next.swap(false, Ordering::AcqRel) {
                return Err(PoolError::factory("injected creation failure"));
            }
            Ok(TestObject {
                id: self.made.fetch_add(1, Ordering::AcqRel),
                tag: false,
                released: Arc::clone(&self.released),
            })
        }

        fn destroy_object(&self, _obj: TestObject) -> PoolResult<()> {
            self.destroyed.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn close(&self) {}
    }

    fn pool_with(
        interval_millis: i64,
    ) -> (Arc<SingleObjectPool<String, TestObject>>, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::default());
        let scheduler = Arc::new(EvictionScheduler::new().unwrap());
        let pool = SingleObjectPool::new(
            Arc::clone(&factory) as Arc<dyn ObjectFactory<Object = TestObject>>,
            scheduler,
            60_000,
            interval_millis,
        );
        (pool, factory)
    }

    #[test]
    fn same_object() {
        let (pool, _) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        let id = obj.id;
        pool.return_object(obj).unwrap();
        let obj = pool.borrow_object().unwrap();
        assert_eq!(id, obj.id);
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn early_initial_eviction_fails() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        let id = obj.id;
        pool.return_object(obj).unwrap();
        pool.evict(None).unwrap();
        assert_eq!(0, factory.destroyed.load(Ordering::Acquire));
        let obj = pool.borrow_object().unwrap();
        assert_eq!(id, obj.id);
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn new_object_after_successful_eviction() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        let id = obj.id;
        pool.return_object(obj).unwrap();
        pool.evict(None).unwrap();
        pool.evict(None).unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
        let obj = pool.borrow_object().unwrap();
        assert_ne!(id, obj.id);
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn eviction_with_negative_interval_fails() {
        let (pool, factory) = pool_with(-1);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.evict(None).unwrap();
        pool.evict(None).unwrap();
        assert_eq!(0, factory.destroyed.load(Ordering::Acquire));
    }

    #[test]
    fn eviction_skips_borrowed_object() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.evict(None).unwrap();
        pool.evict(Some(Priority::High)).unwrap();
        assert_eq!(0, factory.destroyed.load(Ordering::Acquire));
        let id = obj.id;
        pool.return_object(obj).unwrap();
        let obj = pool.borrow_object().unwrap();
        assert_eq!(id, obj.id);
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn borrow_or_null() {
        let (pool, _) = pool_with(60_000);
        let obj = pool.borrow_object_or_null().unwrap();
        assert!(obj.is_some());
        pool.return_object(obj.unwrap()).unwrap();
    }

    #[test]
    fn borrow_or_null_is_null_while_borrowed() {
        let (pool, _) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        assert!(pool.borrow_object_or_null().unwrap().is_none());
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn throws_on_borrow_after_close() {
        let (pool, _) = pool_with(60_000);
        pool.close().unwrap();
        assert!(matches!(pool.borrow_object(), Err(PoolError::Closed)));
    }

    #[test]
    fn borrow_close_then_return() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.close().unwrap();
        assert_eq!(0, factory.destroyed.load(Ordering::Acquire));
        pool.return_object(obj).unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
    }

    #[test]
    fn close_destroys() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.close().unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
        pool.close().unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
    }

    #[test]
    fn close_preserves_interrupt() {
        let (pool, _) = pool_with(60_000);
        interrupt::current().interrupt();
        pool.close().unwrap();
        assert!(interrupt::is_interrupted());
        assert!(interrupt::take_interrupted());
    }

    #[test]
    fn close_unblocks_waiting_borrower() {
        let (pool, _) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || waiter_pool.borrow_object());
        thread::sleep(Duration::from_millis(100));
        pool.close().unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(PoolError::Closed)));
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn return_on_interrupted_thread_completes() {
        let (pool, _) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        interrupt::current().interrupt();
        pool.return_object(obj).unwrap();
        assert!(interrupt::is_interrupted());
        // The pending interrupt is consumed by the next borrow attempt.
        assert!(matches!(pool.borrow_object(), Err(PoolError::Interrupted)));
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn return_on_another_thread() {
        let (pool, _) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        let returner = Arc::clone(&pool);
        thread::spawn(move || returner.return_object(obj).unwrap())
            .join()
            .unwrap();
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn borrow_can_be_interrupted() {
        let (pool, _) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        let (tx, rx) = mpsc::channel();
        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            tx.send(interrupt::current()).unwrap();
            waiter_pool.borrow_object()
        });
        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.interrupt();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(PoolError::Interrupted)
        ));
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn borrow_recovers_from_creation_failure() {
        let (pool, factory) = pool_with(60_000);
        factory.fail_next.store(true, Ordering::Release);
        assert!(matches!(pool.borrow_object(), Err(PoolError::Factory(_))));
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn scheduled_eviction_replaces_idle_object() {
        let factory = Arc::new(TestFactory::default());
        let scheduler = Arc::new(EvictionScheduler::new().unwrap());
        let pool = SingleObjectPool::new(
            Arc::clone(&factory) as Arc<dyn ObjectFactory<Object = TestObject>>,
            scheduler,
            0,
            50,
        );
        let obj = pool.borrow_object().unwrap();
        let id = obj.id;
        pool.return_object(obj).unwrap();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
        let obj = pool.borrow_object().unwrap();
        assert_ne!(id, obj.id);
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn clear_high_priority_evicts_idle() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.evict(Some(Priority::High)).unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
    }

    #[test]
    fn clear_low_priority_keeps_idle() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.evict(Some(Priority::Low)).unwrap();
        assert_eq!(0, factory.destroyed.load(Ordering::Acquire));
    }

    #[test]
    fn clear_low_priority_after_eviction_attempt_clears_idle() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.evict(None).unwrap();
        pool.evict(Some(Priority::Low)).unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
    }

    #[test]
    fn clear_low_priority_releases_memory() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.evict(Some(Priority::Low)).unwrap();
        assert_eq!(1, factory.released.load(Ordering::Acquire));
        assert_eq!(0, factory.destroyed.load(Ordering::Acquire));
    }

    #[test]
    fn clear_runs_asynchronously() {
        let (pool, factory) = pool_with(60_000);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.clear(Priority::High);
        for _ in 0..100 {
            if factory.destroyed.load(Ordering::Acquire) == 1 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("clear never evicted the idle object");
    }

    #[test]
    fn concurrent_access() {
        let (pool, factory) = pool_with(-1);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let obj = pool.borrow_object().unwrap();
                    pool.return_object(obj).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(1, factory.made.load(Ordering::Acquire));
        assert_eq!(0, factory.destroyed.load(Ordering::Acquire));
    }
}
