//! Pool contracts and tier assembly

use std::sync::Arc;

use crate::common::CommonObjectPool;
use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::scheduler::EvictionScheduler;
use crate::single::SingleObjectPool;
use crate::tiered::TieredObjectPool;

/// Eviction aggressiveness. Exposed to memory-pressure collaborators: an
/// OS-level low-memory callback calls [`ObjectPool::clear`] with `High` on
/// severe pressure and `Low` on mild pressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    High,
}

pub(crate) fn is_high(priority: Option<Priority>) -> bool {
    matches!(priority, Some(Priority::High))
}

/// Capability contract every resource placed in a pool must satisfy.
///
/// While idle the pool owns the object exclusively, which is why the
/// mutating hooks take `&mut self`.
pub trait PooledObject<K>: Send {
    /// True if this instance may serve as a pool's unique primary resource.
    fn is_primary(&self) -> bool;

    /// Generation marker written by the pool on every return. Not
    /// application-visible; implementors just store it.
    fn tag(&self) -> bool;

    fn set_tag(&mut self, tag: bool);

    /// Identity/affinity predicate against a borrower key.
    fn matches(&self, key: &K) -> bool;

    /// Best-effort hook to shed caches and buffers without destroying the
    /// resource.
    fn release_memory(&mut self);
}

/// Creates and destroys pooled resources.
///
/// Creation failures must leave the factory usable; the pools roll back
/// their own bookkeeping and may retry. `close` flags the factory closed and
/// must tolerate repeated calls; subsequent destruction failures surface
/// from [`destroy_object`](Self::destroy_object).
pub trait ObjectFactory: Send + Sync {
    type Object;

    fn make_object(&self) -> PoolResult<Self::Object>;

    fn make_primary_object(&self) -> PoolResult<Self::Object>;

    fn destroy_object(&self, obj: Self::Object) -> PoolResult<()>;

    fn close(&self);
}

/// Common surface of both pool tiers.
pub trait ObjectPool<K, T>: Send + Sync {
    /// Borrow a resource, blocking until one is available.
    fn borrow_object(&self) -> PoolResult<T>;

    /// Borrow a resource, preferring one whose
    /// [`matches`](PooledObject::matches) holds for `key`.
    fn borrow_object_matching(&self, key: &K) -> PoolResult<T>;

    /// Return a borrowed resource. Never fails due to the calling thread's
    /// interruption state; losing a returned resource would leak it.
    fn return_object(&self, obj: T) -> PoolResult<()>;

    /// Asynchronously trigger an eviction pass at the given priority.
    fn clear(&self, priority: Priority);

    /// Close the pool, destroying idle resources. Idempotent, never blocks
    /// indefinitely, and completes even on an interrupted thread.
    fn close(&self) -> PoolResult<()>;
}

/// Assemble a tiered pool from a factory and configuration.
///
/// With `max_total == 1` the single primary pool serves both tiers;
/// otherwise a common pool with `max_total - 1` capacity is paired with the
/// single pool as its spillover partner.
pub fn create_object_pool<K, T>(
    factory: Arc<dyn ObjectFactory<Object = T>>,
    scheduler: Arc<EvictionScheduler>,
    configuration: PoolConfiguration,
) -> PoolResult<TieredObjectPool<K, T>>
where
    K: 'static,
    T: PooledObject<K> + 'static,
{
    if configuration.max_total < 1 {
        return Err(PoolError::Configuration(
            "pool configuration must allow at least one object",
        ));
    }
    let single = SingleObjectPool::new(
        Arc::clone(&factory),
        Arc::clone(&scheduler),
        configuration.eviction_delay_millis,
        configuration.eviction_interval_millis,
    );
    Ok(match configuration.max_total {
        1 => TieredObjectPool::new(Arc::clone(&single), single),
        _ => {
            let common = CommonObjectPool::new(
                factory,
                scheduler,
                configuration.with_max_total(configuration.max_total - 1),
                Arc::clone(&single),
            )?;
            TieredObjectPool::new(single, common)
        }
    })
}
