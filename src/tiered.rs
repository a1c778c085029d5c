//! Routing facade over the two pool tiers

use std::sync::Arc;

use crate::errors::PoolResult;
use crate::pools::{ObjectPool, PooledObject, Priority};
use crate::single::SingleObjectPool;

/// Routes borrow, return and clear calls to the primary
/// ([`SingleObjectPool`]) or secondary pool. Carries no state of its own;
/// returns are routed by the resource's own
/// [`is_primary`](PooledObject::is_primary) flag.
pub struct TieredObjectPool<K, T> {
    primary_pool: Arc<SingleObjectPool<K, T>>,
    secondary_pool: Arc<dyn ObjectPool<K, T>>,
}

impl<K, T> TieredObjectPool<K, T>
where
    K: 'static,
    T: PooledObject<K> + 'static,
{
    pub(crate) fn new(
        primary_pool: Arc<SingleObjectPool<K, T>>,
        secondary_pool: Arc<dyn ObjectPool<K, T>>,
    ) -> Self {
        Self {
            primary_pool,
            secondary_pool,
        }
    }

    pub fn borrow_object(&self) -> PoolResult<T> {
        self.secondary_pool.borrow_object()
    }

    pub fn borrow_object_matching(&self, key: &K) -> PoolResult<T> {
        self.secondary_pool.borrow_object_matching(key)
    }

    pub fn borrow_primary_object(&self) -> PoolResult<T> {
        self.primary_pool.borrow_object()
    }

    pub fn return_object(&self, obj: T) -> PoolResult<()> {
        if obj.is_primary() {
            self.primary_pool.return_object(obj)
        } else {
            self.secondary_pool.return_object(obj)
        }
    }

    /// Fan an eviction request out to both tiers.
    pub fn clear(&self, priority: Priority) {
        self.primary_pool.clear(priority);
        self.secondary_pool.clear(priority);
    }

    /// Close both tiers, primary first. The secondary is always closed; the
    /// first error wins.
    pub fn close(&self) -> PoolResult<()> {
        let primary = self.primary_pool.close();
        let secondary = self.secondary_pool.close();
        primary.and(secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfiguration;
    use crate::errors::{PoolError, PoolResult};
    use crate::pools::{create_object_pool, ObjectFactory};
    use crate::scheduler::EvictionScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestObject {
        id: usize,
        primary: bool,
        tag: bool,
    }

    impl PooledObject<String> for TestObject {
        fn is_primary(&self) -> bool {
            self.primary
        }

        fn tag(&self) -> bool {
            self.tag
        }

        fn set_tag(&mut self, tag: bool) {
            self.tag = tag;
        }

        fn matches(&self, key: &String) -> bool {
            self.id.to_string() == *key
        }

        fn release_memory(&mut self) {}
    }

    #[derive(Default)]
    struct TestFactory {
        made: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl ObjectFactory for TestFactory {
        type Object = TestObject;

        fn make_object(&self) -> PoolResult<TestObject> {
            Ok(TestObject {
                id: self.made.fetch_add(1, Ordering::AcqRel),
                primary: false,
                tag: false,
            })
        }

        fn make_primary_object(&self) -> PoolResult<TestObject> {
            self.make_object().map(|mut obj| {
                obj.primary = true;
                obj
            })
        }

        fn destroy_object(&self, _obj: TestObject) -> PoolResult<()> {
            self.destroyed.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn close(&self) {}
    }

    fn tiered_with(
        max_total: usize,
    ) -> (TieredObjectPool<String, TestObject>, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::default());
        let scheduler = Arc::new(EvictionScheduler::new().unwrap());
        let pool = create_object_pool(
            Arc::clone(&factory) as Arc<dyn ObjectFactory<Object = TestObject>>,
            scheduler,
            PoolConfiguration::new(60_000, 60_000, max_total),
        )
        .unwrap();
        (pool, factory)
    }

    #[test]
    fn rejects_zero_capacity() {
        let factory = Arc::new(TestFactory::default());
        let scheduler = Arc::new(EvictionScheduler::new().unwrap());
        assert!(matches!(
            create_object_pool::<String, TestObject>(
                factory as Arc<dyn ObjectFactory<Object = TestObject>>,
                scheduler,
                PoolConfiguration::new(60_000, 60_000, 0),
            ),
            Err(PoolError::Configuration(_))
        ));
    }

    #[test]
    fn routes_by_primariness() {
        let (pool, _) = tiered_with(4);
        let primary = pool.borrow_primary_object().unwrap();
        assert!(primary.is_primary());
        let secondary = pool.borrow_object().unwrap();
        assert!(!secondary.is_primary());
        pool.return_object(primary).unwrap();
        pool.return_object(secondary).unwrap();
        // Both tiers accept a fresh borrow after the routed returns.
        let primary = pool.borrow_primary_object().unwrap();
        let secondary = pool.borrow_object().unwrap();
        pool.return_object(secondary).unwrap();
        pool.return_object(primary).unwrap();
    }

    #[test]
    fn keyed_borrow_reaches_secondary_pool() {
        let (pool, _) = tiered_with(4);
        let obj = pool.borrow_object().unwrap();
        let key = obj.id.to_string();
        pool.return_object(obj).unwrap();
        let obj = pool.borrow_object_matching(&key).unwrap();
        assert_eq!(key, obj.id.to_string());
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn degenerate_tier_shares_the_single_pool() {
        let (pool, _) = tiered_with(1);
        let obj = pool.borrow_object().unwrap();
        assert!(obj.is_primary());
        pool.return_object(obj).unwrap();
        let obj = pool.borrow_primary_object().unwrap();
        assert!(obj.is_primary());
        pool.return_object(obj).unwrap();
    }

    #[test]
    fn close_fans_out_and_is_idempotent() {
        let (pool, factory) = tiered_with(4);
        let primary = pool.borrow_primary_object().unwrap();
        let secondary = pool.borrow_object().unwrap();
        pool.return_object(primary).unwrap();
        pool.return_object(secondary).unwrap();
        pool.close().unwrap();
        assert_eq!(2, factory.destroyed.load(Ordering::Acquire));
        pool.close().unwrap();
        assert_eq!(2, factory.destroyed.load(Ordering::Acquire));
        assert!(matches!(pool.borrow_object(), Err(PoolError::Closed)));
        assert!(matches!(
            pool.borrow_primary_object(),
            Err(PoolError::Closed)
        ));
    }

    #[test]
    fn degenerate_tier_close_is_idempotent() {
        let (pool, factory) = tiered_with(1);
        let obj = pool.borrow_object().unwrap();
        pool.return_object(obj).unwrap();
        pool.close().unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
        pool.close().unwrap();
        assert_eq!(1, factory.destroyed.load(Ordering::Acquire));
    }
}
