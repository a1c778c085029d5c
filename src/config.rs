//! Pool configuration options

/// Configuration for a tiered pool's capacity and eviction cadence.
///
/// Immutable for the pool's lifetime; it is `Copy` so tests and the tier
/// assembly in [`create_object_pool`](crate::create_object_pool) can derive
/// adjusted copies.
///
/// # Examples
///
/// ```
/// use sealpool::PoolConfiguration;
///
/// let config = PoolConfiguration::new(5_000, 20_000, 4);
///
/// assert_eq!(config.max_total, 4);
/// assert_eq!(config.with_max_total(1).max_total, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfiguration {
    /// Delay before the first scheduled eviction pass, in milliseconds.
    pub eviction_delay_millis: u64,

    /// Time between scheduled eviction passes, in milliseconds. Negative
    /// disables periodic eviction entirely; eviction then only runs through
    /// explicit [`clear`](crate::ObjectPool::clear) calls or on close.
    pub eviction_interval_millis: i64,

    /// Maximum number of live objects the pool may hold. Must be at least 1.
    pub max_total: usize,
}

impl PoolConfiguration {
    pub const fn new(
        eviction_delay_millis: u64,
        eviction_interval_millis: i64,
        max_total: usize,
    ) -> Self {
        Self {
            eviction_delay_millis,
            eviction_interval_millis,
            max_total,
        }
    }

    /// Derive a copy with a different capacity.
    pub const fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }

    /// Derive a copy with a different eviction cadence.
    pub const fn with_eviction_interval_millis(mut self, interval_millis: i64) -> Self {
        self.eviction_interval_millis = interval_millis;
        self
    }
}

impl Default for PoolConfiguration {
    /// Matches the cadence a single-writer embedded database client uses:
    /// one connection, evicted after roughly 20 seconds of idleness.
    fn default() -> Self {
        Self {
            eviction_delay_millis: 5_000,
            eviction_interval_millis: 20_000,
            max_total: 1,
        }
    }
}
