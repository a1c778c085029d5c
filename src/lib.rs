//! # sealpool
//!
//! Tiered, thread-safe object pool for the expensive, native-backed
//! connection resources beneath an encrypted embedded-database client.
//!
//! ## Features
//!
//! - A hand-built barging [`Mutex`]: non-fair, non-reentrant, cancellable,
//!   with a lock-free intrusive wait queue
//! - A [`SingleObjectPool`] for the one privileged primary resource and a
//!   [`CommonObjectPool`] for up to N interchangeable secondary resources
//! - A [`TieredObjectPool`] facade routing between the two, with spillover
//!   from the common pool into the idle primary slot
//! - Generational (two-chance) eviction: an idle resource survives one full
//!   eviction interval before it becomes eligible for destruction
//! - Memory-pressure hooks: [`ObjectPool::clear`] with a [`Priority`] drives
//!   `release_memory` and eviction aggressiveness
//! - Cooperative [`interrupt`]ion honored at every blocking point, with
//!   interrupt-proof returns so no resource is ever lost
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use sealpool::{
//!     create_object_pool, EvictionScheduler, ObjectFactory, PoolConfiguration,
//!     PoolResult, PooledObject, Priority,
//! };
//!
//! struct Connection {
//!     name: String,
//!     primary: bool,
//!     tag: bool,
//! }
//!
//! impl PooledObject<String> for Connection {
//!     fn is_primary(&self) -> bool {
//!         self.primary
//!     }
//!     fn tag(&self) -> bool {
//!         self.tag
//!     }
//!     fn set_tag(&mut self, tag: bool) {
//!         self.tag = tag;
//!     }
//!     fn matches(&self, key: &String) -> bool {
//!         self.name == *key
//!     }
//!     fn release_memory(&mut self) {}
//! }
//!
//! struct ConnectionFactory;
//!
//! impl ObjectFactory for ConnectionFactory {
//!     type Object = Connection;
//!
//!     fn make_object(&self) -> PoolResult<Connection> {
//!         Ok(Connection { name: "secondary".into(), primary: false, tag: false })
//!     }
//!     fn make_primary_object(&self) -> PoolResult<Connection> {
//!         Ok(Connection { name: "primary".into(), primary: true, tag: false })
//!     }
//!     fn destroy_object(&self, _obj: Connection) -> PoolResult<()> {
//!         Ok(())
//!     }
//!     fn close(&self) {}
//! }
//!
//! # fn main() -> PoolResult<()> {
//! let scheduler = Arc::new(EvictionScheduler::new().unwrap());
//! let pool = create_object_pool::<String, _>(
//!     Arc::new(ConnectionFactory) as Arc<dyn ObjectFactory<Object = Connection>>,
//!     scheduler,
//!     PoolConfiguration::new(0, -1, 4),
//! )?;
//!
//! let conn = pool.borrow_object()?;
//! pool.return_object(conn)?;
//! pool.clear(Priority::Low); // mild memory pressure
//! pool.close()?;
//! # Ok(())
//! # }
//! ```

mod common;
mod config;
mod errors;
pub mod interrupt;
mod mutex;
mod pools;
mod scheduler;
mod single;
mod tiered;

pub use common::CommonObjectPool;
pub use config::PoolConfiguration;
pub use errors::{PoolError, PoolResult};
pub use mutex::Mutex;
pub use pools::{create_object_pool, ObjectFactory, ObjectPool, PooledObject, Priority};
pub use scheduler::{EvictionScheduler, ScheduledTask};
pub use single::SingleObjectPool;
pub use tiered::TieredObjectPool;
