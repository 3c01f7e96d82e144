//! Named cache partitions and the strategies that read and fill them.
//!
//! This module provides:
//! - Request identity keys (method + URL) for stored responses
//! - A partition store trait with a SQLite implementation
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - Background refreshes that never block the response already returned

mod key;
mod layer;
mod storage;
mod traits;

pub use key::RequestKey;
pub use layer::CacheLayer;
pub(crate) use storage::parse_datetime;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheSource, Served};
