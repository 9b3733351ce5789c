#![forbid(unsafe_code)]
//! silt — page cache and transaction engine for a distributed document
//! store's storage layer.
//!
//! The cache mediates all access to persistent blocks: it keeps page
//! versions in memory, coordinates concurrent readers and writers per
//! block with snapshot isolation, bounds memory through eviction, and
//! groups writes into transactions flushed to a pluggable block
//! serializer in causally consistent order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use silt::{Access, CacheOptions, PageCache};
//! use silt::serializer::HeapSerializer;
//!
//! # fn main() -> silt::Result<()> {
//! let store = Arc::new(HeapSerializer::open("blocks.heap", 4096)?);
//! let cache = PageCache::new(store, CacheOptions::default())?;
//!
//! let txn = cache.begin();
//! let (block, mut lease) = txn.create();
//! lease.write()?.fill(0x42);
//! drop(lease);
//! txn.commit()?;
//!
//! let txn = cache.begin();
//! let lease = txn.acquire(block, Access::Read);
//! assert!(lease.read()?.iter().all(|&b| b == 0x42));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod io;
pub mod serializer;
pub mod signal;
pub mod types;

pub use crate::cache::{
    Access, BlockLease, CacheBalancer, CacheOptions, CacheStats, PageCache, PageView,
    PageWriteGuard, Transaction,
};
pub use crate::error::{CacheError, Result};
pub use crate::types::{BlockId, Recency};
