//! A concurrent, lazily populated key-value cache.
//!
//! The [`LazyCache`] constructs missing values on demand through a caller-supplied constructor
//! and does request coalescing: any number of concurrent lookups for the same missing key share
//! a single construction. Entries can optionally expire after a fixed idle lifetime, and an
//! [`on_delete`](LazyCacheBuilder::on_delete) hook lets callers clean up values (close
//! connections, release resources) once they leave the cache.
//!
//! ```no_run
//! # async fn example() {
//! use std::time::Duration;
//!
//! let cache: lazycache::LazyCache<String, String, lazycache::Error> =
//!     lazycache::LazyCache::new(Duration::from_secs(10));
//!
//! let value = cache
//!     .get_or_construct("key".to_owned(), |key| async move { Ok(format!("value for {key}")) })
//!     .await;
//! # }
//! ```

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

mod cache;
mod config;
mod error;

pub use cache::*;
pub use config::CacheConfig;
pub use error::Error;
