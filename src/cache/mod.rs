// src/cache/mod.rs

//! Client-side caching (component C5): [`store::CacheStore`] holds the
//! single-flight `(key, cmd) -> CacheEntry` map a wire consults before
//! issuing a cacheable command, and [`binary`] is the flat encoding used when
//! a cached entry's raw bytes are requested directly.

pub mod binary;
pub mod store;

pub use store::{cache_key, CacheKey, CacheStore, Flight};
