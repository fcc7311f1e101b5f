// src/lib.rs

//! An async client for Redis-compatible servers: automatic pipelining over a
//! bounded ring queue, optional RESP3 client-side caching, and routing across
//! standalone, replica-aware, sentinel, and cluster topologies behind one
//! façade type.

pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod pool;
pub mod resp;
pub mod retry;
pub mod ring;
pub mod wire;

pub use client::Client;
pub use command::{Cacheable, CacheableTtl, Command};
pub use config::{Address, ClientOptions, Mode};
pub use error::{Error, Result, ServerError};
pub use resp::{Message, Value};
