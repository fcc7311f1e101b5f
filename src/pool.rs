// src/pool.rs

//! The connection pool (component C4): a bounded, LIFO pool of idle
//! [`Wire`]s per address, with idle reaping and a waiter queue for callers
//! that arrive when the pool is at capacity. Grounded on the pool-of-workers
//! shape in `examples/other_examples/19370489_clawde-io-apps__daemon-src-perf-connection_pool.rs.rs`
//! (a `PoolConfig` with dial/reconnect/heartbeat tunables, state behind a
//! lock, connections created lazily up to `pool_size`), adapted from
//! multiplexed WebSocket streams to pipelined RESP wires: here every wire
//! already pipelines internally, so the pool's only job is deciding *which*
//! wire a caller's command goes to.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::config::{Address, ClientOptions};
use crate::error::Error;
use crate::wire::Wire;

struct Idle {
    wire: Arc<Wire>,
    returned_at: Instant,
}

struct PoolState {
    idle: VecDeque<Idle>,
    total: usize,
}

/// A pool of wires to one address. `pool_size` bounds how many concurrent
/// wires this pool will ever create; callers beyond that block on the
/// [`Semaphore`] until one is returned (spec §6 `PoolTimeout`).
pub struct Pool {
    addr: Address,
    opts: ClientOptions,
    state: Mutex<PoolState>,
    permits: Semaphore,
}

impl Pool {
    pub fn new(addr: Address, opts: ClientOptions) -> Self {
        let pool_size = opts.pool_size.max(1);
        Pool {
            addr,
            opts,
            state: Mutex::new(PoolState { idle: VecDeque::new(), total: 0 }),
            permits: Semaphore::new(pool_size),
        }
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// Acquires a wire, reusing the most recently returned idle one (LIFO, so
    /// a warm wire whose TCP buffers/TLS session are still hot is preferred
    /// over a colder one), dialing a new wire if none is idle and the pool
    /// has not yet reached `pool_size`, or waiting up to `pool_timeout`
    /// otherwise.
    pub async fn acquire(&self) -> Result<Arc<Wire>, Error> {
        let permit = tokio::time::timeout(self.opts.pool_timeout, self.permits.acquire())
            .await
            .map_err(|_| Error::PoolTimeout)?
            .map_err(|_| Error::closed("pool semaphore closed"))?;
        permit.forget();

        loop {
            let candidate = {
                let mut state = self.state.lock().await;
                state.idle.pop_back()
            };
            match candidate {
                Some(idle) if !idle.wire.is_closed() => return Ok(idle.wire),
                Some(_closed) => {
                    let mut state = self.state.lock().await;
                    state.total -= 1;
                    continue;
                }
                None => break,
            }
        }

        let wire = Arc::new(Wire::connect(&self.addr, &self.opts).await.map_err(|e| {
            self.permits.add_permits(1);
            e
        })?);
        self.state.lock().await.total += 1;
        Ok(wire)
    }

    /// Returns a wire to the idle list for reuse, or drops it (and its permit
    /// stays consumed, shrinking the effective pool) if it is already closed.
    pub async fn release(&self, wire: Arc<Wire>) {
        if wire.is_closed() {
            let mut state = self.state.lock().await;
            state.total = state.total.saturating_sub(1);
            self.permits.add_permits(1);
            return;
        }
        self.state.lock().await.idle.push_back(Idle { wire, returned_at: Instant::now() });
        self.permits.add_permits(1);
    }

    /// Drops idle wires that have sat unused past `idle_timeout` (spec §6
    /// `IdleTimeout`). Intended to run on a periodic tick owned by the client
    /// façade, mirroring the teacher's heartbeat-interval tunable.
    pub async fn reap_idle(&self) {
        let mut state = self.state.lock().await;
        let idle_timeout = self.opts.idle_timeout;
        let before = state.idle.len();
        state.idle.retain(|entry| entry.returned_at.elapsed() < idle_timeout);
        let reaped = before - state.idle.len();
        state.total -= reaped;
        drop(state);
        if reaped > 0 {
            debug!("reaped {reaped} idle wire(s) for {}", self.addr);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.total
    }

    pub async fn close_all(&self, err: Error) {
        let mut state = self.state.lock().await;
        for idle in state.idle.drain(..) {
            idle.wire.close(err.clone());
        }
        state.total = 0;
    }
}

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);
