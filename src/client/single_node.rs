// src/client/single_node.rs

//! Single-node routing (component C7): one shared, lazily-reconnected wire
//! that every `Do`/`DoMulti`/`DoCache`/`DoMultiCache`/`DoStream` call
//! multiplexes onto, plus a small pool held in reserve for `Dedicate`.
//! Grounded on the teacher's `WardenClient` methods (`exec_command`/
//! `exec_raw_command`: acquire, run, release, classify the error, maybe
//! retry) for the retry shape, and on redis-rs's `aio::ConnectionManager`
//! for the single-flight lazy-reconnect behind the shared wire.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::Flight;
use crate::command::{Cacheable, CacheableTtl, Command};
use crate::config::{Address, ClientOptions};
use crate::error::Error;
use crate::pool::Pool;
use crate::resp::{Message, Value};
use crate::retry::RetryPolicy;
use crate::wire::Wire;

/// Routes every command to a single address. `Do`/`DoMulti`/`DoCache`/
/// `DoMultiCache`/`DoStream` all enqueue onto one long-lived shared
/// [`Wire`], so concurrent callers actually share its ring and coalesce
/// into the same pipelined writes; `pool` is reserved for `Dedicate`,
/// which needs a wire nobody else is multiplexing onto.
pub struct SingleNodeRouter {
    addr: Address,
    opts: ClientOptions,
    wire: parking_lot::RwLock<Arc<Wire>>,
    reconnect: tokio::sync::Mutex<()>,
    pool: Arc<Pool>,
    retry: RetryPolicy,
    cache_ttl: Duration,
}

impl SingleNodeRouter {
    pub async fn connect(addr: Address, opts: ClientOptions) -> Result<Self, Error> {
        let wire = Arc::new(Wire::connect(&addr, &opts).await?);
        let retry = RetryPolicy {
            max_retries: opts.max_retries,
            min_backoff: opts.min_retry_backoff,
            max_backoff: opts.max_retry_backoff,
        };
        let cache_ttl = opts.cache_ttl;
        let pool = Arc::new(Pool::new(addr.clone(), opts.clone()));
        Ok(SingleNodeRouter {
            addr,
            opts,
            wire: parking_lot::RwLock::new(wire),
            reconnect: tokio::sync::Mutex::new(()),
            pool,
            retry,
            cache_ttl,
        })
    }

    /// Returns the shared pipelining wire, redialing it first if it has
    /// closed. The `reconnect` lock makes redialing single-flight: once one
    /// caller notices a closed wire and starts dialing, everyone else who
    /// notices the same thing waits on that dial instead of racing their own,
    /// mirroring the lazy-reconnect shape of redis-rs's `ConnectionManager`.
    async fn wire(&self) -> Result<Arc<Wire>, Error> {
        let current = self.wire.read().clone();
        if !current.is_closed() {
            return Ok(current);
        }
        let _guard = self.reconnect.lock().await;
        let current = self.wire.read().clone();
        if !current.is_closed() {
            return Ok(current);
        }
        let fresh = Arc::new(Wire::connect(&self.addr, &self.opts).await?);
        *self.wire.write() = fresh.clone();
        Ok(fresh)
    }

    /// `Do`: sends one command, retrying per `RetryPolicy` on transient errors.
    pub async fn route(&self, cmd: Command) -> Result<Message, Error> {
        let mut attempt = 0;
        loop {
            let wire = self.wire().await?;
            let result = wire.do_one(cmd.clone()).await;

            match result.and_then(|m| m.into_result()) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    let Some(backoff) = self.retry.should_retry(attempt, &cmd, &e, None) else {
                        return Err(e);
                    };
                    debug!("retrying after a transient error on attempt {attempt}: {e}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// `DoMulti`: one contiguous pipelined run, enqueued onto the shared wire
    /// alongside whatever other callers are concurrently doing the same.
    pub async fn route_multi(&self, cmds: Vec<Command>) -> Result<Vec<Message>, Error> {
        let wire = self.wire().await?;
        wire.do_multi(cmds).await
    }

    /// `DoCache`: the client-side-caching read path (spec §4.5). A cache hit
    /// never touches the wire; a miss issues `CLIENT CACHING YES` followed by
    /// the real command on the same wire so the server's tracking table
    /// associates the read with this connection, then feeds the reply back
    /// into the store so concurrent single-flight waiters resolve too. Both
    /// the flight check and the populate always run against the one shared
    /// wire, so the single-flight guarantee holds across every concurrent
    /// caller instead of only those who happen to land on the same pool wire.
    pub async fn route_cached(&self, cacheable: Cacheable, ttl: Duration) -> Result<Message, Error> {
        let ttl = if ttl.is_zero() { self.cache_ttl } else { ttl };
        let cmd = cacheable.command().clone();

        let wire = self.wire().await?;
        match wire.cache().flight(&cmd, ttl) {
            Flight::Hit(msg) => return Ok(msg),
            Flight::Pending(rx) => return rx.await?,
            Flight::Miss => {}
        }

        self.fetch_and_populate(&wire, &cmd).await
    }

    /// `DoMultiCache`: the pipelined form of [`Self::route_cached`], one entry
    /// per [`CacheableTtl`], all served from (or populated onto) the same
    /// shared wire so their single-flight registrations race on a consistent
    /// view.
    pub async fn route_multi_cached(&self, entries: Vec<CacheableTtl>) -> Result<Vec<Message>, Error> {
        let wire = self.wire().await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let ttl = if entry.ttl.is_zero() { self.cache_ttl } else { entry.ttl };
            let cmd = entry.cacheable.command().clone();
            let msg = match wire.cache().flight(&cmd, ttl) {
                Flight::Hit(msg) => Ok(msg),
                Flight::Pending(rx) => rx.await.unwrap_or_else(|e| Err(Error::from(e))),
                Flight::Miss => self.fetch_and_populate(&wire, &cmd).await,
            };
            out.push(msg);
        }
        out.into_iter().collect()
    }

    async fn fetch_and_populate(&self, wire: &Wire, cmd: &Command) -> Result<Message, Error> {
        let result = wire
            .do_multi(vec![Command::new(["CLIENT", "CACHING", "YES"]), cmd.clone()])
            .await
            .map(|mut replies| replies.pop().unwrap())
            .and_then(|m| m.into_result());

        match result {
            Ok(msg) => {
                wire.cache().update(cmd, msg.clone());
                Ok(msg)
            }
            Err(e) => {
                wire.cache().cancel(cmd, e.clone());
                Err(e)
            }
        }
    }

    /// `DoStream`: issues `cmd` on the shared wire and writes the decoded
    /// reply into `sink` without the caller
    /// needing a `Message` handle. Only string/integer/double top-level
    /// replies are supported, per spec §4.7; anything else (arrays, maps,
    /// errors) fails with [`Error::UnsupportedStreamType`]. The reply is
    /// still fully decoded by the RESP codec before streaming begins — true
    /// incremental streaming of a single oversized bulk string is left open,
    /// same as the teacher's `Framed` transport never exposes partial frames.
    pub async fn route_stream(&self, cmd: Command, sink: &mut dyn Write) -> Result<usize, Error> {
        let wire = self.wire().await?;
        let result = wire.do_one(cmd).await;

        let msg = result?.into_result()?;
        let bytes = match &msg.value {
            Value::SimpleString(b) | Value::BlobString(b) | Value::BigNumber(b) => b.clone(),
            Value::VerbatimString { data, .. } => data.clone(),
            Value::Integer(i) => i.to_string().into_bytes().into(),
            Value::Double(d) => d.into_inner().to_string().into_bytes().into(),
            other => return Err(Error::UnsupportedStreamType(format!("{other:?}"))),
        };
        sink.write_all(&bytes).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(bytes.len())
    }

    /// `Dedicate`: hands the caller a single wire checked out of the pool for
    /// exclusive use (transactions, `WATCH`, blocking commands), along with a
    /// guard that returns it when dropped. Deliberately bypasses the shared
    /// pipelining wire above — a dedicated wire's whole point is that nobody
    /// else is multiplexing commands onto it while it's borrowed.
    pub async fn dedicate(&self) -> Result<DedicatedWire, Error> {
        let wire = self.pool.acquire().await?;
        Ok(DedicatedWire::new(wire, self.pool.clone()))
    }

    pub async fn close(&self, err: Error) {
        self.wire.read().close(err.clone());
        self.pool.close_all(err).await;
    }

    pub fn nodes(&self) -> Vec<Address> {
        vec![self.addr.clone()]
    }
}

/// A wire checked out for exclusive use; returned to the pool on drop.
pub struct DedicatedWire {
    wire: Option<Arc<Wire>>,
    pool: Arc<Pool>,
}

impl DedicatedWire {
    pub(crate) fn new(wire: Arc<Wire>, pool: Arc<Pool>) -> Self {
        DedicatedWire { wire: Some(wire), pool }
    }

    pub fn get(&self) -> &Wire {
        self.wire.as_deref().expect("DedicatedWire used after release")
    }
}

impl Drop for DedicatedWire {
    fn drop(&mut self) {
        if let Some(wire) = self.wire.take() {
            let pool = self.pool.clone();
            // Pool::release is async but Drop is not; spawn the return so the
            // wire still reaches the idle list instead of leaking its permit.
            tokio::spawn(async move { pool.release(wire).await });
        }
    }
}
