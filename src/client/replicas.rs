// src/client/replicas.rs

//! Standalone-with-replicas routing (component C10): one fixed primary plus a
//! static list of read replicas, no failover discovery. Readonly commands
//! round-robin across the replicas (falling back to the primary if none are
//! configured or all are down); everything else goes to the primary.
//! Grounded on the single-node client's pool-per-address shape, generalized
//! to more than one address the way the teacher's `ReplicaHandler` treats a
//! replica connection as "another client connection, just fed from the
//! replication stream" rather than inventing a parallel code path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::Flight;
use crate::client::single_node::DedicatedWire;
use crate::command::{Cacheable, CacheableTtl, Command};
use crate::config::{Address, ClientOptions};
use crate::error::Error;
use crate::pool::Pool;
use crate::resp::Message;
use crate::retry::RetryPolicy;
use crate::wire::Wire;

pub struct ReplicaSetRouter {
    primary: Arc<Pool>,
    replicas: Vec<Arc<Pool>>,
    next_replica: AtomicUsize,
    retry: RetryPolicy,
    cache_ttl: Duration,
}

impl ReplicaSetRouter {
    pub fn new(primary: Address, replicas: Vec<Address>, opts: ClientOptions) -> Self {
        let cache_ttl = opts.cache_ttl;
        ReplicaSetRouter {
            primary: Arc::new(Pool::new(primary, opts.clone())),
            replicas: replicas.into_iter().map(|addr| Arc::new(Pool::new(addr, opts.clone()))).collect(),
            next_replica: AtomicUsize::new(0),
            retry: RetryPolicy::default(),
            cache_ttl,
        }
    }

    fn pick_pool(&self, cmd: &Command) -> &Arc<Pool> {
        if cmd.readonly() && !self.replicas.is_empty() {
            let idx = self.next_replica.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
            &self.replicas[idx]
        } else {
            &self.primary
        }
    }

    pub async fn route(&self, cmd: Command) -> Result<Message, Error> {
        let mut attempt = 0;
        loop {
            let pool = self.pick_pool(&cmd).clone();
            let wire = pool.acquire().await?;
            let result = wire.do_one(cmd.clone()).await;
            pool.release(wire).await;

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

    /// `DoMulti`: always sent to the primary as one contiguous run so a
    /// transaction-shaped batch never splits across replicas.
    pub async fn route_multi(&self, cmds: Vec<Command>) -> Result<Vec<Message>, Error> {
        let wire = self.primary.acquire().await?;
        let result = wire.do_multi(cmds).await;
        self.primary.release(wire).await;
        result
    }

    /// `DoCache`, always against the primary: a replica's own cache tracking
    /// registration would be invalidated independently of the primary's
    /// write stream, so CSC entries are only ever kept on the writable node.
    pub async fn route_cached_via_primary(
        &self,
        cacheable: Cacheable,
        ttl: Duration,
    ) -> Result<Message, Error> {
        let ttl = if ttl.is_zero() { self.cache_ttl } else { ttl };
        let cmd = cacheable.command().clone();

        let wire = self.primary.acquire().await?;
        let result = match wire.cache().flight(&cmd, ttl) {
            Flight::Hit(msg) => Ok(msg),
            Flight::Pending(rx) => rx.await.unwrap_or_else(|e| Err(Error::from(e))),
            Flight::Miss => self.fetch_and_populate(&wire, &cmd).await,
        };
        self.primary.release(wire).await;
        result
    }

    pub async fn route_multi_cached_via_primary(
        &self,
        entries: Vec<CacheableTtl>,
    ) -> Result<Vec<Message>, Error> {
        let wire = self.primary.acquire().await?;
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
        self.primary.release(wire).await;
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

    /// `Dedicate`: always borrows a primary-pool wire, since a replica
    /// connection cannot accept writes or participate in `WATCH`/`MULTI`.
    pub async fn dedicate(&self) -> Result<DedicatedWire, Error> {
        let wire = self.primary.acquire().await?;
        Ok(DedicatedWire::new(wire, self.primary.clone()))
    }

    pub async fn close(&self, err: Error) {
        self.primary.close_all(err.clone()).await;
        for replica in &self.replicas {
            replica.close_all(err.clone()).await;
        }
    }

    pub fn nodes(&self) -> Vec<Address> {
        std::iter::once(self.primary.addr().clone())
            .chain(self.replicas.iter().map(|p| p.addr().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(replica_count: usize) -> ReplicaSetRouter {
        let primary = Address::Tcp { host: "primary".into(), port: 6379 };
        let replicas = (0..replica_count)
            .map(|i| Address::Tcp { host: format!("replica-{i}"), port: 6379 })
            .collect();
        ReplicaSetRouter::new(primary, replicas, ClientOptions::default())
    }

    #[test]
    fn readonly_commands_round_robin_across_replicas() {
        let r = router(3);
        let picks: Vec<String> = (0..6)
            .map(|_| r.pick_pool(&Command::new(["GET", "k"])).addr().to_string())
            .collect();
        assert_eq!(
            picks,
            vec!["replica-0:6379", "replica-1:6379", "replica-2:6379", "replica-0:6379", "replica-1:6379", "replica-2:6379"]
        );
    }

    #[test]
    fn write_commands_always_go_to_the_primary() {
        let r = router(2);
        for _ in 0..4 {
            assert_eq!(r.pick_pool(&Command::new(["SET", "k", "v"])).addr().to_string(), "primary:6379");
        }
    }

    #[test]
    fn readonly_commands_fall_back_to_primary_with_no_replicas() {
        let r = router(0);
        assert_eq!(r.pick_pool(&Command::new(["GET", "k"])).addr().to_string(), "primary:6379");
    }
}
