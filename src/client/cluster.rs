// src/client/cluster.rs

//! The cluster router (component C8): hash-slot routing, `MOVED`/`ASK`
//! redirect handling, and slot-map refresh via `CLUSTER SHARDS`.
//!
//! The slot hashing algorithm (CRC16 of the `{...}` hash tag or the whole
//! key, mod 16384) is copied verbatim from the teacher's
//! `core/cluster/slot.rs::get_slot`. The node/flag/epoch bookkeeping in the
//! teacher's `core/cluster/state.rs::ClusterState` is server-side gossip
//! machinery this client has no use for; a client only needs a read-mostly
//! `slot -> (primary, replicas)` table, rebuilt wholesale on refresh rather
//! than mutated slot-by-slot, so it is modeled as one RCU-style
//! `parking_lot::RwLock<Arc<SlotMap>>` instead of the teacher's per-slot
//! `[RwLock<Option<String>>; NUM_SLOTS]` array.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use bytes::Bytes;
use crc::{Crc, CRC_16_USB};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::client::single_node::DedicatedWire;
use crate::command::Command;
use crate::config::{Address, ClientOptions};
use crate::error::{Error, ServerError};
use crate::pool::Pool;
use crate::resp::Message;
use crate::retry::RetryPolicy;

pub const NUM_SLOTS: usize = 16384;
const SLOT_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);

/// Computes the hash slot for `key`: CRC16 of its `{hash tag}` if present,
/// otherwise of the whole key, mod 16384.
pub fn slot_for_key(key: &Bytes) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}') {
            let end = start + 1 + end_offset;
            if end > start + 1 {
                return SLOT_CRC.checksum(&key[start + 1..end]) % (NUM_SLOTS as u16);
            }
        }
    }
    SLOT_CRC.checksum(key) % (NUM_SLOTS as u16)
}

#[derive(Debug, Clone)]
struct Shard {
    primary: Address,
    replicas: Vec<Address>,
}

/// An immutable snapshot of the cluster's slot ownership. Refreshing the
/// topology builds a new one and swaps it in atomically; readers never see a
/// partially updated map.
#[derive(Debug, Default)]
struct SlotMap {
    slot_to_shard: Vec<Option<u32>>,
    shards: Vec<Shard>,
}

impl SlotMap {
    fn shard_for_slot(&self, slot: u16) -> Option<&Shard> {
        self.slot_to_shard.get(slot as usize).copied().flatten().and_then(|i| self.shards.get(i as usize))
    }
}

/// Routes commands by hash slot across a Redis Cluster, following `MOVED`/
/// `ASK` redirects and refreshing the topology from `CLUSTER SHARDS` on a
/// debounced interval or whenever a redirect suggests the map is stale.
pub struct ClusterRouter {
    opts: ClientOptions,
    seeds: Vec<Address>,
    pools: DashMap<Address, Arc<Pool>>,
    slot_map: RwLock<Arc<SlotMap>>,
    retry: RetryPolicy,
    last_refresh: AsyncMutex<Option<Instant>>,
    refresh_interval: Duration,
}

impl ClusterRouter {
    pub async fn connect(seeds: Vec<Address>, opts: ClientOptions) -> Result<Self, Error> {
        let router = ClusterRouter {
            refresh_interval: opts.cluster_refresh_interval,
            opts,
            seeds,
            pools: DashMap::new(),
            slot_map: RwLock::new(Arc::new(SlotMap::default())),
            retry: RetryPolicy::default(),
            last_refresh: AsyncMutex::new(None),
        };
        router.refresh_topology().await?;
        Ok(router)
    }

    fn pool_for(&self, addr: &Address) -> Arc<Pool> {
        self.pools
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(Pool::new(addr.clone(), self.opts.clone())))
            .clone()
    }

    /// Fetches `CLUSTER SHARDS` from any reachable seed and rebuilds the slot
    /// map. Debounced by `cluster_refresh_interval` unless `force` is set
    /// (redirect-triggered refreshes bypass the debounce, since a `MOVED` is
    /// unambiguous evidence the map is stale).
    pub async fn refresh_topology(&self) -> Result<(), Error> {
        self.refresh_topology_inner(true).await
    }

    async fn maybe_refresh(&self) {
        {
            let last = self.last_refresh.lock().await;
            if let Some(last) = *last {
                if last.elapsed() < self.refresh_interval {
                    return;
                }
            }
        }
        let _ = self.refresh_topology_inner(false).await;
    }

    async fn refresh_topology_inner(&self, force: bool) -> Result<(), Error> {
        let _ = force;
        let mut last_err = None;
        let candidates: Vec<Address> = {
            let current = self.slot_map.read().clone();
            let mut addrs: Vec<Address> =
                current.shards.iter().flat_map(|s| std::iter::once(s.primary.clone())).collect();
            addrs.extend(self.seeds.iter().cloned());
            addrs
        };

        for addr in candidates {
            let pool = self.pool_for(&addr);
            let wire = match pool.acquire().await {
                Ok(w) => w,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let reply = wire.do_one(Command::new(["CLUSTER", "SHARDS"])).await;
            pool.release(wire).await;
            match reply.and_then(|m| m.into_result()) {
                Ok(msg) => match parse_cluster_shards(msg) {
                    Ok(map) => {
                        *self.slot_map.write() = Arc::new(map);
                        *self.last_refresh.lock().await = Some(Instant::now());
                        return Ok(());
                    }
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("no reachable cluster seed".into())))
    }

    /// Routes a single-key command, following up to `max_retries` redirects.
    pub async fn route(&self, cmd: Command) -> Result<Message, Error> {
        let Some(key) = cmd.primary_key() else {
            return Err(Error::Config("command has no routable key for cluster mode".into()));
        };
        let slot = slot_for_key(key);
        let use_replica = cmd.readonly() && self.opts.replica_only;

        let mut attempt = 0;
        let mut asking = false;
        let mut target = self.target_for_slot(slot, use_replica)?;

        loop {
            let pool = self.pool_for(&target);
            let wire = pool.acquire().await?;
            let to_send = if asking {
                wire.do_multi(vec![Command::new(["ASKING"]), cmd.clone()]).await.map(|mut r| r.pop().unwrap())
            } else {
                wire.do_one(cmd.clone()).await
            };
            pool.release(wire).await;

            match to_send.and_then(|m| m.into_result()) {
                Ok(msg) => return Ok(msg),
                Err(Error::Server(ServerError::Moved { slot: moved_slot, addr })) => {
                    debug!("MOVED {moved_slot} {addr}, refreshing topology");
                    asking = false;
                    let _ = self.refresh_topology_inner(true).await;
                    target = parse_addr(&addr)?;
                }
                Err(Error::Server(ServerError::Ask { addr, .. })) => {
                    asking = true;
                    target = parse_addr(&addr)?;
                }
                Err(e) if e.is_transient() => {
                    let Some(backoff) = self.retry.should_retry(attempt, &cmd, &e, None) else {
                        return Err(e);
                    };
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    if matches!(e, Error::Server(ServerError::ClusterDown(_))) {
                        let _ = self.refresh_topology_inner(true).await;
                    }
                    target = self.target_for_slot(slot, use_replica)?;
                }
                Err(e) => return Err(e),
            }

            if attempt > self.opts.max_retries + 2 {
                return Err(Error::Internal("exceeded cluster redirect budget".into()));
            }
        }
    }

    /// `DoMulti` across a cluster: groups commands by their target shard and
    /// fans the groups out concurrently, then reassembles replies in the
    /// caller's original order (spec §4.8 cross-slot `DoMulti`).
    pub async fn route_multi(&self, cmds: Vec<Command>) -> Result<Vec<Message>, Error> {
        self.maybe_refresh().await;
        let slot_map = self.slot_map.read().clone();

        let mut groups: HashMap<Address, Vec<(usize, Command)>> = HashMap::new();
        for (idx, cmd) in cmds.into_iter().enumerate() {
            let key = cmd
                .primary_key()
                .ok_or_else(|| Error::Config("DoMulti command has no routable key".into()))?;
            let slot = slot_for_key(key);
            let shard = slot_map
                .shard_for_slot(slot)
                .ok_or_else(|| Error::Internal(format!("no shard owns slot {slot}")))?;
            groups.entry(shard.primary.clone()).or_default().push((idx, cmd));
        }

        let futures = groups.into_iter().map(|(addr, indexed)| async move {
            let pool = self.pool_for(&addr);
            let wire = pool.acquire().await?;
            let (indices, cmds): (Vec<usize>, Vec<Command>) = indexed.into_iter().unzip();
            let replies = wire.do_multi(cmds).await;
            pool.release(wire).await;
            replies.map(|r| indices.into_iter().zip(r).collect::<Vec<_>>())
        });

        let grouped_results: Vec<Vec<(usize, Message)>> =
            futures::future::try_join_all(futures).await?;

        let mut out: Vec<Option<Message>> = vec![None; grouped_results.iter().map(|g| g.len()).sum()];
        for group in grouped_results {
            for (idx, msg) in group {
                if idx >= out.len() {
                    out.resize(idx + 1, None);
                }
                out[idx] = Some(msg);
            }
        }
        out.into_iter()
            .map(|m| m.ok_or_else(|| Error::Internal("missing reply in cluster fanout".into())))
            .collect()
    }

    fn target_for_slot(&self, slot: u16, use_replica: bool) -> Result<Address, Error> {
        let slot_map = self.slot_map.read();
        let shard = slot_map
            .shard_for_slot(slot)
            .ok_or_else(|| Error::Server(ServerError::ClusterDown(format!("slot {slot} is unassigned"))))?;
        if use_replica && !shard.replicas.is_empty() {
            let mut rng = rand::thread_rng();
            return Ok(shard.replicas.choose(&mut rng).cloned().unwrap_or_else(|| shard.primary.clone()));
        }
        Ok(shard.primary.clone())
    }

    /// `Dedicate`: borrows a wire to the primary owning `key`'s slot, or to
    /// an arbitrary seed if no key is given (a session-scoped `SUBSCRIBE`,
    /// for instance, is not tied to any one slot).
    pub async fn dedicate(&self, key: Option<&Bytes>) -> Result<DedicatedWire, Error> {
        let target = match key {
            Some(k) => self.target_for_slot(slot_for_key(k), false)?,
            None => self.seeds.first().cloned().ok_or_else(|| Error::Config("no cluster seeds configured".into()))?,
        };
        let pool = self.pool_for(&target);
        let wire = pool.acquire().await?;
        Ok(DedicatedWire::new(wire, pool))
    }

    pub async fn close(&self, err: Error) {
        for pool in self.pools.iter() {
            pool.close_all(err.clone()).await;
        }
    }

    pub fn nodes(&self) -> Vec<Address> {
        self.slot_map.read().shards.iter().map(|s| s.primary.clone()).collect()
    }
}

fn parse_addr(raw: &str) -> Result<Address, Error> {
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| Error::Protocol(format!("bad node address: {raw}")))?;
    let port = port.parse().map_err(|_| Error::Protocol(format!("bad node port: {raw}")))?;
    Ok(Address::Tcp { host: host.to_string(), port })
}

/// Parses a `CLUSTER SHARDS` reply: an array of per-shard maps, each with a
/// `slots` flat start/end array and a `nodes` array of per-node maps
/// (`ip`/`port`/`role`).
fn parse_cluster_shards(reply: Message) -> Result<SlotMap, Error> {
    let shards_reply = reply.into_array()?;
    let mut map = SlotMap { slot_to_shard: vec![None; NUM_SLOTS], shards: Vec::new() };

    for shard_msg in shards_reply {
        let shard_map = shard_msg.into_map()?;
        let slots_ranges = shard_map
            .get(&Bytes::from_static(b"slots"))
            .cloned()
            .ok_or_else(|| Error::Protocol("CLUSTER SHARDS entry missing 'slots'".into()))?
            .into_array()?;
        let nodes = shard_map
            .get(&Bytes::from_static(b"nodes"))
            .cloned()
            .ok_or_else(|| Error::Protocol("CLUSTER SHARDS entry missing 'nodes'".into()))?
            .into_array()?;

        let mut primary = None;
        let mut replicas = Vec::new();
        for node_msg in nodes {
            let node = node_msg.into_map()?;
            let ip = node
                .get(&Bytes::from_static(b"ip"))
                .cloned()
                .ok_or_else(|| Error::Protocol("cluster node missing 'ip'".into()))?
                .into_string()?;
            let port = node
                .get(&Bytes::from_static(b"port"))
                .cloned()
                .ok_or_else(|| Error::Protocol("cluster node missing 'port'".into()))?
                .into_i64()? as u16;
            let role = node
                .get(&Bytes::from_static(b"role"))
                .cloned()
                .map(|m| m.into_string())
                .transpose()?
                .unwrap_or_default();
            let addr = Address::Tcp { host: ip, port };
            if role == "master" || role == "primary" {
                primary = Some(addr);
            } else {
                replicas.push(addr);
            }
        }
        let Some(primary) = primary else {
            warn!("CLUSTER SHARDS entry has no primary node, skipping");
            continue;
        };

        let shard_idx = map.shards.len() as u32;
        map.shards.push(Shard { primary, replicas });

        let mut ranges = slots_ranges.into_iter();
        while let (Some(start), Some(end)) = (ranges.next(), ranges.next()) {
            let start = start.into_i64()? as usize;
            let end = end.into_i64()? as usize;
            for slot in start..=end.min(NUM_SLOTS - 1) {
                map.slot_to_shard[slot] = Some(shard_idx);
            }
        }
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tags_route_related_keys_to_the_same_slot() {
        let a = slot_for_key(&Bytes::from_static(b"user:{42}:profile"));
        let b = slot_for_key(&Bytes::from_static(b"user:{42}:settings"));
        assert_eq!(a, b);
    }

    #[test]
    fn slot_is_within_range() {
        let slot = slot_for_key(&Bytes::from_static(b"hello"));
        assert!((slot as usize) < NUM_SLOTS);
    }

    #[test]
    fn empty_hash_tag_falls_back_to_whole_key() {
        let with_empty_tag = slot_for_key(&Bytes::from_static(b"foo{}bar"));
        let whole_key = slot_for_key(&Bytes::from_static(b"foo{}bar"));
        assert_eq!(with_empty_tag, whole_key);
    }

    fn blob(s: &str) -> Message {
        Message::new(crate::resp::Value::BlobString(Bytes::copy_from_slice(s.as_bytes())))
    }

    fn int(n: i64) -> Message {
        Message::new(crate::resp::Value::Integer(n))
    }

    fn node_map(ip: &str, port: i64, role: &str) -> Message {
        Message::new(crate::resp::Value::Map(vec![
            (blob("ip"), blob(ip)),
            (blob("port"), int(port)),
            (blob("role"), blob(role)),
        ]))
    }

    fn shard_map(start: i64, end: i64, nodes: Vec<Message>) -> Message {
        Message::new(crate::resp::Value::Map(vec![
            (blob("slots"), Message::new(crate::resp::Value::Array(vec![int(start), int(end)]))),
            (blob("nodes"), Message::new(crate::resp::Value::Array(nodes))),
        ]))
    }

    #[test]
    fn parses_cluster_shards_into_a_full_slot_map() {
        let reply = Message::new(crate::resp::Value::Array(vec![shard_map(
            0,
            16383,
            vec![node_map("10.0.0.1", 6379, "master"), node_map("10.0.0.2", 6379, "replica")],
        )]));

        let map = parse_cluster_shards(reply).unwrap();
        assert_eq!(map.shards.len(), 1);
        assert_eq!(map.shards[0].primary, Address::Tcp { host: "10.0.0.1".into(), port: 6379 });
        assert_eq!(map.shards[0].replicas, vec![Address::Tcp { host: "10.0.0.2".into(), port: 6379 }]);
        assert!(map.shard_for_slot(0).is_some());
        assert!(map.shard_for_slot(16383).is_some());
    }

    #[test]
    fn shard_with_no_primary_node_is_skipped() {
        let reply = Message::new(crate::resp::Value::Array(vec![shard_map(
            0,
            100,
            vec![node_map("10.0.0.2", 6379, "replica")],
        )]));

        let map = parse_cluster_shards(reply).unwrap();
        assert!(map.shards.is_empty());
        assert!(map.shard_for_slot(0).is_none());
    }

    #[test]
    fn parse_addr_splits_host_and_port() {
        let addr = parse_addr("10.0.0.5:6380").unwrap();
        assert_eq!(addr, Address::Tcp { host: "10.0.0.5".into(), port: 6380 });
        assert!(parse_addr("not-an-address").is_err());
    }
}
