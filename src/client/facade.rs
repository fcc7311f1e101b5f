// src/client/facade.rs

//! The public façade (component C11): dispatches `Do`/`DoMulti`/`DoCache`/
//! `DoMultiCache`/`DoStream`/`Receive`/`Dedicate` to one of the four
//! topology routers. Per the REDESIGN FLAGS, this is a sum type with an
//! exhaustive match rather than a `Client` trait object with four impls —
//! there is no vtable indirection on the hot `Do` path, and adding a fifth
//! topology is a compiler-enforced exhaustiveness error, not a silent gap.

use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::command::{Cacheable, CacheableTtl, Command};
use crate::config::{Address, ClientOptions, Mode};
use crate::error::Error;
use crate::resp::Message;

use super::cluster::ClusterRouter;
use super::replicas::ReplicaSetRouter;
use super::sentinel::SentinelRouter;
use super::single_node::{DedicatedWire, SingleNodeRouter};

/// The client entry point. Construct with [`Client::connect`] (from a parsed
/// [`ClientOptions`]) or [`Client::connect_url`] (from a `redis://` string).
pub enum Client {
    SingleNode(SingleNodeRouter),
    WithReplicas(ReplicaSetRouter),
    Sentinel(SentinelRouter),
    Cluster(ClusterRouter),
}

impl Client {
    pub async fn connect(opts: ClientOptions) -> Result<Self, Error> {
        match opts.mode() {
            Mode::SingleNode => {
                let addr = opts
                    .addresses
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::Config("no address configured".into()))?;
                Ok(Client::SingleNode(SingleNodeRouter::connect(addr, opts).await?))
            }
            Mode::WithReplicas => {
                let mut addrs = opts.addresses.clone();
                if addrs.is_empty() {
                    return Err(Error::Config("no addresses configured".into()));
                }
                let primary = addrs.remove(0);
                Ok(Client::WithReplicas(ReplicaSetRouter::new(primary, addrs, opts)))
            }
            Mode::Sentinel => {
                let master_name = opts
                    .sentinel_master_name
                    .clone()
                    .ok_or_else(|| Error::Config("sentinel mode requires a master name".into()))?;
                let sentinels = opts.addresses.clone();
                Ok(Client::Sentinel(SentinelRouter::connect(sentinels, master_name, opts).await?))
            }
            Mode::Cluster => {
                let seeds = opts.addresses.clone();
                Ok(Client::Cluster(ClusterRouter::connect(seeds, opts).await?))
            }
        }
    }

    pub async fn connect_url(raw: &str) -> Result<Self, Error> {
        Client::connect(ClientOptions::from_url(raw)?).await
    }

    pub fn mode(&self) -> Mode {
        match self {
            Client::SingleNode(_) => Mode::SingleNode,
            Client::WithReplicas(_) => Mode::WithReplicas,
            Client::Sentinel(_) => Mode::Sentinel,
            Client::Cluster(_) => Mode::Cluster,
        }
    }

    pub fn nodes(&self) -> Vec<Address> {
        match self {
            Client::SingleNode(r) => r.nodes(),
            Client::WithReplicas(r) => r.nodes(),
            Client::Sentinel(r) => r.nodes(),
            Client::Cluster(r) => r.nodes(),
        }
    }

    /// `Do`: sends one command and awaits its reply.
    pub async fn do_cmd(&self, cmd: Command) -> Result<Message, Error> {
        match self {
            Client::SingleNode(r) => r.route(cmd).await,
            Client::WithReplicas(r) => r.route(cmd).await,
            Client::Sentinel(r) => r.route(cmd).await,
            Client::Cluster(r) => r.route(cmd).await,
        }
    }

    /// `DoMulti`: pipelines a contiguous run of commands.
    pub async fn do_multi(&self, cmds: Vec<Command>) -> Result<Vec<Message>, Error> {
        match self {
            Client::SingleNode(r) => r.route_multi(cmds).await,
            Client::WithReplicas(r) => r.route_multi(cmds).await,
            Client::Sentinel(r) => r.route_multi(cmds).await,
            Client::Cluster(r) => r.route_multi(cmds).await,
        }
    }

    /// `DoCache`: the client-side-cache read path. Only meaningful on a
    /// single fixed connection, so every topology routes it through a
    /// [`SingleNodeRouter`]-shaped path; cluster/sentinel/replica callers get
    /// the same guarantee scoped to whichever node the command would have
    /// hit anyway, per spec §4.5 (a push-invalidated cache entry is always
    /// local to the wire that registered it).
    pub async fn do_cached(&self, cacheable: Cacheable, ttl: Duration) -> Result<Message, Error> {
        match self {
            Client::SingleNode(r) => r.route_cached(cacheable, ttl).await,
            Client::WithReplicas(r) => r.route_cached_via_primary(cacheable, ttl).await,
            Client::Sentinel(_) | Client::Cluster(_) => {
                Err(Error::Config("DoCache is not supported on this topology".into()))
            }
        }
    }

    pub async fn do_multi_cached(&self, entries: Vec<CacheableTtl>) -> Result<Vec<Message>, Error> {
        match self {
            Client::SingleNode(r) => r.route_multi_cached(entries).await,
            Client::WithReplicas(r) => r.route_multi_cached_via_primary(entries).await,
            Client::Sentinel(_) | Client::Cluster(_) => {
                Err(Error::Config("DoMultiCache is not supported on this topology".into()))
            }
        }
    }

    /// `DoStream`: only defined for a single fixed connection (spec §4.7).
    pub async fn do_stream(&self, cmd: Command, sink: &mut dyn Write) -> Result<usize, Error> {
        match self {
            Client::SingleNode(r) => r.route_stream(cmd, sink).await,
            _ => Err(Error::Config("DoStream is only supported in single-node mode".into())),
        }
    }

    /// `Dedicate`: borrows a wire for exclusive use (transactions, blocking
    /// commands, subscriptions). `key` hints which cluster shard to borrow
    /// from; ignored by every other topology.
    pub async fn dedicate(&self, key: Option<&Bytes>) -> Result<DedicatedWire, Error> {
        match self {
            Client::SingleNode(r) => r.dedicate().await,
            Client::WithReplicas(r) => r.dedicate().await,
            Client::Sentinel(r) => r.dedicate().await,
            Client::Cluster(r) => r.dedicate(key).await,
        }
    }

    /// `Receive`: subscribes on a dedicated wire and drives `handler` for
    /// every `message`/`pmessage` push until every requested channel has
    /// been unsubscribed, the wire closes, or `cancel` fires — whichever
    /// comes first. Returns `Ok(())` on a clean unsubscribe-to-zero (spec's
    /// "returns nil"); any other termination surfaces as `Err`.
    pub async fn receive<F>(
        &self,
        subscribe_cmd: Command,
        mut handler: F,
        mut cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), Error>
    where
        F: FnMut(Message) + Send,
    {
        let key = subscribe_cmd.primary_key().cloned();
        let dedicated = self.dedicate(key.as_ref()).await?;
        let wire = dedicated.get();
        let mut push_rx = wire.receive();
        wire.send_subscription(subscribe_cmd)?;

        let mut subscribed: i64 = 0;
        let mut ever_subscribed = false;

        loop {
            tokio::select! {
                _ = &mut cancel => return Err(Error::Cancelled),
                recv = push_rx.recv() => match recv {
                    Ok(msg) => {
                        let Some(kind) = msg.push_kind().map(|k| k.to_ascii_lowercase()) else { continue };
                        match kind.as_slice() {
                            b"subscribe" | b"psubscribe" | b"ssubscribe" => {
                                ever_subscribed = true;
                                if let Some(count) = push_count(&msg) {
                                    subscribed = count;
                                }
                            }
                            b"unsubscribe" | b"punsubscribe" | b"sunsubscribe" => {
                                if let Some(count) = push_count(&msg) {
                                    subscribed = count;
                                }
                                if ever_subscribed && subscribed == 0 {
                                    return Ok(());
                                }
                            }
                            b"message" | b"pmessage" | b"smessage" => handler(msg),
                            _ => {}
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Receive lagged by {n} push frames");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(Error::closed("wire closed while subscribed"));
                    }
                },
            }
        }
    }

    pub async fn close(&self, err: Error) {
        match self {
            Client::SingleNode(r) => r.close(err).await,
            Client::WithReplicas(r) => r.close(err).await,
            Client::Sentinel(r) => r.close(err).await,
            Client::Cluster(r) => r.close(err).await,
        }
    }
}

/// Extracts the trailing integer (subscription count) from a subscribe/
/// unsubscribe push frame: `[kind, channel, count]`.
fn push_count(msg: &Message) -> Option<i64> {
    let items = msg.clone().into_array().ok()?;
    items.last()?.clone().into_i64().ok()
}
