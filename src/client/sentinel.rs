// src/client/sentinel.rs

//! Sentinel-aware routing (component C9): discovers the current primary via
//! `SENTINEL GET-MASTER-ADDR-BY-NAME`, then watches for `+switch-master`
//! announcements on a sentinel's pub/sub channel to re-bind without waiting
//! for a failed command to reveal the primary moved. Grounded on the
//! reconnect-with-backoff shape of the teacher's
//! `core/warden/worker.rs::run_pubsub_loop` (here run in the opposite
//! direction: watching external sentinels rather than being one), and on
//! `core/warden/failover.rs`'s replica-promotion bookkeeping for why a
//! client-side watcher cannot simply trust the first sentinel it asks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::single_node::DedicatedWire;
use crate::command::Command;
use crate::config::{Address, ClientOptions};
use crate::error::Error;
use crate::pool::Pool;
use crate::resp::Message;
use crate::retry::RetryPolicy;
use crate::wire::Wire;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Routes commands to the primary of a sentinel-monitored master, re-binding
/// automatically when sentinels announce a failover.
pub struct SentinelRouter {
    master_name: String,
    sentinels: Vec<Address>,
    opts: ClientOptions,
    primary_pool: Arc<RwLock<Arc<Pool>>>,
    retry: RetryPolicy,
    _watcher: JoinHandle<()>,
}

impl SentinelRouter {
    pub async fn connect(
        sentinels: Vec<Address>,
        master_name: String,
        opts: ClientOptions,
    ) -> Result<Self, Error> {
        let primary_addr = discover_primary(&sentinels, &master_name, &opts).await?;
        let primary_pool = Arc::new(RwLock::new(Arc::new(Pool::new(primary_addr, opts.clone()))));

        let watcher = tokio::spawn(watch_for_failover(
            sentinels.clone(),
            master_name.clone(),
            opts.clone(),
            primary_pool.clone(),
        ));

        Ok(SentinelRouter {
            master_name,
            sentinels,
            opts,
            primary_pool,
            retry: RetryPolicy::default(),
            _watcher: watcher,
        })
    }

    fn pool(&self) -> Arc<Pool> {
        self.primary_pool.read().clone()
    }

    pub async fn route(&self, cmd: Command) -> Result<Message, Error> {
        let mut attempt = 0;
        loop {
            let pool = self.pool();
            let wire = pool.acquire().await?;
            let result = wire.do_one(cmd.clone()).await;
            pool.release(wire).await;

            match result.and_then(|m| m.into_result()) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    let Some(backoff) = self.retry.should_retry(attempt, &cmd, &e, None) else {
                        return Err(e);
                    };
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    if let Ok(addr) = discover_primary(&self.sentinels, &self.master_name, &self.opts).await {
                        self.rebind(addr).await;
                    }
                }
            }
        }
    }

    pub async fn route_multi(&self, cmds: Vec<Command>) -> Result<Vec<Message>, Error> {
        let pool = self.pool();
        let wire = pool.acquire().await?;
        let result = wire.do_multi(cmds).await;
        pool.release(wire).await;
        result
    }

    async fn rebind(&self, new_primary: Address) {
        let old_pool = self.pool();
        if old_pool.addr() == &new_primary {
            return;
        }
        info!("sentinel reports new primary {new_primary} for master '{}'", self.master_name);
        let new_pool = Arc::new(Pool::new(new_primary, self.opts.clone()));
        *self.primary_pool.write() = new_pool;
        old_pool.close_all(Error::closed("primary changed via sentinel failover")).await;
    }

    pub async fn dedicate(&self) -> Result<DedicatedWire, Error> {
        let pool = self.pool();
        let wire = pool.acquire().await?;
        Ok(DedicatedWire::new(wire, pool))
    }

    pub async fn close(&self, err: Error) {
        self.pool().close_all(err).await;
    }

    pub fn nodes(&self) -> Vec<Address> {
        vec![self.pool().addr().clone()]
    }
}

/// Asks each sentinel in turn for the current primary, per spec §4.9: any
/// single sentinel may be stale or down, so the first one to answer wins.
async fn discover_primary(
    sentinels: &[Address],
    master_name: &str,
    opts: &ClientOptions,
) -> Result<Address, Error> {
    let mut last_err = None;
    for sentinel_addr in sentinels {
        match Wire::connect(sentinel_addr, opts).await {
            Ok(wire) => {
                let reply = wire
                    .do_one(Command::new([
                        "SENTINEL".to_string(),
                        "GET-MASTER-ADDR-BY-NAME".to_string(),
                        master_name.to_string(),
                    ]))
                    .await
                    .and_then(|m| m.into_result());
                wire.close(Error::closed("sentinel discovery connection done"));
                match reply.and_then(parse_host_port) {
                    Ok(addr) => return Ok(addr),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Config("no sentinel addresses configured".into())))
}

fn parse_host_port(msg: Message) -> Result<Address, Error> {
    let mut items = msg.into_array()?.into_iter();
    let host = items
        .next()
        .ok_or_else(|| Error::Protocol("sentinel reply missing host".into()))?
        .into_string()?;
    let port: u16 = items
        .next()
        .ok_or_else(|| Error::Protocol("sentinel reply missing port".into()))?
        .into_string()?
        .parse()
        .map_err(|_| Error::Protocol("sentinel reply has a non-numeric port".into()))?;
    Ok(Address::Tcp { host, port })
}

/// Subscribes to `+switch-master` on one sentinel at a time, reconnecting
/// with the teacher's doubling-then-capped backoff when the pub/sub
/// connection drops, and re-binds the primary pool the moment an
/// announcement names a master we are watching.
async fn watch_for_failover(
    sentinels: Vec<Address>,
    master_name: String,
    opts: ClientOptions,
    primary_pool: Arc<RwLock<Arc<Pool>>>,
) {
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;
    let mut sentinel_idx = 0usize;

    loop {
        let sentinel_addr = &sentinels[sentinel_idx % sentinels.len()];
        match Wire::connect(sentinel_addr, &opts).await {
            Ok(wire) => {
                reconnect_delay = INITIAL_RECONNECT_DELAY;
                let mut push_rx = wire.receive();
                if wire.send_subscription(Command::new(["SUBSCRIBE", "+switch-master"])).is_err() {
                    continue;
                }
                loop {
                    match push_rx.recv().await {
                        Ok(msg) => {
                            if let Some(new_primary) = parse_switch_master(&msg, &master_name) {
                                let new_pool = Arc::new(Pool::new(new_primary, opts.clone()));
                                let old_pool = std::mem::replace(&mut *primary_pool.write(), new_pool);
                                old_pool.close_all(Error::closed("primary changed via sentinel failover")).await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("sentinel pub/sub watcher lagged by {n} messages");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                wire.close(Error::closed("sentinel pub/sub connection closed"));
            }
            Err(e) => {
                debug!("failed to connect to sentinel {sentinel_addr}: {e}");
            }
        }

        sentinel_idx += 1;
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

/// `+switch-master` payloads are `<master-name> <old-ip> <old-port> <new-ip> <new-port>`.
fn parse_switch_master(msg: &Message, watching: &str) -> Option<Address> {
    let items = msg.clone().into_array().ok()?;
    let payload = items.last()?.clone().into_string().ok()?;
    let mut fields = payload.split_whitespace();
    let name = fields.next()?;
    if name != watching {
        return None;
    }
    let _old_ip = fields.next()?;
    let _old_port = fields.next()?;
    let new_ip = fields.next()?.to_string();
    let new_port: u16 = fields.next()?.parse().ok()?;
    Some(Address::Tcp { host: new_ip, port: new_port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::Value;
    use bytes::Bytes;

    fn bulk(s: &str) -> Message {
        Message::new(Value::BlobString(Bytes::copy_from_slice(s.as_bytes())))
    }

    #[test]
    fn parse_host_port_reads_a_two_element_array() {
        let msg = Message::new(Value::Array(vec![bulk("10.0.0.9"), bulk("6380")]));
        let addr = parse_host_port(msg).unwrap();
        assert_eq!(addr, Address::Tcp { host: "10.0.0.9".into(), port: 6380 });
    }

    #[test]
    fn parse_host_port_rejects_a_non_numeric_port() {
        let msg = Message::new(Value::Array(vec![bulk("10.0.0.9"), bulk("not-a-port")]));
        assert!(parse_host_port(msg).is_err());
    }

    #[test]
    fn parse_switch_master_ignores_other_master_names() {
        let payload = bulk("other-master 10.0.0.1 6379 10.0.0.2 6380");
        let msg = Message::new(Value::Push(vec![
            bulk("message"),
            bulk("+switch-master"),
            payload,
        ]));
        assert!(parse_switch_master(&msg, "mymaster").is_none());
    }

    #[test]
    fn parse_switch_master_extracts_the_new_address() {
        let payload = bulk("mymaster 10.0.0.1 6379 10.0.0.2 6380");
        let msg = Message::new(Value::Push(vec![
            bulk("message"),
            bulk("+switch-master"),
            payload,
        ]));
        let addr = parse_switch_master(&msg, "mymaster").unwrap();
        assert_eq!(addr, Address::Tcp { host: "10.0.0.2".into(), port: 6380 });
    }
}
