// src/cache/store.rs

//! The client-side cache store (component C5): a single-flight, TTL-bounded,
//! server-invalidated `(key, cmd) -> CacheEntry` map. Grounded on the
//! teacher's `dashmap`-backed concurrent state (e.g. `ServerState.clients` in
//! `core/state`) for the "bucket mutex, never held across I/O" locking
//! discipline spec §5 asks for.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::command::Command;
use crate::error::Error;
use crate::resp::Message;

/// `(key, cmd-fingerprint)`, the CSC's map key per spec §3.
pub type CacheKey = (Bytes, u64);

fn fingerprint(cmd: &Command) -> u64 {
    let mut hasher = DefaultHasher::new();
    for arg in cmd.args() {
        arg.hash(&mut hasher);
    }
    hasher.finish()
}

pub fn cache_key(cmd: &Command) -> Option<CacheKey> {
    cmd.primary_key().map(|key| (key.clone(), fingerprint(cmd)))
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug)]
enum EntryState {
    Pending,
    Resolved { message: Message },
    Errored,
}

struct Entry {
    state: EntryState,
    client_pxat: u64,
    waiters: Vec<oneshot::Sender<Result<Message, Error>>>,
    approx_size: usize,
}

/// The result of a [`CacheStore::flight`] lookup.
pub enum Flight {
    /// A resolved, unexpired entry was found: return it to the caller with no round trip.
    Hit(Message),
    /// Someone else is already fetching this `(key, cmd)`; await this receiver instead of
    /// sending a second request (spec §4.5 single-flight guarantee).
    Pending(oneshot::Receiver<Result<Message, Error>>),
    /// No entry existed; one was created in the `Pending` state under the caller's name.
    /// The caller now owns the obligation to issue exactly one `CLIENT CACHING YES` + command.
    Miss,
}

/// The (key,cmd)→CacheEntry store (spec §3/§4.5). One instance lives per wire.
pub struct CacheStore {
    entries: DashMap<CacheKey, Arc<Mutex<Entry>>>,
    by_key: DashMap<Bytes, Vec<u64>>,
    budget_bytes: usize,
    used_bytes: AtomicI64,
    resolved_count: AtomicU64,
}

impl CacheStore {
    pub fn new(budget_bytes: usize) -> Self {
        CacheStore {
            entries: DashMap::new(),
            by_key: DashMap::new(),
            budget_bytes,
            used_bytes: AtomicI64::new(0),
            resolved_count: AtomicU64::new(0),
        }
    }

    pub fn resolved_count(&self) -> u64 {
        self.resolved_count.load(Ordering::Relaxed)
    }

    /// spec §4.5 `flight`: look up or register a single-flight slot for `(key, cmd)`.
    pub fn flight(&self, cmd: &Command, ttl: Duration) -> Flight {
        let Some(key) = cache_key(cmd) else {
            return Flight::Miss;
        };
        let now = now_ms();

        if let Some(existing) = self.entries.get(&key) {
            let mut guard = existing.lock();
            match &guard.state {
                EntryState::Resolved { message } if guard.client_pxat > now => {
                    return Flight::Hit(message.clone());
                }
                EntryState::Resolved { .. } => {
                    // Expired; fall through to treat this as a fresh miss below.
                }
                EntryState::Pending => {
                    let (tx, rx) = oneshot::channel();
                    guard.waiters.push(tx);
                    return Flight::Pending(rx);
                }
                EntryState::Errored => {}
            }
            drop(guard);
            self.entries.remove(&key);
        }

        let entry = Arc::new(Mutex::new(Entry {
            state: EntryState::Pending,
            client_pxat: now + ttl.as_millis() as u64,
            waiters: Vec::new(),
            approx_size: 0,
        }));
        self.entries.insert(key.clone(), entry);
        self.by_key.entry(key.0).or_default().push(key.1);
        Flight::Miss
    }

    /// spec §4.5 `update`: resolves the pending entry for `(key, cmd)`. The
    /// effective PXAT is `min(client_pxat, server_pxat)`, where a zero
    /// server-provided PXAT means the server did not cap the TTL.
    pub fn update(&self, cmd: &Command, mut message: Message) -> Option<u64> {
        let key = cache_key(cmd)?;
        let entry = self.entries.get(&key)?.clone();
        let mut guard = entry.lock();

        let server_pxat = message.expire_at_ms;
        let effective_pxat =
            if server_pxat == 0 { guard.client_pxat } else { guard.client_pxat.min(server_pxat) };
        guard.client_pxat = effective_pxat;
        message.expire_at_ms = effective_pxat;
        message.cache_mark = true;

        let size = estimate_size(&message);
        guard.approx_size = size;
        self.used_bytes.fetch_add(size as i64, Ordering::Relaxed);
        self.resolved_count.fetch_add(1, Ordering::Relaxed);

        let waiters = std::mem::take(&mut guard.waiters);
        guard.state = EntryState::Resolved { message: message.clone() };
        drop(guard);

        for waiter in waiters {
            let _ = waiter.send(Ok(message.clone()));
        }

        self.enforce_budget();
        Some(effective_pxat)
    }

    /// spec §4.5 `cancel`: fails all waiters and removes the pending entry,
    /// used when the underlying request is cancelled or the connection is lost
    /// before a reply arrives.
    pub fn cancel(&self, cmd: &Command, err: Error) {
        let Some(key) = cache_key(cmd) else { return };
        if let Some((_, entry)) = self.entries.remove(&key) {
            let mut guard = entry.lock();
            guard.state = EntryState::Errored;
            for waiter in std::mem::take(&mut guard.waiters) {
                let _ = waiter.send(Err(err.clone()));
            }
        }
    }

    /// spec §4.5 `delete`: drops resolved entries for the given keys on an
    /// invalidation push. Pending entries are left untouched — a concurrent
    /// in-flight command that re-observes the key is cancelled explicitly when
    /// its own reply carries an invalidation attribute.
    pub fn delete(&self, keys: &[Bytes]) {
        for key in keys {
            let Some((_, fingerprints)) = self.by_key.remove(key) else { continue };
            for fp in fingerprints {
                let cache_key = (key.clone(), fp);
                if let Some((_, entry)) = self.entries.remove(&cache_key) {
                    let guard = entry.lock();
                    if matches!(guard.state, EntryState::Resolved { .. }) {
                        self.used_bytes.fetch_sub(guard.approx_size as i64, Ordering::Relaxed);
                    } else {
                        // A pending/errored entry was removed from the index but left alive
                        // if something else still holds a reference; put the index back for
                        // that rare race so `delete` never loses track of a pending fetch.
                        if matches!(guard.state, EntryState::Pending) {
                            drop(guard);
                            self.entries.insert(cache_key.clone(), entry);
                            self.by_key.entry(cache_key.0).or_default().push(cache_key.1);
                        }
                    }
                }
            }
        }
    }

    /// spec §4.5 `close`: evicts everything and fails all pending entries,
    /// used when the owning wire transitions to `closed`.
    pub fn close(&self, err: Error) {
        for entry in self.entries.iter() {
            let mut guard = entry.value().lock();
            if matches!(guard.state, EntryState::Pending) {
                guard.state = EntryState::Errored;
                for waiter in std::mem::take(&mut guard.waiters) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
        self.entries.clear();
        self.by_key.clear();
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    /// Evicts resolved entries in PXAT order (earliest-expiring first) until
    /// usage is back under `budget_bytes`, per spec §4.5's size-budget invariant.
    fn enforce_budget(&self) {
        if self.budget_bytes == 0 {
            return;
        }
        while self.used_bytes.load(Ordering::Relaxed) as usize > self.budget_bytes {
            let mut victim: Option<(CacheKey, u64, usize)> = None;
            for item in self.entries.iter() {
                let guard = item.value().lock();
                if let EntryState::Resolved { .. } = guard.state {
                    if victim.as_ref().map(|(_, pxat, _)| guard.client_pxat < *pxat).unwrap_or(true)
                    {
                        victim = Some((item.key().clone(), guard.client_pxat, guard.approx_size));
                    }
                }
            }
            let Some((key, _, size)) = victim else { break };
            self.entries.remove(&key);
            if let Some(mut fps) = self.by_key.get_mut(&key.0) {
                fps.retain(|fp| *fp != key.1);
            }
            self.used_bytes.fetch_sub(size as i64, Ordering::Relaxed);
        }
    }
}

fn estimate_size(message: &Message) -> usize {
    message.as_bytes().map(|b| b.len()).unwrap_or(32) + 16
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn get(key: &str) -> Command {
        Command::new([Bytes::from_static(b"GET"), Bytes::copy_from_slice(key.as_bytes())])
    }

    #[test]
    fn miss_then_update_then_hit() {
        let store = CacheStore::new(0);
        let cmd = get("k");
        assert!(matches!(store.flight(&cmd, Duration::from_secs(60)), Flight::Miss));
        store.update(&cmd, Message::new(crate::resp::Value::BlobString(Bytes::from_static(b"v"))));
        match store.flight(&cmd, Duration::from_secs(60)) {
            Flight::Hit(msg) => assert_eq!(msg.into_bytes().unwrap(), Bytes::from_static(b"v")),
            _ => panic!("expected a cache hit"),
        }
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_misses() {
        let store = Arc::new(CacheStore::new(0));
        let cmd = get("k");
        assert!(matches!(store.flight(&cmd, Duration::from_secs(60)), Flight::Miss));

        let Flight::Pending(rx) = store.flight(&cmd, Duration::from_secs(60)) else {
            panic!("second caller should observe the pending fetch, not issue its own")
        };

        store.update(&cmd, Message::new(crate::resp::Value::BlobString(Bytes::from_static(b"v"))));
        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.into_bytes().unwrap(), Bytes::from_static(b"v"));
    }

    #[test]
    fn server_pxat_intersects_with_client_ttl() {
        let store = CacheStore::new(0);
        let cmd = get("k");
        store.flight(&cmd, Duration::from_secs(60));
        let mut msg = Message::new(crate::resp::Value::BlobString(Bytes::from_static(b"v")));
        msg.expire_at_ms = now_ms() + 5_000; // server caps tighter than the 60s client TTL
        let effective = store.update(&cmd, msg).unwrap();
        assert!(effective <= now_ms() + 5_000 + 50);
    }

    #[test]
    fn delete_evicts_resolved_but_not_pending() {
        let store = CacheStore::new(0);
        let resolved_cmd = get("resolved");
        store.flight(&resolved_cmd, Duration::from_secs(60));
        store.update(
            &resolved_cmd,
            Message::new(crate::resp::Value::BlobString(Bytes::from_static(b"v"))),
        );

        let pending_cmd = get("pending");
        store.flight(&pending_cmd, Duration::from_secs(60));

        store.delete(&[Bytes::from_static(b"resolved"), Bytes::from_static(b"pending")]);

        assert!(matches!(store.flight(&resolved_cmd, Duration::from_secs(60)), Flight::Miss));
        assert!(matches!(store.flight(&pending_cmd, Duration::from_secs(60)), Flight::Pending(_)));
    }

    #[test]
    fn cancel_fails_waiters_and_clears_pending() {
        let store = CacheStore::new(0);
        let cmd = get("k");
        store.flight(&cmd, Duration::from_secs(60));
        let Flight::Pending(rx) = store.flight(&cmd, Duration::from_secs(60)) else {
            panic!("expected pending")
        };
        store.cancel(&cmd, Error::closed("lost connection"));
        assert!(rx.blocking_recv().unwrap().is_err());
        assert!(matches!(store.flight(&cmd, Duration::from_secs(60)), Flight::Miss));
    }
}
