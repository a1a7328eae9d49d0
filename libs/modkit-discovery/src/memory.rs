//! In-process coordination store.
//!
//! Follows the etcd semantics the discovery layer relies on: keys bound to a
//! lease disappear when the lease is revoked or expires, prefix watchers see
//! put/delete events in order and can replay from a revision. Like etcd, only a
//! bounded window of history is kept: watching from a compacted revision fails.
//! Leases never expire on their own; tests drive expiry through
//! [`MemoryStore::expire_lease`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::store::{
    DiscoveryStore, KeepAlive, KeepAliveStream, KeyValue, LeaseId, PrefixSnapshot,
    StoreConnector, WatchEvent, WatchStream,
};

const STREAM_BUFFER: usize = 64;
const HISTORY_LIMIT: usize = 1024;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    listeners: Vec<(u64, mpsc::Sender<KeepAlive>)>,
}

#[derive(Debug)]
struct Watcher {
    owner: u64,
    prefix: String,
    tx: mpsc::Sender<Vec<WatchEvent>>,
}

#[derive(Debug, Default)]
struct State {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
    history: VecDeque<(i64, WatchEvent)>,
    /// Highest revision dropped from `history`.
    compacted: i64,
    revision: i64,
    next_lease: LeaseId,
    unavailable: bool,
    grants: u64,
    rejected: u64,
}

impl State {
    fn check_available(&mut self, op: &'static str) -> DiscoveryResult<()> {
        if self.unavailable {
            self.rejected += 1;
            Err(DiscoveryError::store(op, "memory store marked unavailable"))
        } else {
            Ok(())
        }
    }

    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision += 1;
        for event in &events {
            self.history.push_back((self.revision, event.clone()));
        }
        self.compact();
        self.watchers.retain(|w| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key().starts_with(&w.prefix))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !w.tx.is_closed();
            }
            // A slow consumer loses the batch; periodic resync repairs it.
            !matches!(
                w.tx.try_send(batch),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    /// Trim history to `HISTORY_LIMIT` events, dropping whole revisions only.
    fn compact(&mut self) {
        if self.history.len() <= HISTORY_LIMIT {
            return;
        }
        let excess = self.history.len() - HISTORY_LIMIT;
        let Some(&(upto, _)) = self.history.get(excess - 1) else {
            return;
        };
        while self.history.front().is_some_and(|(rev, _)| *rev <= upto) {
            self.history.pop_front();
        }
        self.compacted = upto;
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let bound: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        let events = bound
            .into_iter()
            .map(|key| {
                self.kvs.remove(&key);
                WatchEvent::Delete { key }
            })
            .collect();
        self.commit(events);
        true
    }
}

/// Shared in-memory "cluster"; every [`StoreConnector::connect`] returns a new
/// client onto the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clients: Arc<AtomicU64>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation (including `connect`) fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Expire a lease as if its TTL elapsed: bound keys are deleted and the
    /// keepalive streams of that lease close.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.state.lock().drop_lease(lease)
    }

    /// Emit one renewal to every keepalive listener of `lease`.
    pub fn renew(&self, lease: LeaseId) -> bool {
        let state = self.state.lock();
        let Some(entry) = state.leases.get(&lease) else {
            return false;
        };
        for (_, tx) in &entry.listeners {
            if tx.try_send(KeepAlive { lease, ttl: entry.ttl }).is_err() {
                tracing::trace!(lease_id = lease, "keepalive listener not ready");
            }
        }
        true
    }

    /// Close every open watch stream without touching the data.
    pub fn drop_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    /// Write a key outside any client, e.g. to seed records.
    pub fn insert(&self, key: impl Into<String>, value: Vec<u8>) {
        let key = key.into();
        let mut state = self.state.lock();
        state.kvs.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                lease: None,
            },
        );
        state.commit(vec![WatchEvent::Put(KeyValue { key, value })]);
    }

    /// Delete a key outside any client.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        if state.kvs.remove(key).is_none() {
            return false;
        }
        state.commit(vec![WatchEvent::Delete {
            key: key.to_owned(),
        }]);
        true
    }

    #[must_use]
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().kvs.get(key).map(|e| e.value.clone())
    }

    #[must_use]
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.state.lock().kvs.get(key).and_then(|e| e.lease)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().kvs.keys().cloned().collect()
    }

    #[must_use]
    pub fn active_leases(&self) -> Vec<LeaseId> {
        let mut leases: Vec<LeaseId> = self.state.lock().leases.keys().copied().collect();
        leases.sort_unstable();
        leases
    }

    /// Number of leases granted since creation.
    #[must_use]
    pub fn grant_count(&self) -> u64 {
        self.state.lock().grants
    }

    /// Number of calls refused while the store was unavailable.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.state.lock().rejected
    }

    /// Number of open watch streams.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> DiscoveryResult<Box<dyn DiscoveryStore>> {
        self.state.lock().check_available("connect")?;
        let id = self.clients.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryClient {
            store: self.clone(),
            id,
            closed: false,
        }))
    }
}

/// Client handle onto a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryClient {
    store: MemoryStore,
    id: u64,
    closed: bool,
}

impl MemoryClient {
    fn state(&self, op: &'static str) -> DiscoveryResult<parking_lot::MutexGuard<'_, State>> {
        if self.closed {
            return Err(DiscoveryError::Closed);
        }
        let mut state = self.store.state.lock();
        state.check_available(op)?;
        Ok(state)
    }
}

#[async_trait]
impl DiscoveryStore for MemoryClient {
    async fn grant_lease(&mut self, ttl: i64) -> DiscoveryResult<LeaseId> {
        let mut state = self.state("lease grant")?;
        state.next_lease += 1;
        state.grants += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                listeners: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&mut self, lease: LeaseId) -> DiscoveryResult<KeepAliveStream> {
        let owner = self.id;
        let mut state = self.state("keep alive")?;
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(DiscoveryError::LeaseLost { lease })?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.try_send(KeepAlive {
            lease,
            ttl: entry.ttl,
        })
        .map_err(|e| DiscoveryError::store("keep alive", e))?;
        entry.listeners.push((owner, tx));
        Ok(rx)
    }

    async fn revoke_lease(&mut self, lease: LeaseId) -> DiscoveryResult<()> {
        let mut state = self.state("lease revoke")?;
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(DiscoveryError::LeaseLost { lease })
        }
    }

    async fn put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> DiscoveryResult<()> {
        let mut state = self.state("put")?;
        if let Some(lease) = lease.filter(|id| !state.leases.contains_key(id)) {
            return Err(DiscoveryError::LeaseLost { lease });
        }
        state.kvs.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        state.commit(vec![WatchEvent::Put(KeyValue {
            key: key.to_owned(),
            value,
        })]);
        Ok(())
    }

    async fn get_prefix(&mut self, prefix: &str) -> DiscoveryResult<PrefixSnapshot> {
        let state = self.state("get")?;
        let kvs = state
            .kvs
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        Ok(PrefixSnapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn delete(&mut self, key: &str) -> DiscoveryResult<()> {
        let mut state = self.state("delete")?;
        if state.kvs.remove(key).is_some() {
            state.commit(vec![WatchEvent::Delete {
                key: key.to_owned(),
            }]);
        }
        Ok(())
    }

    async fn watch_prefix(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> DiscoveryResult<WatchStream> {
        let owner = self.id;
        let mut state = self.state("watch")?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        if let Some(start) = start_revision {
            if start <= state.compacted {
                return Err(DiscoveryError::store(
                    "watch",
                    format!("revision {start} has been compacted"),
                ));
            }
            let replay: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|(rev, event)| *rev >= start && event.key().starts_with(prefix))
                .map(|(_, event)| event.clone())
                .collect();
            if !replay.is_empty() {
                tx.try_send(replay)
                    .map_err(|e| DiscoveryError::store("watch", e))?;
            }
        }

        state.watchers.push(Watcher {
            owner,
            prefix: prefix.to_owned(),
            tx,
        });
        Ok(rx)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let owner = self.id;
        let mut state = self.store.state.lock();
        state.watchers.retain(|w| w.owner != owner);
        for lease in state.leases.values_mut() {
            lease.listeners.retain(|(id, _)| *id != owner);
        }
    }
}
