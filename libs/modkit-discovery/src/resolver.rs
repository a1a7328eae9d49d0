//! Client-side name resolution backed by the coordination store.
//!
//! [`EtcdResolverBuilder::build`] seeds an [`AddressList`] with a full prefix
//! read, then hands it to a worker task that merges watch events and re-reads
//! the prefix on every resync tick. Every change is pushed to the owning
//! [`ClientConn`] as a full snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::address::{Address, AddressList};
use crate::config::EtcdConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::etcd::EtcdConnector;
use crate::record;
use crate::store::{DiscoveryStore, StoreConnector, WatchEvent, WatchStream, with_deadline};

/// Scheme under which the etcd resolver is registered.
pub const ETCD_SCHEME: &str = "etcd";

/// Parsed resolver target: `scheme://authority/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    /// Lookup path without surrounding slashes, e.g. `user/v1`.
    pub path: String,
}

impl Target {
    /// # Errors
    /// Returns `InvalidTarget` when the scheme or the path is missing.
    pub fn parse(target: &str) -> DiscoveryResult<Self> {
        let invalid = |reason: &str| DiscoveryError::InvalidTarget {
            target: target.to_owned(),
            reason: reason.to_owned(),
        };

        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://authority/path"))?;
        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(invalid("empty service path"));
        }

        Ok(Self {
            scheme: scheme.to_owned(),
            authority: authority.to_owned(),
            path: path.to_owned(),
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.path)
    }
}

/// Full address set handed to the connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

/// Receiving side of resolution: the connection pool of one client.
pub trait ClientConn: Send + Sync {
    /// Replace the pool's address set.
    ///
    /// # Errors
    /// Returns `Publish` when the pool cannot take the update.
    fn update_state(&self, state: ResolverState) -> DiscoveryResult<()>;
}

/// Live resolution handle held for the lifetime of a client connection.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Ask for an immediate re-read. Best effort.
    fn resolve_now(&self);

    /// Stop resolution and release the store client.
    async fn close(self: Box<Self>);
}

/// Creates resolvers for one scheme.
#[async_trait]
pub trait ResolverBuilder: Send + Sync {
    fn scheme(&self) -> &str;

    /// # Errors
    /// Returns an error when resolution for `target` cannot be started.
    async fn build(
        &self,
        target: &Target,
        conn: Arc<dyn ClientConn>,
    ) -> DiscoveryResult<Box<dyn Resolver>>;
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub key_prefix: String,
    pub rw_timeout: Duration,
    pub resync_interval: Duration,
}

impl From<&EtcdConfig> for ResolverOptions {
    fn from(cfg: &EtcdConfig) -> Self {
        Self {
            key_prefix: cfg.key_prefix.clone(),
            rw_timeout: cfg.rw_timeout(),
            resync_interval: cfg.resync_interval(),
        }
    }
}

/// Builds resolvers that read registrations from the coordination store.
///
/// Each built resolver dials its own store client.
#[derive(Clone)]
pub struct EtcdResolverBuilder {
    connector: Arc<dyn StoreConnector>,
    options: ResolverOptions,
}

impl EtcdResolverBuilder {
    #[must_use]
    pub fn new(cfg: &EtcdConfig) -> Self {
        Self::with_connector(Arc::new(EtcdConnector::new(cfg)), ResolverOptions::from(cfg))
    }

    #[must_use]
    pub fn with_connector(connector: Arc<dyn StoreConnector>, options: ResolverOptions) -> Self {
        Self { connector, options }
    }
}

#[async_trait]
impl ResolverBuilder for EtcdResolverBuilder {
    fn scheme(&self) -> &str {
        ETCD_SCHEME
    }

    async fn build(
        &self,
        target: &Target,
        conn: Arc<dyn ClientConn>,
    ) -> DiscoveryResult<Box<dyn Resolver>> {
        let store = self.connector.connect().await?;
        let mut worker = Worker {
            store,
            conn,
            prefix: record::lookup_prefix(&self.options.key_prefix, &target.path),
            target: target.to_string(),
            rw_timeout: self.options.rw_timeout,
            addresses: AddressList::new(),
            keys: HashMap::new(),
            watch: None,
        };

        if let Err(e) = worker.start().await {
            worker.store.close().await;
            return Err(e);
        }

        tracing::info!(
            target = %worker.target,
            prefix = %worker.prefix,
            addresses = worker.addresses.len(),
            "resolver started"
        );

        let cancel = CancellationToken::new();
        let notify = Arc::new(Notify::new());
        let handle = tokio::spawn(worker.run(
            cancel.clone(),
            Arc::clone(&notify),
            self.options.resync_interval,
        ));

        Ok(Box::new(EtcdResolver {
            cancel,
            notify,
            worker: Some(handle),
        }))
    }
}

/// Handle to a running etcd resolver worker.
pub struct EtcdResolver {
    cancel: CancellationToken,
    notify: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

#[async_trait]
impl Resolver for EtcdResolver {
    fn resolve_now(&self) {
        self.notify.notify_one();
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        this.cancel.cancel();
        if let Some(worker) = this.worker.take()
            && let Err(e) = worker.await
        {
            tracing::error!(error = %e, "resolver worker failed");
        }
    }
}

impl Drop for EtcdResolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    store: Box<dyn DiscoveryStore>,
    conn: Arc<dyn ClientConn>,
    prefix: String,
    target: String,
    rw_timeout: Duration,
    addresses: AddressList,
    /// Registration key -> address, for every record behind `addresses`.
    keys: HashMap<String, String>,
    watch: Option<WatchStream>,
}

impl Worker {
    /// Initial read plus watch subscription. Store failures are fatal here,
    /// an empty prefix is not.
    async fn start(&mut self) -> DiscoveryResult<()> {
        let revision = match self.sync().await {
            Ok(revision) => revision,
            Err(DiscoveryError::EmptyResultSet { prefix, revision }) => {
                tracing::warn!(
                    target = %self.target,
                    prefix = %prefix,
                    "no instances registered yet"
                );
                revision
            }
            Err(e) => return Err(e),
        };
        self.watch = Some(self.open_watch(revision + 1).await?);
        Ok(())
    }

    async fn open_watch(&mut self, start_revision: i64) -> DiscoveryResult<WatchStream> {
        with_deadline(
            "watch",
            self.rw_timeout,
            self.store.watch_prefix(&self.prefix, Some(start_revision)),
        )
        .await
    }

    /// Rebuild the address list from a full prefix read and push it.
    ///
    /// Returns the store revision of the read. Zero records leave the list
    /// untouched and yield `EmptyResultSet` carrying that revision.
    async fn sync(&mut self) -> DiscoveryResult<i64> {
        let snapshot =
            with_deadline("get", self.rw_timeout, self.store.get_prefix(&self.prefix)).await?;

        let mut keys = HashMap::with_capacity(snapshot.kvs.len());
        let mut records = Vec::with_capacity(snapshot.kvs.len());
        for kv in &snapshot.kvs {
            match record::decode(&kv.value) {
                Ok(record) => {
                    keys.insert(kv.key.clone(), record.addr.clone());
                    records.push(Address::from(&record));
                }
                Err(e) => {
                    tracing::warn!(target = %self.target, key = %kv.key, error = %e, "skipping record");
                }
            }
        }

        if records.is_empty() {
            return Err(DiscoveryError::EmptyResultSet {
                prefix: self.prefix.clone(),
                revision: snapshot.revision,
            });
        }

        self.keys = keys;
        self.addresses.replace(records);
        self.publish();
        Ok(snapshot.revision)
    }

    /// Merge one watch batch; pushes at most once.
    ///
    /// A target without a version covers every version of the service, so the
    /// same address can be registered under several keys. A Delete only drops
    /// the address once no other known key still points at it.
    fn apply_events(&mut self, events: Vec<WatchEvent>) {
        let mut changed = false;
        for event in events {
            match event {
                WatchEvent::Put(kv) => match record::decode(&kv.value) {
                    Ok(record) => {
                        self.keys.insert(kv.key, record.addr.clone());
                        changed |= self.addresses.upsert(Address::from(&record));
                    }
                    Err(e) => {
                        tracing::warn!(target = %self.target, key = %kv.key, error = %e, "dropping put event");
                    }
                },
                WatchEvent::Delete { key } => match record::parse_key(&key) {
                    Ok(parts) => {
                        self.keys.remove(&key);
                        if self.keys.values().any(|addr| *addr == parts.addr) {
                            tracing::debug!(target = %self.target, key = %key, "address still registered under another key");
                        } else {
                            changed |= self.addresses.remove(&parts.addr);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target = %self.target, key = %key, error = %e, "dropping delete event");
                    }
                },
            }
        }
        if changed {
            self.publish();
        }
    }

    fn publish(&self) {
        let state = ResolverState {
            addresses: self.addresses.snapshot(),
        };
        match self.conn.update_state(state) {
            Ok(()) => tracing::debug!(
                target = %self.target,
                addresses = self.addresses.len(),
                "address list published"
            ),
            Err(e) => tracing::warn!(target = %self.target, error = %e, "address list not accepted"),
        }
    }

    async fn resync(&mut self) {
        let revision = match self.sync().await {
            Ok(revision) => revision,
            Err(DiscoveryError::EmptyResultSet { prefix, revision }) => {
                tracing::warn!(
                    target = %self.target,
                    prefix = %prefix,
                    "resync found no instances, keeping last list"
                );
                revision
            }
            Err(e) => {
                tracing::warn!(target = %self.target, error = %e, "resync failed");
                return;
            }
        };
        if self.watch.is_none() {
            match self.open_watch(revision + 1).await {
                Ok(watch) => {
                    tracing::info!(target = %self.target, "watch re-established");
                    self.watch = Some(watch);
                }
                Err(e) => tracing::warn!(target = %self.target, error = %e, "watch re-open failed"),
            }
        }
    }

    async fn run(mut self, cancel: CancellationToken, notify: Arc<Notify>, resync_every: Duration) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + resync_every, resync_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = notify.notified() => self.resync().await,
                batch = next_batch(&mut self.watch) => match batch {
                    Some(events) => self.apply_events(events),
                    None => {
                        tracing::warn!(target = %self.target, "watch stream ended, waiting for resync");
                        self.watch = None;
                    }
                },
                _ = ticker.tick() => self.resync().await,
            }
        }

        self.watch = None;
        self.store.close().await;
        tracing::info!(target = %self.target, "resolver stopped");
    }
}

async fn next_batch(watch: &mut Option<WatchStream>) -> Option<Vec<WatchEvent>> {
    match watch {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}
