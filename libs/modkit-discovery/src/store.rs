//! Coordination-store seam shared by the registrar and the resolver.
//!
//! Each [`crate::Registrar`] and each resolver owns exactly one store client,
//! obtained from a [`StoreConnector`]. Long-lived subscriptions (lease keepalive,
//! prefix watch) are surfaced as bounded `mpsc` receivers: the stream ends when
//! the receiver yields `None`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DiscoveryError, DiscoveryResult};

/// Opaque lease identifier issued by the store.
pub type LeaseId = i64;

/// One successful lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub lease: LeaseId,
    /// Remaining TTL in seconds reported by the store.
    pub ttl: i64,
}

pub type KeepAliveStream = mpsc::Receiver<KeepAlive>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a prefix read together with the store revision it was taken at.
#[derive(Debug, Clone, Default)]
pub struct PrefixSnapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// Change notification for a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    /// Deletions carry only the key.
    Delete { key: String },
}

impl WatchEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key } => key,
        }
    }
}

/// Batches of events in the order the store emitted them.
pub type WatchStream = mpsc::Receiver<Vec<WatchEvent>>;

/// Client handle to the coordination store.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    /// Grant a lease of `ttl` seconds.
    async fn grant_lease(&mut self, ttl: i64) -> DiscoveryResult<LeaseId>;

    /// Start renewing `lease`; the stream closes once the lease cannot be renewed.
    async fn keep_alive(&mut self, lease: LeaseId) -> DiscoveryResult<KeepAliveStream>;

    async fn revoke_lease(&mut self, lease: LeaseId) -> DiscoveryResult<()>;

    /// Write `key`, optionally bound to `lease`.
    async fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> DiscoveryResult<()>;

    async fn get_prefix(&mut self, prefix: &str) -> DiscoveryResult<PrefixSnapshot>;

    async fn delete(&mut self, key: &str) -> DiscoveryResult<()>;

    /// Subscribe to changes under `prefix`, starting at `start_revision` when given.
    async fn watch_prefix(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> DiscoveryResult<WatchStream>;

    /// Stop every subscription opened through this client and release it.
    async fn close(&mut self);
}

/// Dials a fresh store client.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> DiscoveryResult<Box<dyn DiscoveryStore>>;
}

/// Run a store round-trip with a deadline.
///
/// # Errors
/// Returns `StoreUnavailable` when the deadline elapses, or the error of `fut`.
pub async fn with_deadline<T, F>(op: &'static str, deadline: Duration, fut: F) -> DiscoveryResult<T>
where
    F: Future<Output = DiscoveryResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::store(
            op,
            format!("deadline of {}ms exceeded", deadline.as_millis()),
        )),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn with_deadline_times_out() {
        let result: DiscoveryResult<()> =
            with_deadline("get", Duration::from_secs(1), std::future::pending()).await;
        match result {
            Err(DiscoveryError::StoreUnavailable { op, .. }) => assert_eq!(op, "get"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn with_deadline_passes_result_through() {
        let result = with_deadline("get", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
