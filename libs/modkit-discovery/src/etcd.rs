//! etcd-backed coordination store.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EtcdConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::store::{
    DiscoveryStore, KeepAlive, KeepAliveStream, KeyValue, LeaseId, PrefixSnapshot,
    StoreConnector, WatchEvent, WatchStream,
};

const STREAM_BUFFER: usize = 64;
/// Keeps renewals well inside even a one-second TTL.
const MIN_RENEW_PAUSE: Duration = Duration::from_millis(300);

/// Dials etcd clients from an [`EtcdConfig`].
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    endpoints: Vec<String>,
    dial_timeout: Duration,
}

impl EtcdConnector {
    #[must_use]
    pub fn new(cfg: &EtcdConfig) -> Self {
        Self {
            endpoints: cfg.addrs.clone(),
            dial_timeout: cfg.dial_timeout(),
        }
    }
}

#[async_trait]
impl StoreConnector for EtcdConnector {
    async fn connect(&self) -> DiscoveryResult<Box<dyn DiscoveryStore>> {
        // No per-request timeout on the client: it would also cut the
        // keepalive and watch streams. Unary calls are bounded by the caller.
        let options = ConnectOptions::new()
            .with_connect_timeout(self.dial_timeout)
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        let client = tokio::time::timeout(
            self.dial_timeout,
            Client::connect(self.endpoints.as_slice(), Some(options)),
        )
        .await
        .map_err(|_| DiscoveryError::store("connect", "dial timeout elapsed"))?
        .map_err(|e| DiscoveryError::store("connect", e))?;

        tracing::debug!(endpoints = ?self.endpoints, "connected to etcd");

        Ok(Box::new(EtcdStore {
            client,
            cancel: CancellationToken::new(),
        }))
    }
}

/// One exclusively owned etcd client plus the pump tasks of its streams.
pub struct EtcdStore {
    client: Client,
    cancel: CancellationToken,
}

#[async_trait]
impl DiscoveryStore for EtcdStore {
    async fn grant_lease(&mut self, ttl: i64) -> DiscoveryResult<LeaseId> {
        let resp = self
            .client
            .lease_grant(ttl, None)
            .await
            .map_err(|e| DiscoveryError::store("lease grant", e))?;
        Ok(resp.id())
    }

    async fn keep_alive(&mut self, lease: LeaseId) -> DiscoveryResult<KeepAliveStream> {
        let (mut keeper, mut responses) = self
            .client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| DiscoveryError::store("keep alive", e))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(lease_id = lease, error = %e, "lease keepalive request failed");
                    break;
                }

                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = responses.message() => message,
                };

                let ttl = match message {
                    Ok(Some(resp)) if resp.ttl() > 0 => resp.ttl(),
                    Ok(Some(_)) => {
                        tracing::debug!(lease_id = lease, "lease expired on the store");
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(lease_id = lease, error = %e, "lease keepalive stream failed");
                        break;
                    }
                };

                if tx.send(KeepAlive { lease, ttl }).await.is_err() {
                    break;
                }

                // Renew at a third of the remaining TTL.
                let pause = (Duration::from_secs(u64::try_from(ttl).unwrap_or(0)) / 3)
                    .max(MIN_RENEW_PAUSE);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(pause) => {}
                }
            }
        });

        Ok(rx)
    }

    async fn revoke_lease(&mut self, lease: LeaseId) -> DiscoveryResult<()> {
        self.client
            .lease_revoke(lease)
            .await
            .map_err(|e| DiscoveryError::store("lease revoke", e))?;
        Ok(())
    }

    async fn put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> DiscoveryResult<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client
            .put(key, value, options)
            .await
            .map_err(|e| DiscoveryError::store("put", e))?;
        Ok(())
    }

    async fn get_prefix(&mut self, prefix: &str) -> DiscoveryResult<PrefixSnapshot> {
        let resp = self
            .client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::store("get", e))?;

        let revision = resp.header().map_or(0, |h| h.revision());
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect();

        Ok(PrefixSnapshot { kvs, revision })
    }

    async fn delete(&mut self, key: &str) -> DiscoveryResult<()> {
        self.client
            .delete(key, None)
            .await
            .map_err(|e| DiscoveryError::store("delete", e))?;
        Ok(())
    }

    async fn watch_prefix(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> DiscoveryResult<WatchStream> {
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }

        let (mut watcher, mut stream) = self
            .client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| DiscoveryError::store("watch", e))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = self.cancel.child_token();
        let prefix = prefix.to_owned();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => {
                        if let Err(e) = watcher.cancel().await {
                            tracing::debug!(prefix = %prefix, error = %e, "watch cancel failed");
                        }
                        break;
                    }
                    message = stream.message() => message,
                };

                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "watch stream failed");
                        break;
                    }
                };

                if resp.canceled() {
                    tracing::warn!(prefix = %prefix, "watch canceled by the store");
                    break;
                }

                let events: Vec<WatchEvent> = resp
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let kv = event.kv()?;
                        let key = String::from_utf8_lossy(kv.key()).into_owned();
                        Some(match event.event_type() {
                            EventType::Put => WatchEvent::Put(KeyValue {
                                key,
                                value: kv.value().to_vec(),
                            }),
                            EventType::Delete => WatchEvent::Delete { key },
                        })
                    })
                    .collect();

                if !events.is_empty() && tx.send(events).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for EtcdStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
