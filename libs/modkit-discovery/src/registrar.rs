//! Lease-based self-registration.
//!
//! A [`Registrar`] publishes one [`ServiceRecord`] under a key bound to a store
//! lease and keeps that lease alive from a background supervisor task. When the
//! store drops the lease, the supervisor registers again from scratch: a dropped
//! lease cannot be resumed. A watchdog ticking once per TTL treats a heartbeat
//! stream that stayed silent for a whole TTL as a lost lease, since the store
//! has expired the lease by then. Failed attempts are spaced by a capped
//! exponential backoff.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::EtcdConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::etcd::EtcdConnector;
use crate::record::{self, ServiceRecord};
use crate::store::{
    DiscoveryStore, KeepAlive, KeepAliveStream, LeaseId, StoreConnector, with_deadline,
};

const RETRY_BASE: Duration = Duration::from_secs(1);

/// Settings the registrar needs beyond the record itself.
#[derive(Debug, Clone)]
pub struct RegistrarOptions {
    pub key_prefix: String,
    /// Deadline for every unary store call.
    pub rw_timeout: Duration,
}

impl From<&EtcdConfig> for RegistrarOptions {
    fn from(cfg: &EtcdConfig) -> Self {
        Self {
            key_prefix: cfg.key_prefix.clone(),
            rw_timeout: cfg.rw_timeout(),
        }
    }
}

/// Handle to a registered service instance.
///
/// Dropping the handle without calling [`Registrar::close`] still cancels the
/// supervisor, which deletes the key and revokes the lease on its way out.
#[derive(Debug)]
pub struct Registrar {
    key: String,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    lease_rx: watch::Receiver<Option<LeaseId>>,
}

impl Registrar {
    /// Register the instance described by `conf.register` in etcd.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when the configuration is invalid or has no
    /// `register` section, and `StoreUnavailable` when etcd cannot be reached or
    /// the lease grant or initial write fails.
    pub async fn register(conf: &EtcdConfig) -> DiscoveryResult<Self> {
        conf.validate()?;
        let register = conf.register.as_ref().ok_or_else(|| {
            DiscoveryError::InvalidConfig("etcd.register section is required".to_owned())
        })?;
        let connector = EtcdConnector::new(conf);
        Self::register_with(
            &connector,
            ServiceRecord::from(register),
            RegistrarOptions::from(conf),
        )
        .await
    }

    /// Register `record` through any store connector.
    ///
    /// Returns once the record is written and bound to a live lease.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an invalid record, and `StoreUnavailable` or
    /// `LeaseLost` when connecting, granting the lease, starting the heartbeat
    /// or writing the record fails. Nothing stays registered on error.
    pub async fn register_with(
        connector: &dyn StoreConnector,
        record: ServiceRecord,
        options: RegistrarOptions,
    ) -> DiscoveryResult<Self> {
        record.validate()?;
        let key = record.key(&options.key_prefix);
        let value = record::encode(&record)?;
        let store = connector.connect().await?;
        let (lease_tx, lease_rx) = watch::channel(None);
        let ttl = Duration::from_secs(record.ttl.unsigned_abs());

        let mut supervisor = Supervisor {
            store,
            record,
            key: key.clone(),
            value,
            ttl,
            rw_timeout: options.rw_timeout,
            lease: None,
            heartbeat: None,
            last_beat: Instant::now(),
            backoff: Backoff::new(RETRY_BASE, ttl),
            retry_at: None,
            lease_tx,
        };

        if let Err(e) = supervisor.register().await {
            supervisor.store.close().await;
            return Err(e);
        }

        tracing::info!(
            service = %supervisor.record.name,
            key = %key,
            lease_id = ?supervisor.lease,
            ttl_secs = supervisor.record.ttl,
            "service registered"
        );

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(supervisor.run(cancel.clone()));

        Ok(Self {
            key,
            cancel,
            worker: Some(worker),
            lease_rx,
        })
    }

    /// Registration key of this instance.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease currently backing the record, `None` while re-registering.
    #[must_use]
    pub fn lease_id(&self) -> Option<LeaseId> {
        *self.lease_rx.borrow()
    }

    /// Observe lease changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<LeaseId>> {
        self.lease_rx.clone()
    }

    /// Stop the supervisor, delete the key and revoke the lease.
    ///
    /// Cleanup failures are logged, never returned.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.await
        {
            tracing::error!(key = %self.key, error = %e, "registrar worker failed");
        }
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    store: Box<dyn DiscoveryStore>,
    record: ServiceRecord,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    rw_timeout: Duration,
    lease: Option<LeaseId>,
    heartbeat: Option<KeepAliveStream>,
    last_beat: Instant,
    backoff: Backoff,
    retry_at: Option<Instant>,
    lease_tx: watch::Sender<Option<LeaseId>>,
}

impl Supervisor {
    /// Grant a lease, start its heartbeat and write the record bound to it.
    async fn register(&mut self) -> DiscoveryResult<()> {
        let lease = with_deadline(
            "lease grant",
            self.rw_timeout,
            self.store.grant_lease(self.record.ttl),
        )
        .await?;

        match self.attach(lease).await {
            Ok(heartbeat) => {
                self.lease = Some(lease);
                self.heartbeat = Some(heartbeat);
                self.last_beat = Instant::now();
                self.lease_tx.send_replace(Some(lease));
                Ok(())
            }
            Err(e) => {
                self.revoke(lease).await;
                Err(e)
            }
        }
    }

    async fn attach(&mut self, lease: LeaseId) -> DiscoveryResult<KeepAliveStream> {
        let heartbeat =
            with_deadline("keep alive", self.rw_timeout, self.store.keep_alive(lease)).await?;
        with_deadline(
            "put",
            self.rw_timeout,
            self.store.put(&self.key, self.value.clone(), Some(lease)),
        )
        .await?;
        Ok(heartbeat)
    }

    async fn revoke(&mut self, lease: LeaseId) {
        if let Err(e) =
            with_deadline("lease revoke", self.rw_timeout, self.store.revoke_lease(lease)).await
        {
            tracing::debug!(key = %self.key, lease_id = lease, error = %e, "lease revoke failed");
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut watchdog = tokio::time::interval_at(Instant::now() + self.ttl, self.ttl);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                beat = next_heartbeat(&mut self.heartbeat) => match beat {
                    Some(KeepAlive { lease, ttl }) => {
                        self.last_beat = Instant::now();
                        tracing::trace!(key = %self.key, lease_id = lease, ttl_secs = ttl, "lease renewed");
                    }
                    None => self.on_lease_lost().await,
                },
                () = retry_due(self.retry_at) => {
                    self.retry_at = None;
                    self.reregister().await;
                }
                _ = watchdog.tick() => self.on_watchdog().await,
            }
        }

        self.shutdown().await;
    }

    async fn on_watchdog(&mut self) {
        if self.heartbeat.is_some() {
            let silent = self.last_beat.elapsed();
            if silent >= self.ttl {
                tracing::warn!(
                    key = %self.key,
                    silent_ms = u64::try_from(silent.as_millis()).unwrap_or(u64::MAX),
                    "heartbeat stalled"
                );
                self.on_lease_lost().await;
            }
        } else if self.retry_at.is_none() {
            // Every failed attempt schedules a retry; this only covers a lost one.
            tracing::debug!(key = %self.key, "no heartbeat stream, forcing registration");
            self.reregister().await;
        }
    }

    async fn on_lease_lost(&mut self) {
        self.heartbeat = None;
        self.lease_tx.send_replace(None);
        let lost = self.lease.take();
        tracing::warn!(
            service = %self.record.name,
            key = %self.key,
            lease_id = ?lost,
            "lease lost, registering again"
        );
        if let Some(lease) = lost {
            self.revoke(lease).await;
        }
        if self.retry_at.is_none() {
            self.reregister().await;
        }
    }

    async fn reregister(&mut self) {
        match self.register().await {
            Ok(()) => {
                self.backoff.reset();
                tracing::info!(
                    service = %self.record.name,
                    key = %self.key,
                    lease_id = ?self.lease,
                    "service re-registered"
                );
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                self.retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    service = %self.record.name,
                    key = %self.key,
                    attempt = self.backoff.attempts(),
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "re-registration failed"
                );
            }
        }
    }

    async fn shutdown(mut self) {
        self.heartbeat = None;
        if let Err(e) = with_deadline("delete", self.rw_timeout, self.store.delete(&self.key)).await
        {
            tracing::warn!(key = %self.key, error = %e, "failed to delete registration key");
        }
        if let Some(lease) = self.lease.take()
            && let Err(e) =
                with_deadline("lease revoke", self.rw_timeout, self.store.revoke_lease(lease))
                    .await
        {
            tracing::warn!(key = %self.key, lease_id = lease, error = %e, "failed to revoke lease");
        }
        self.store.close().await;
        self.lease_tx.send_replace(None);
        tracing::info!(service = %self.record.name, key = %self.key, "service deregistered");
    }
}

async fn next_heartbeat(heartbeat: &mut Option<KeepAliveStream>) -> Option<KeepAlive> {
    match heartbeat {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
