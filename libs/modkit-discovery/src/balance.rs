//! Feeds resolver snapshots into a tonic balance channel.
//!
//! The resolver always pushes full address sets; [`BalancedConn`] diffs each
//! set against the endpoints it already handed to the channel and forwards only
//! the inserts and removals. tonic balances with power-of-two-choices and does
//! not look at `weight`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};

use crate::config::DomainConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::registry::ResolverRegistry;
use crate::resolver::{ClientConn, Resolver, ResolverState};

/// Endpoint settings for channels built by [`connect_balanced`].
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub connect_timeout: Duration,
    /// Per-request deadline, none by default.
    pub rpc_timeout: Option<Duration>,
    /// Spread calls over every address; otherwise stick to one.
    pub load_balance: bool,
    /// Capacity of the endpoint change queue.
    pub buffer: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: None,
            load_balance: true,
            buffer: 1024,
        }
    }
}

impl From<&DomainConfig> for BalanceConfig {
    fn from(domain: &DomainConfig) -> Self {
        Self {
            load_balance: domain.load_balance,
            ..Self::default()
        }
    }
}

fn build_endpoint(addr: &str, cfg: &BalanceConfig) -> Result<Endpoint, tonic::transport::Error> {
    let mut endpoint = Endpoint::from_shared(format!("http://{addr}"))?
        .connect_timeout(cfg.connect_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);
    if let Some(timeout) = cfg.rpc_timeout {
        endpoint = endpoint.timeout(timeout);
    }
    Ok(endpoint)
}

/// [`ClientConn`] that drives a tonic balance channel.
pub struct BalancedConn {
    changes: mpsc::Sender<Change<String, Endpoint>>,
    active: Mutex<HashSet<String>>,
    cfg: BalanceConfig,
}

impl BalancedConn {
    #[must_use]
    pub fn new(changes: mpsc::Sender<Change<String, Endpoint>>, cfg: BalanceConfig) -> Self {
        Self {
            changes,
            active: Mutex::new(HashSet::new()),
            cfg,
        }
    }

    /// Addresses currently inserted into the channel.
    #[must_use]
    pub fn active(&self) -> Vec<String> {
        let mut active: Vec<String> = self.active.lock().iter().cloned().collect();
        active.sort();
        active
    }

    fn send(&self, change: Change<String, Endpoint>) -> DiscoveryResult<()> {
        self.changes
            .try_send(change)
            .map_err(|e| DiscoveryError::Publish(e.to_string()))
    }
}

impl ClientConn for BalancedConn {
    fn update_state(&self, state: ResolverState) -> DiscoveryResult<()> {
        let mut active = self.active.lock();

        let wanted: HashSet<String> = if self.cfg.load_balance {
            state.addresses.into_iter().map(|a| a.addr).collect()
        } else {
            // Pick-first, but keep the current pick while it is still listed.
            let current = state
                .addresses
                .iter()
                .find(|a| active.contains(&a.addr))
                .or_else(|| state.addresses.first());
            current.map(|a| a.addr.clone()).into_iter().collect()
        };

        let removed: Vec<String> = active.difference(&wanted).cloned().collect();
        for addr in removed {
            self.send(Change::Remove(addr.clone()))?;
            active.remove(&addr);
            tracing::debug!(addr = %addr, "endpoint removed");
        }

        for addr in wanted {
            if active.contains(&addr) {
                continue;
            }
            let endpoint = match build_endpoint(&addr, &self.cfg) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "skipping unusable address");
                    continue;
                }
            };
            self.send(Change::Insert(addr.clone(), endpoint))?;
            tracing::debug!(addr = %addr, "endpoint added");
            active.insert(addr);
        }

        Ok(())
    }
}

/// Load-balanced channel kept up to date by a resolver.
pub struct BalancedChannel {
    channel: Channel,
    conn: Arc<BalancedConn>,
    resolver: Box<dyn Resolver>,
    target: String,
}

impl BalancedChannel {
    /// Channel to hand to generated gRPC clients. Cheap to clone.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Addresses currently inserted into the channel.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.conn.active()
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn resolve_now(&self) {
        self.resolver.resolve_now();
    }

    /// Stop resolution. The channel keeps its last endpoints until dropped.
    pub async fn close(self) {
        self.resolver.close().await;
        tracing::debug!(target = %self.target, "balanced channel closed");
    }
}

/// Resolve `target` through `registry` and return a channel balanced over its
/// addresses.
///
/// # Errors
/// Fails when the target is invalid, its scheme is unknown, or the resolver
/// cannot be built.
pub async fn connect_balanced(
    registry: &ResolverRegistry,
    target: &str,
    cfg: BalanceConfig,
) -> DiscoveryResult<BalancedChannel> {
    let (channel, changes) = Channel::balance_channel::<String>(cfg.buffer);
    let conn = Arc::new(BalancedConn::new(changes, cfg));
    let pool: Arc<dyn ClientConn> = conn.clone();
    let resolver = registry.build(target, pool).await?;
    tracing::info!(target = %target, "balanced channel ready");
    Ok(BalancedChannel {
        channel,
        conn,
        resolver,
        target: target.to_owned(),
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::address::Address;

    fn state(addrs: &[&str]) -> ResolverState {
        ResolverState {
            addresses: addrs.iter().map(|a| Address::new(*a, 1)).collect(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Change<String, Endpoint>>) -> (Vec<String>, Vec<String>) {
        let mut inserted = Vec::new();
        let mut removed = Vec::new();
        while let Ok(change) = rx.try_recv() {
            match change {
                Change::Insert(addr, _) => inserted.push(addr),
                Change::Remove(addr) => removed.push(addr),
            }
        }
        inserted.sort();
        removed.sort();
        (inserted, removed)
    }

    #[tokio::test]
    async fn forwards_only_differences() {
        let (tx, mut rx) = mpsc::channel(16);
        let conn = BalancedConn::new(tx, BalanceConfig::default());

        conn.update_state(state(&["10.0.0.1:9000", "10.0.0.2:9000"])).unwrap();
        let (inserted, removed) = drain(&mut rx);
        assert_eq!(inserted, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);
        assert!(removed.is_empty());

        conn.update_state(state(&["10.0.0.2:9000", "10.0.0.3:9000"])).unwrap();
        let (inserted, removed) = drain(&mut rx);
        assert_eq!(inserted, vec!["10.0.0.3:9000"]);
        assert_eq!(removed, vec!["10.0.0.1:9000"]);
        assert_eq!(conn.active(), vec!["10.0.0.2:9000", "10.0.0.3:9000"]);
    }

    #[tokio::test]
    async fn pick_first_sticks_to_current_address() {
        let (tx, mut rx) = mpsc::channel(16);
        let cfg = BalanceConfig {
            load_balance: false,
            ..BalanceConfig::default()
        };
        let conn = BalancedConn::new(tx, cfg);

        conn.update_state(state(&["10.0.0.1:9000", "10.0.0.2:9000"])).unwrap();
        assert_eq!(drain(&mut rx).0, vec!["10.0.0.1:9000"]);

        conn.update_state(state(&["10.0.0.3:9000", "10.0.0.1:9000"])).unwrap();
        let (inserted, removed) = drain(&mut rx);
        assert!(inserted.is_empty());
        assert!(removed.is_empty());

        conn.update_state(state(&["10.0.0.3:9000"])).unwrap();
        let (inserted, removed) = drain(&mut rx);
        assert_eq!(inserted, vec!["10.0.0.3:9000"]);
        assert_eq!(removed, vec!["10.0.0.1:9000"]);
    }

    #[tokio::test]
    async fn full_queue_reports_publish_error() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = BalancedConn::new(tx, BalanceConfig::default());
        let err = conn
            .update_state(state(&["10.0.0.1:9000", "10.0.0.2:9000"]))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Publish(_)));
        assert_eq!(conn.active().len(), 1);
    }
}
