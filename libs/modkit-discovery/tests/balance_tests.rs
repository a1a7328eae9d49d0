#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Resolver-driven balance channels over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use modkit_discovery::record::encode;
use modkit_discovery::{
    BalanceConfig, BalancedChannel, DiscoveryError, EtcdResolverBuilder, MemoryStore,
    ResolverOptions, ResolverRegistry, ServiceRecord, connect_balanced,
};

const PREFIX: &str = "/services";

fn seed(store: &MemoryStore, addr: &str) -> String {
    let record = ServiceRecord::new("user", addr);
    let key = record.key(PREFIX);
    store.insert(key.clone(), encode(&record).unwrap());
    key
}

fn registry(store: &MemoryStore) -> ResolverRegistry {
    let mut registry = ResolverRegistry::new();
    registry.register(Arc::new(EtcdResolverBuilder::with_connector(
        Arc::new(store.clone()),
        ResolverOptions {
            key_prefix: PREFIX.to_owned(),
            rw_timeout: Duration::from_secs(3),
            resync_interval: Duration::from_secs(60),
        },
    )));
    registry
}

async fn wait_for_endpoints(channel: &BalancedChannel, expected: &[&str]) {
    let expected: Vec<String> = expected.iter().map(|a| (*a).to_owned()).collect();
    let result = tokio::time::timeout(Duration::from_secs(1), async {
        while channel.endpoints() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "endpoints {:?}, expected {expected:?}",
        channel.endpoints()
    );
}

#[tokio::test]
async fn watch_events_reach_the_balance_channel() {
    let store = MemoryStore::new();
    let first = seed(&store, "10.0.0.1:9000");
    let registry = registry(&store);

    let balanced = match connect_balanced(&registry, "etcd:///user", BalanceConfig::default()).await
    {
        Ok(balanced) => balanced,
        Err(e) => panic!("connect_balanced failed: {e}"),
    };
    assert_eq!(balanced.target(), "etcd:///user");
    let channel = balanced.channel();
    drop(channel);
    assert_eq!(balanced.endpoints(), vec!["10.0.0.1:9000".to_owned()]);

    seed(&store, "10.0.0.2:9000");
    wait_for_endpoints(&balanced, &["10.0.0.1:9000", "10.0.0.2:9000"]).await;

    assert!(store.remove(&first));
    wait_for_endpoints(&balanced, &["10.0.0.2:9000"]).await;

    balanced.close().await;
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn pick_first_follows_removal_of_current_address() {
    let store = MemoryStore::new();
    let first = seed(&store, "10.0.0.1:9000");
    seed(&store, "10.0.0.2:9000");
    let registry = registry(&store);
    let cfg = BalanceConfig {
        load_balance: false,
        ..BalanceConfig::default()
    };

    let Ok(balanced) = connect_balanced(&registry, "etcd:///user", cfg).await else {
        panic!("connect_balanced failed");
    };
    assert_eq!(balanced.endpoints().len(), 1);
    let current = balanced.endpoints().remove(0);

    let other = if current == "10.0.0.1:9000" {
        assert!(store.remove(&first));
        "10.0.0.2:9000"
    } else {
        assert!(store.remove(&ServiceRecord::new("user", "10.0.0.2:9000").key(PREFIX)));
        "10.0.0.1:9000"
    };
    wait_for_endpoints(&balanced, &[other]).await;

    balanced.close().await;
}

#[tokio::test]
async fn unknown_scheme_is_rejected() {
    let store = MemoryStore::new();
    let registry = registry(&store);

    let err = connect_balanced(&registry, "dns:///user", BalanceConfig::default())
        .await
        .err()
        .expect("dns scheme is not registered");
    assert!(matches!(err, DiscoveryError::UnknownScheme { .. }));
}
