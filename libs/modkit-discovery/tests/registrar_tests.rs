#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Registrar behavior against the in-memory store.

use std::time::Duration;

use modkit_discovery::record::decode;
use modkit_discovery::{
    DiscoveryError, EtcdConfig, LeaseId, MemoryStore, Registrar, RegistrarOptions, ServiceRecord,
};
use tokio::sync::watch;

fn options() -> RegistrarOptions {
    RegistrarOptions {
        key_prefix: "/services".to_owned(),
        rw_timeout: Duration::from_secs(3),
    }
}

fn user_record() -> ServiceRecord {
    ServiceRecord::new("user", "10.0.0.1:9000").with_ttl(10)
}

async fn next_lease(leases: &mut watch::Receiver<Option<LeaseId>>, old: LeaseId) -> LeaseId {
    loop {
        leases.changed().await.unwrap();
        if let Some(id) = *leases.borrow_and_update()
            && id != old
        {
            return id;
        }
    }
}

/// Renew `lease` every 3s, well inside the 10s TTL, for `total`.
async fn keep_renewing(store: &MemoryStore, lease: LeaseId, total: Duration) {
    let step = Duration::from_secs(3);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        tokio::time::sleep(step).await;
        assert!(store.renew(lease), "lease {lease} vanished");
        elapsed += step;
    }
}

#[tokio::test(start_paused = true)]
async fn register_publishes_record_bound_to_lease() {
    let store = MemoryStore::new();
    let registrar = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap();

    assert_eq!(registrar.key(), "/services/user/v1/10.0.0.1:9000");
    let lease = registrar.lease_id().expect("lease after register");
    assert_eq!(store.lease_of(registrar.key()), Some(lease));

    let stored = decode(&store.value(registrar.key()).unwrap()).unwrap();
    assert_eq!(stored, user_record());

    registrar.close().await;
}

#[tokio::test(start_paused = true)]
async fn lease_loss_triggers_single_reregistration() {
    let store = MemoryStore::new();
    let registrar = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap();
    let key = registrar.key().to_owned();
    let first = registrar.lease_id().unwrap();
    let mut leases = registrar.subscribe();

    assert!(store.expire_lease(first));

    let second = tokio::time::timeout(Duration::from_secs(10), next_lease(&mut leases, first))
        .await
        .expect("re-registered within one TTL");
    assert_ne!(second, first);
    assert_eq!(store.lease_of(&key), Some(second));
    assert_eq!(store.grant_count(), 2);

    // A healthy heartbeat must not cause further registrations.
    keep_renewing(&store, second, Duration::from_secs(35)).await;
    assert_eq!(store.grant_count(), 2);
    assert_eq!(registrar.lease_id(), Some(second));

    registrar.close().await;
}

#[tokio::test(start_paused = true)]
async fn renewals_keep_the_original_lease() {
    let store = MemoryStore::new();
    let registrar = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap();
    let lease = registrar.lease_id().unwrap();

    keep_renewing(&store, lease, Duration::from_secs(60)).await;

    assert_eq!(store.grant_count(), 1);
    assert_eq!(registrar.lease_id(), Some(lease));
    assert_eq!(store.lease_of(registrar.key()), Some(lease));

    registrar.close().await;
}

#[tokio::test(start_paused = true)]
async fn silent_heartbeat_triggers_reregistration() {
    let store = MemoryStore::new();
    let registrar = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap();
    let key = registrar.key().to_owned();
    let first = registrar.lease_id().unwrap();
    let mut leases = registrar.subscribe();

    // No renewals: the stream stays open but silent past the TTL.
    let second = tokio::time::timeout(Duration::from_secs(15), next_lease(&mut leases, first))
        .await
        .expect("stalled heartbeat detected within one watchdog period");

    assert_eq!(store.grant_count(), 2);
    assert_eq!(store.active_leases(), vec![second]);
    assert_eq!(store.lease_of(&key), Some(second));

    registrar.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_deletes_key_and_revokes_lease() {
    let store = MemoryStore::new();
    let registrar = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap();
    let key = registrar.key().to_owned();

    registrar.close().await;

    assert!(store.value(&key).is_none());
    assert!(store.active_leases().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_registrar_still_cleans_up() {
    let store = MemoryStore::new();
    let registrar = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap();
    let key = registrar.key().to_owned();

    drop(registrar);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(store.value(&key).is_none());
    assert!(store.active_leases().is_empty());
}

#[tokio::test(start_paused = true)]
async fn outage_retries_with_backoff_then_recovers() {
    let store = MemoryStore::new();
    let registrar = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap();
    let key = registrar.key().to_owned();
    let first = registrar.lease_id().unwrap();
    let mut leases = registrar.subscribe();

    store.set_unavailable(true);
    assert!(store.expire_lease(first));
    tokio::time::sleep(Duration::from_secs(60)).await;

    // 1s, 2s, 4s, 8s, then every 10s: a handful of attempts, not a hot loop.
    let rejected = store.rejected_count();
    assert!(
        (4..=20).contains(&rejected),
        "unexpected number of store calls during outage: {rejected}"
    );
    assert_eq!(registrar.lease_id(), None);
    assert!(store.value(&key).is_none());

    store.set_unavailable(false);
    let second = tokio::time::timeout(Duration::from_secs(11), next_lease(&mut leases, first))
        .await
        .expect("recovered after the outage");
    assert_eq!(store.lease_of(&key), Some(second));

    registrar.close().await;
}

#[tokio::test]
async fn register_fails_when_store_unreachable() {
    let store = MemoryStore::new();
    store.set_unavailable(true);

    let err = Registrar::register_with(&store, user_record(), options())
        .await
        .unwrap_err();

    assert!(matches!(err, DiscoveryError::StoreUnavailable { .. }));
    assert!(store.keys().is_empty());
    assert_eq!(store.grant_count(), 0);
}

#[tokio::test]
async fn register_rejects_invalid_record() {
    let store = MemoryStore::new();
    let err = Registrar::register_with(&store, user_record().with_ttl(0), options())
        .await
        .unwrap_err();

    assert!(matches!(err, DiscoveryError::InvalidConfig(_)));
    assert_eq!(store.grant_count(), 0);
}

#[tokio::test]
async fn register_requires_register_section() {
    let err = Registrar::register(&EtcdConfig::default()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::InvalidConfig(_)));
}
