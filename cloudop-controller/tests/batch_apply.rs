//! Integration tests for one-shot batch application.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cloudop_api::{MemoryStore, Object, ObjectStore, ProvisioningState};
use cloudop_controller::clients::{ClientDeps, ClientHandle, ResourceClient, SyncResourceClient, secret};
use cloudop_controller::{
    ApplyMode, BatchApplier, EnsureStrategy, Error, KindEntry, MemoryProvider, Registry, Shutdown,
};
use serde_json::json;

use common::*;

/// Sync client that records how many calls overlap.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

struct SlowClient {
    gauge: Arc<Gauge>,
}

#[async_trait]
impl ResourceClient for SlowClient {
    async fn authorize(&self, _object: &Object) -> cloudop_controller::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SyncResourceClient for SlowClient {
    async fn ensure(&self, object: &mut Object) -> cloudop_controller::Result<()> {
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        self.gauge.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        object.status.provisioning_state = Some(ProvisioningState::Succeeded);
        Ok(())
    }

    async fn delete(&self, _object: &mut Object) -> cloudop_controller::Result<()> {
        Ok(())
    }
}

fn slow_registry(gauge: Arc<Gauge>) -> Arc<Registry> {
    Arc::new(
        Registry::builder()
            .register(KindEntry::new("Slow", EnsureStrategy::Sync, move |_| {
                Ok(ClientHandle::Sync(Arc::new(SlowClient {
                    gauge: gauge.clone(),
                })))
            }))
            .build(),
    )
}

fn slow(name: &str) -> Object {
    Object::new("Slow", "default", name, json!({}))
}

fn applier(provider: Arc<MemoryProvider>, store: Arc<dyn ObjectStore>) -> BatchApplier {
    let deps = ClientDeps::new(provider).with_store(store);
    BatchApplier::new(Arc::new(Registry::standard()), deps, fast_batch_config(5))
}

#[tokio::test(start_paused = true)]
async fn test_worker_ceiling_is_respected() {
    let gauge = Arc::new(Gauge::default());
    let deps = ClientDeps::new(Arc::new(MemoryProvider::new()));
    let applier = BatchApplier::new(slow_registry(gauge.clone()), deps, fast_batch_config(5));

    let objects: Vec<Object> = (0..10).map(|i| slow(&format!("obj-{}", i))).collect();
    let summary = applier
        .apply(objects, ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap();

    assert_eq!(summary.applied.len(), 10);
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 10);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 5);
    assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_single_worker_serializes() {
    let gauge = Arc::new(Gauge::default());
    let deps = ClientDeps::new(Arc::new(MemoryProvider::new()));
    let applier = BatchApplier::new(slow_registry(gauge.clone()), deps, fast_batch_config(1));

    let objects: Vec<Object> = (0..4).map(|i| slow(&format!("obj-{}", i))).collect();
    applier
        .apply(objects, ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap();
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_collected_and_others_finish() {
    let provider = Arc::new(MemoryProvider::new());
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let objects = vec![
        Object::new("ResourceGroup", "default", "bad-1", json!({ "location": 1 })),
        resource_group("rg-good"),
        Object::new("GeneratedSecret", "default", "bad-2", json!({ "length": 0, "keys": ["k"] })),
    ];

    let err = applier(provider.clone(), store)
        .apply(objects, ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("2 of 3 objects failed"));
    let Error::Batch {
        total,
        failures,
        summary,
    } = err
    else {
        panic!("expected batch error");
    };
    assert_eq!(total, 3);
    assert_eq!(summary.applied.len(), 1);
    assert_eq!(summary.applied[0].name, "rg-good");
    let mut names: Vec<&str> = failures.iter().map(|(r, _)| r.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["bad-1", "bad-2"]);
    assert!(failures.iter().all(|(_, e)| matches!(e, Error::TypeMismatch { .. })));
    assert!(provider.resource(&resource_group_id("rg-good")).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_gives_up_after_max_steps() {
    let provider = Arc::new(MemoryProvider::new());
    provider.deny_authorization(SUBSCRIPTION, usize::MAX);

    let err = applier(provider.clone(), Arc::new(MemoryStore::new()))
        .apply(vec![resource_group("rg-test")], ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap_err();

    let Error::Batch { failures, .. } = err else {
        panic!("expected batch error");
    };
    // One initial attempt plus one per backoff step.
    assert!(matches!(failures[0].1, Error::Timeout { attempts: 9 }));
    assert_eq!(provider.calls().authorize, 9);
    assert_eq!(provider.calls().put, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_provider_errors_are_retried() {
    let provider = Arc::new(MemoryProvider::new().with_polls(0));
    provider.fail_next(cloudop_controller::provider::ProviderError::Conflict(
        "another operation is in progress".into(),
    ));
    provider.fail_next(cloudop_controller::provider::ProviderError::Throttled(
        "too many requests".into(),
    ));

    let summary = applier(provider.clone(), Arc::new(MemoryStore::new()))
        .apply(vec![resource_group("rg-test")], ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap();
    assert_eq!(summary.applied.len(), 1);
    assert_eq!(provider.calls().put, 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_only_kind_materializes_keys() {
    let provider = Arc::new(
        MemoryProvider::new()
            .with_polls(2)
            .status_only_for("/providers/Microsoft.Cache/Redis/"),
    );
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let applier = applier(provider.clone(), store.clone());

    applier
        .apply(vec![redis_cache("cache-test")], ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap();

    let keys = secret::read(store.as_ref(), "default", "cache-test-keys")
        .await
        .unwrap()
        .expect("access keys secret");
    assert_eq!(keys.data["primaryKey"].len(), 44);
    assert_eq!(keys.data["secondaryKey"].len(), 44);
    assert_eq!(keys.data["hostName"], "cache-test.redis.cache.windows.net");
    assert_eq!(provider.calls().poll, 0);
    assert_eq!(provider.calls().put, 1);

    applier
        .apply(vec![redis_cache("cache-test")], ApplyMode::Delete, &Shutdown::never())
        .await
        .unwrap();
    assert!(secret::read(store.as_ref(), "default", "cache-test-keys").await.unwrap().is_none());
    assert_eq!(provider.calls().delete, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_then_delete_batch() {
    let provider = Arc::new(MemoryProvider::new().with_polls(2));
    let applier = applier(provider.clone(), Arc::new(MemoryStore::new()));
    let batch = || vec![resource_group("rg-a"), resource_group("rg-b"), generated_secret("pw")];

    let summary = applier
        .apply(batch(), ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap();
    assert_eq!(summary.applied.len(), 3);
    assert!(provider.resource(&resource_group_id("rg-a")).is_some());

    // Nothing to change on a second run.
    applier
        .apply(batch(), ApplyMode::Ensure, &Shutdown::never())
        .await
        .unwrap();
    assert_eq!(provider.calls().put, 2);

    applier
        .apply(batch(), ApplyMode::Delete, &Shutdown::never())
        .await
        .unwrap();
    assert!(provider.resource(&resource_group_id("rg-a")).is_none());
    assert!(provider.resource(&resource_group_id("rg-b")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_nothing_starts_after_shutdown() {
    let provider = Arc::new(MemoryProvider::new());
    let (tx, shutdown) = Shutdown::channel();
    tx.send(true).unwrap();

    let err = applier(provider.clone(), Arc::new(MemoryStore::new()))
        .apply(
            vec![resource_group("rg-a"), resource_group("rg-b")],
            ApplyMode::Ensure,
            &shutdown,
        )
        .await
        .unwrap_err();
    let Error::Batch { total, failures, .. } = err else {
        panic!("expected batch error");
    };
    assert_eq!(total, 2);
    assert!(failures.iter().all(|(_, e)| matches!(e, Error::Cancelled)));
    let calls = provider.calls();
    assert_eq!((calls.authorize, calls.put), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_units_waiting_for_a_worker() {
    let gauge = Arc::new(Gauge::default());
    let deps = ClientDeps::new(Arc::new(MemoryProvider::new()));
    let applier = BatchApplier::new(slow_registry(gauge.clone()), deps, fast_batch_config(1));

    let (tx, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
    });

    let objects: Vec<Object> = (0..3).map(|i| slow(&format!("obj-{}", i))).collect();
    let err = applier
        .apply(objects, ApplyMode::Ensure, &shutdown)
        .await
        .unwrap_err();

    let Error::Batch {
        total,
        failures,
        summary,
    } = err
    else {
        panic!("expected batch error");
    };
    assert_eq!(total, 3);
    // The running unit finishes; the others never start.
    assert_eq!(summary.applied.len(), 1);
    assert_eq!(summary.applied[0].name, "obj-0");
    let names: Vec<&str> = failures.iter().map(|(r, _)| r.name.as_str()).collect();
    assert_eq!(names, vec!["obj-1", "obj-2"]);
    assert!(failures.iter().all(|(_, e)| matches!(e, Error::Cancelled)));
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 1);
}
