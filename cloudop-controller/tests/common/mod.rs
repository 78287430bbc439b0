//! Shared test utilities for cloudop-controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloudop_api::{MemoryStore, Object, ObjectRef, ObjectStore};
use cloudop_controller::{
    BackoffPolicy, BatchConfig, FixedIntervalPoll, MemoryProvider, Reconciler, Registry,
};
use serde_json::json;

pub const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

pub fn resource_group(name: &str) -> Object {
    Object::new(
        "ResourceGroup",
        "default",
        name,
        json!({
            "location": "westus2",
            "subscriptionId": SUBSCRIPTION,
            "tags": { "env": "test" },
        }),
    )
}

pub fn resource_group_id(name: &str) -> String {
    format!("/subscriptions/{}/resourceGroups/{}", SUBSCRIPTION, name)
}

pub fn redis_cache(name: &str) -> Object {
    Object::new(
        "RedisCache",
        "default",
        name,
        json!({
            "location": "westus2",
            "resourceGroup": "rg-test",
            "subscriptionId": SUBSCRIPTION,
            "sku": { "name": "Basic", "family": "C", "capacity": 0 },
        }),
    )
}

pub fn generated_secret(name: &str) -> Object {
    Object::new(
        "GeneratedSecret",
        "default",
        name,
        json!({ "length": 24, "keys": ["password"] }),
    )
}

/// Store, simulated cloud and a reconciler over both.
pub struct Harness {
    pub store: Arc<dyn ObjectStore>,
    pub provider: Arc<MemoryProvider>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(provider: MemoryProvider) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), Arc::new(provider))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, provider: Arc<MemoryProvider>) -> Self {
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(Registry::standard()),
            provider.clone(),
        );
        Self {
            store,
            provider,
            reconciler,
        }
    }

    pub async fn create(&self, object: Object) -> ObjectRef {
        self.store
            .create(object)
            .await
            .expect("Failed to create object")
            .object_ref()
    }

    pub async fn get(&self, object_ref: &ObjectRef) -> Object {
        self.store.get(object_ref).await.expect("Object missing")
    }
}

/// Millisecond pacing so batch tests finish quickly under paused time.
pub fn fast_batch_config(workers: usize) -> BatchConfig {
    BatchConfig {
        workers,
        backoff: BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            factor: 2.0,
            max_steps: 8,
            cap: Duration::from_millis(200),
            jitter: 0.0,
        },
        poll: FixedIntervalPoll {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        },
    }
}
