//! Integration tests for the per-object reconcile state machine against the
//! simulated cloud.

mod common;

use std::sync::Arc;

use cloudop_api::{FINALIZER, ObjectStore, OperationKind, ProvisioningState, RedbStore};
use cloudop_controller::clients::secret;
use cloudop_controller::provider::ProviderError;
use cloudop_controller::{MemoryProvider, Outcome};
use serde_json::json;

use common::*;

#[tokio::test]
async fn test_create_flow() {
    let h = Harness::new(MemoryProvider::new());
    let r = h.create(resource_group("rg-test")).await;

    // First pass only attaches the finalizer.
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerAdded);
    let obj = h.get(&r).await;
    assert_eq!(obj.metadata.finalizers, vec![FINALIZER.to_string()]);
    assert_eq!(h.provider.calls().put, 0);

    // Second pass submits the resource and records the continuation.
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Requeue);
    let obj = h.get(&r).await;
    assert_eq!(obj.status.provisioning_state, Some(ProvisioningState::Creating));
    assert_eq!(obj.status.continuation.operation(), Some(OperationKind::Create));
    assert_eq!(obj.status.resource_id.as_deref(), Some(resource_group_id("rg-test").as_str()));

    // Third pass finishes the operation.
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Reconciled);
    let obj = h.get(&r).await;
    assert_eq!(obj.status.provisioning_state, Some(ProvisioningState::Succeeded));
    assert!(!obj.status.continuation.is_pending());
    assert_eq!(obj.status.observed_generation, Some(obj.metadata.generation));
    assert!(obj.status.message.is_none());

    let remote = h.provider.resource(&resource_group_id("rg-test")).unwrap();
    assert_eq!(remote.location.as_deref(), Some("westus2"));
    assert_eq!(remote.tags["env"], "test");
}

#[tokio::test]
async fn test_converged_object_is_not_written_again() {
    let h = Harness::new(MemoryProvider::new());
    let r = h.create(resource_group("rg-test")).await;
    for _ in 0..3 {
        h.reconciler.reconcile(&r).await.unwrap();
    }
    assert_eq!(h.provider.calls().put, 1);

    for _ in 0..3 {
        assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Reconciled);
    }
    let obj = h.get(&r).await;
    assert_eq!(obj.metadata.finalizers.len(), 1);
    assert_eq!(h.provider.calls().put, 1);
}

#[tokio::test]
async fn test_spec_change_triggers_update() {
    let h = Harness::new(MemoryProvider::new().with_polls(0));
    let r = h.create(resource_group("rg-test")).await;
    h.reconciler.reconcile(&r).await.unwrap();
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Requeue);
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Reconciled);

    let mut obj = h.get(&r).await;
    obj.spec["tags"] = json!({ "env": "prod" });
    h.store.update(&obj).await.unwrap();

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Requeue);
    assert_eq!(h.provider.calls().put, 2);
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Reconciled);

    let obj = h.get(&r).await;
    assert_eq!(obj.status.observed_generation, Some(obj.metadata.generation));
    let remote = h.provider.resource(&resource_group_id("rg-test")).unwrap();
    assert_eq!(remote.tags["env"], "prod");
}

#[tokio::test]
async fn test_deletion_flow() {
    let h = Harness::new(MemoryProvider::new());
    let r = h.create(resource_group("rg-test")).await;
    for _ in 0..3 {
        h.reconciler.reconcile(&r).await.unwrap();
    }

    h.store.delete(&r).await.unwrap();
    let obj = h.get(&r).await;
    assert!(obj.is_deleting());

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::DeletionPending);
    let obj = h.get(&r).await;
    assert_eq!(obj.metadata.finalizers, vec![FINALIZER.to_string()]);
    assert_eq!(obj.status.provisioning_state, Some(ProvisioningState::Deleting));
    assert_eq!(obj.status.continuation.operation(), Some(OperationKind::Delete));

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerRemoved);
    assert!(h.store.get(&r).await.unwrap_err().is_not_found());
    assert!(h.provider.resource(&resource_group_id("rg-test")).is_none());

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Absent);
    assert_eq!(h.provider.calls().delete, 1);
}

#[tokio::test]
async fn test_finalizer_stays_while_resource_exists() {
    let h = Harness::new(MemoryProvider::new().with_polls(3));
    let r = h.create(resource_group("rg-test")).await;
    h.reconciler.reconcile(&r).await.unwrap();
    while h.reconciler.reconcile(&r).await.unwrap() != Outcome::Reconciled {}

    h.store.delete(&r).await.unwrap();
    for _ in 0..3 {
        assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::DeletionPending);
        let obj = h.get(&r).await;
        assert!(obj.metadata.finalizers.contains(&FINALIZER.to_string()));
        assert!(h.provider.resource(&resource_group_id("rg-test")).is_some());
    }
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerRemoved);
}

#[tokio::test]
async fn test_failed_delete_keeps_finalizer_and_records_error() {
    let h = Harness::new(MemoryProvider::new().with_polls(0));
    let r = h.create(resource_group("rg-test")).await;
    for _ in 0..3 {
        h.reconciler.reconcile(&r).await.unwrap();
    }

    h.store.delete(&r).await.unwrap();
    h.provider.fail_next(ProviderError::Operation {
        status: 400,
        message: "resource group is locked".into(),
    });
    let err = h.reconciler.reconcile(&r).await.unwrap_err();
    assert!(!err.is_transient());

    let obj = h.get(&r).await;
    assert!(obj.metadata.finalizers.contains(&FINALIZER.to_string()));
    assert!(obj.status.message.as_deref().unwrap().contains("locked"));

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerRemoved);
}

#[tokio::test]
async fn test_deleting_without_finalizer_is_left_alone() {
    let h = Harness::new(MemoryProvider::new());
    let mut obj = resource_group("rg-foreign");
    obj.metadata.finalizers.push("someone.else/finalizer".into());
    let r = h.create(obj).await;
    h.store.delete(&r).await.unwrap();

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Ignored);
    assert_eq!(h.provider.calls().delete, 0);
    assert_eq!(h.get(&r).await.metadata.finalizers, vec!["someone.else/finalizer".to_string()]);
}

#[tokio::test]
async fn test_authorization_failure_mutates_nothing() {
    let h = Harness::new(MemoryProvider::new());
    h.provider.deny_authorization(SUBSCRIPTION, 1);
    let r = h.create(resource_group("rg-test")).await;
    let before = h.get(&r).await;

    let err = h.reconciler.reconcile(&r).await.unwrap_err();
    assert!(err.is_authorization());

    let after = h.get(&r).await;
    assert_eq!(after, before);
    let calls = h.provider.calls();
    assert_eq!((calls.get, calls.put), (0, 0));

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerAdded);
}

#[tokio::test]
async fn test_pending_operation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects.redb");
    let provider = Arc::new(MemoryProvider::new());

    let r = {
        let store = Arc::new(RedbStore::open(&path).unwrap());
        let h = Harness::with_store(store, provider.clone());
        let r = h.create(resource_group("rg-test")).await;
        assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerAdded);
        assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Requeue);
        r
    };

    let store = Arc::new(RedbStore::open(&path).unwrap());
    let h = Harness::with_store(store, provider.clone());
    let obj = h.get(&r).await;
    assert_eq!(obj.status.continuation.operation(), Some(OperationKind::Create));

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Reconciled);
    let calls = provider.calls();
    assert_eq!(calls.put, 1);
    assert_eq!(calls.poll, 1);
}

#[tokio::test]
async fn test_unknown_token_marks_failure() {
    let h = Harness::new(MemoryProvider::new());
    let r = h.create(resource_group("rg-test")).await;
    h.reconciler.reconcile(&r).await.unwrap();

    let mut obj = h.get(&r).await;
    obj.status.continuation = cloudop_api::Continuation::pending(OperationKind::Create, b"{\"op\":99}".to_vec());
    h.store.update_status(&obj).await.unwrap();

    assert!(h.reconciler.reconcile(&r).await.is_err());
    let obj = h.get(&r).await;
    assert_eq!(obj.status.provisioning_state, Some(ProvisioningState::Failed));
    assert!(!obj.status.continuation.is_pending());

    // The next pass starts over from the remote state.
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Requeue);
}

#[tokio::test]
async fn test_sync_client_flow() {
    let h = Harness::new(MemoryProvider::new());
    let r = h.create(generated_secret("db-admin")).await;

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerAdded);
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Reconciled);

    let first = secret::read(h.store.as_ref(), "default", "db-admin").await.unwrap().unwrap();
    assert_eq!(first.data["password"].len(), 24);

    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::Reconciled);
    let second = secret::read(h.store.as_ref(), "default", "db-admin").await.unwrap().unwrap();
    assert_eq!(first, second);

    h.store.delete(&r).await.unwrap();
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerRemoved);
    assert!(secret::read(h.store.as_ref(), "default", "db-admin").await.unwrap().is_none());
    assert_eq!(h.provider.calls().authorize, 0);
}

#[tokio::test]
async fn test_server_waits_for_generated_password() {
    let h = Harness::new(MemoryProvider::new().with_polls(0));
    let server = h
        .create(cloudop_api::Object::new(
            "SqlServer",
            "default",
            "sql-test",
            json!({
                "location": "westus2",
                "resourceGroup": "rg-test",
                "subscriptionId": SUBSCRIPTION,
                "administratorLogin": "sqladmin",
                "passwordSecret": { "name": "db-admin", "key": "password" },
            }),
        ))
        .await;
    let password = h.create(generated_secret("db-admin")).await;

    h.reconciler.reconcile(&server).await.unwrap();
    let err = h.reconciler.reconcile(&server).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.provider.calls().put, 0);

    h.reconciler.reconcile(&password).await.unwrap();
    h.reconciler.reconcile(&password).await.unwrap();

    assert_eq!(h.reconciler.reconcile(&server).await.unwrap(), Outcome::Requeue);
    assert_eq!(h.reconciler.reconcile(&server).await.unwrap(), Outcome::Reconciled);
    assert!(h.get(&server).await.status.message.is_none());
}

/// Reconcile a resource group to `Reconciled`, delete it and take the first
/// delete pass, which leaves a pending operation behind.
async fn pending_delete(h: &Harness) -> cloudop_api::ObjectRef {
    let r = h.create(resource_group("rg-test")).await;
    h.reconciler.reconcile(&r).await.unwrap();
    while h.reconciler.reconcile(&r).await.unwrap() != Outcome::Reconciled {}

    h.store.delete(&r).await.unwrap();
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::DeletionPending);
    assert_eq!(h.get(&r).await.status.continuation.operation(), Some(OperationKind::Delete));
    r
}

#[tokio::test]
async fn test_expired_operation_status_does_not_release_finalizer() {
    let h = Harness::new(MemoryProvider::new().with_polls(3));
    let r = pending_delete(&h).await;
    let id = resource_group_id("rg-test");

    h.provider.fail_next(ProviderError::NotFound("operation status expired".into()));
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::DeletionPending);
    let obj = h.get(&r).await;
    assert!(obj.metadata.finalizers.contains(&FINALIZER.to_string()));
    assert!(!obj.status.continuation.is_pending());
    assert!(h.provider.resource(&id).is_some());

    // Still there on the next read.
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::DeletionPending);
    assert!(h.get(&r).await.metadata.finalizers.contains(&FINALIZER.to_string()));

    h.provider.remove(&id);
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerRemoved);
    assert!(h.store.get(&r).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_poll_conflict_during_delete_keeps_finalizer() {
    let h = Harness::new(MemoryProvider::new().with_polls(3));
    let r = pending_delete(&h).await;
    let id = resource_group_id("rg-test");

    h.provider.fail_next(ProviderError::Conflict("another operation is in progress".into()));
    let err = h.reconciler.reconcile(&r).await.unwrap_err();
    assert!(err.is_transient());
    let obj = h.get(&r).await;
    assert!(obj.metadata.finalizers.contains(&FINALIZER.to_string()));
    assert!(!obj.status.continuation.is_pending());
    assert!(obj.status.message.as_deref().unwrap().contains("another operation"));

    // The resource is still reported while it is being deleted.
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::DeletionPending);
    assert!(h.provider.resource(&id).is_some());

    h.provider.remove(&id);
    assert_eq!(h.reconciler.reconcile(&r).await.unwrap(), Outcome::FinalizerRemoved);
}
