//! Generic async client over the cloud provider.
//!
//! Each kind supplies its translation (`ArmKind`); the create / poll / update
//! / delete cycle is shared.

use std::sync::Arc;

use async_trait::async_trait;
use cloudop_api::{Continuation, Object, OperationKind, ProvisioningState};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AsyncResourceClient, ResourceClient, decode_spec};
use crate::error::{Error, Result};
use crate::provider::{
    CloudProvider, Credentials, Poll, ProviderError, RemoteResource, ResourceAddress,
};

/// Provider access for kinds that need more than the basic cycle.
pub struct Session<'a> {
    pub provider: &'a dyn CloudProvider,
    pub creds: &'a Credentials,
    pub address: &'a ResourceAddress,
}

/// Translation between one object kind and its provider resource.
#[async_trait]
pub trait ArmKind: Send + Sync + 'static {
    type Spec: DeserializeOwned + Send + Sync;

    const KIND: &'static str;
    const API_VERSION: &'static str;

    fn subscription<'a>(&self, spec: &'a Self::Spec) -> &'a str;

    fn resource_id(&self, object: &Object, spec: &Self::Spec) -> String;

    /// Request body for a create or update.
    async fn payload(&self, object: &Object, spec: &Self::Spec) -> Result<Value>;

    /// Whether the mutable fields of `spec` differ from the remote resource.
    /// Fields the provider fixes at creation are not compared.
    fn needs_update(&self, spec: &Self::Spec, remote: &RemoteResource) -> bool;

    /// Called on every ensure that finds the resource converged.
    async fn on_ready(
        &self,
        _session: &Session<'_>,
        _object: &mut Object,
        _spec: &Self::Spec,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once the remote resource is confirmed absent during delete.
    async fn on_deleted(&self, _object: &Object, _spec: &Self::Spec) -> Result<()> {
        Ok(())
    }
}

fn in_progress(operation: OperationKind) -> ProvisioningState {
    match operation {
        OperationKind::Create => ProvisioningState::Creating,
        OperationKind::Update => ProvisioningState::Updating,
        OperationKind::Delete => ProvisioningState::Deleting,
    }
}

/// Async client driving a provider resource for kind `K`.
pub struct ArmClient<K: ArmKind> {
    kind: K,
    provider: Arc<dyn CloudProvider>,
    creds: Mutex<Option<Credentials>>,
}

impl<K: ArmKind> ArmClient<K> {
    pub fn new(kind: K, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            kind,
            provider,
            creds: Mutex::new(None),
        }
    }

    async fn credentials(&self) -> Result<Credentials> {
        self.creds.lock().await.clone().ok_or_else(|| Error::Authorization {
            scope: K::KIND.to_string(),
            message: "client used before authorize".to_string(),
        })
    }

    fn address(&self, object: &Object, spec: &K::Spec) -> ResourceAddress {
        ResourceAddress::new(self.kind.resource_id(object, spec), K::API_VERSION)
    }

    /// Poll the pending operation, if any. Returns true while it is running.
    async fn resume(&self, object: &mut Object, creds: &Credentials) -> Result<bool> {
        let Continuation::Pending { operation, token } = &object.status.continuation else {
            return Ok(false);
        };
        let operation = *operation;

        match self.provider.poll(creds, token).await {
            Ok(Poll::Pending(next)) => {
                object.status.continuation = Continuation::pending(operation, next);
                object.status.provisioning_state = Some(in_progress(operation));
                Ok(true)
            }
            Ok(Poll::Done) => {
                debug!(kind = K::KIND, name = object.name(), ?operation, "Operation completed");
                object.status.continuation.clear();
                Ok(false)
            }
            Err(e) if e.is_transient() => Err(e.into()),
            // The operation record expired; only a read can tell whether the
            // resource is there.
            Err(ProviderError::NotFound(message)) => {
                debug!(
                    kind = K::KIND,
                    name = object.name(),
                    ?operation,
                    detail = %message,
                    "Operation status gone, rechecking resource"
                );
                object.status.continuation.clear();
                Ok(false)
            }
            Err(e) => {
                warn!(kind = K::KIND, name = object.name(), ?operation, error = %e, "Operation failed");
                object.status.continuation.clear();
                object.status.provisioning_state = Some(ProvisioningState::Failed);
                Err(e.into())
            }
        }
    }

    async fn put(
        &self,
        object: &mut Object,
        spec: &K::Spec,
        creds: &Credentials,
        address: &ResourceAddress,
        operation: OperationKind,
    ) -> Result<bool> {
        let body = self.kind.payload(object, spec).await?;
        info!(kind = K::KIND, name = object.name(), ?operation, id = %address.id, "Submitting resource");

        let poll = self.provider.begin_put(creds, address, body).await?;
        object.status.provisioning_state = Some(in_progress(operation));
        object.status.resource_id = Some(address.id.clone());
        if let Poll::Pending(token) = poll {
            object.status.continuation = Continuation::pending(operation, token);
        }
        Ok(false)
    }

    async fn confirm_deleted(&self, object: &mut Object, spec: &K::Spec) -> Result<bool> {
        object.status.provisioning_state = Some(ProvisioningState::NotFound);
        self.kind.on_deleted(object, spec).await?;
        Ok(false)
    }
}

#[async_trait]
impl<K: ArmKind> ResourceClient for ArmClient<K> {
    async fn authorize(&self, object: &Object) -> Result<()> {
        let spec: K::Spec = decode_spec(object, K::KIND)?;
        let creds = self.provider.authorize(self.kind.subscription(&spec)).await?;
        *self.creds.lock().await = Some(creds);
        Ok(())
    }
}

#[async_trait]
impl<K: ArmKind> AsyncResourceClient for ArmClient<K> {
    async fn ensure(&self, object: &mut Object) -> Result<bool> {
        let spec: K::Spec = decode_spec(object, K::KIND)?;
        let creds = self.credentials().await?;
        let address = self.address(object, &spec);

        if self.resume(object, &creds).await? {
            return Ok(false);
        }

        let Some(remote) = self.provider.get(&creds, &address).await? else {
            return self
                .put(object, &spec, &creds, &address, OperationKind::Create)
                .await;
        };

        object.status.resource_id = Some(if remote.id.is_empty() {
            address.id.clone()
        } else {
            remote.id.clone()
        });

        let state = remote.provisioning_state();
        if !state.is_terminal() {
            object.status.provisioning_state = Some(state);
            return Ok(false);
        }
        if state != ProvisioningState::Succeeded {
            warn!(kind = K::KIND, name = object.name(), %state, "Resource in failed state, resubmitting");
            return self
                .put(object, &spec, &creds, &address, OperationKind::Update)
                .await;
        }
        if self.kind.needs_update(&spec, &remote) {
            return self
                .put(object, &spec, &creds, &address, OperationKind::Update)
                .await;
        }

        object.status.provisioning_state = Some(ProvisioningState::Succeeded);
        let session = Session {
            provider: self.provider.as_ref(),
            creds: &creds,
            address: &address,
        };
        self.kind.on_ready(&session, object, &spec).await?;
        Ok(true)
    }

    async fn delete(&self, object: &mut Object) -> Result<bool> {
        let spec: K::Spec = decode_spec(object, K::KIND)?;
        let creds = self.credentials().await?;
        let address = self.address(object, &spec);

        if self.resume(object, &creds).await? {
            return Ok(true);
        }

        let Some(remote) = self.provider.get(&creds, &address).await? else {
            return self.confirm_deleted(object, &spec).await;
        };
        if remote.provisioning_state() == ProvisioningState::Deleting {
            object.status.provisioning_state = Some(ProvisioningState::Deleting);
            return Ok(true);
        }

        info!(kind = K::KIND, name = object.name(), id = %address.id, "Deleting resource");
        match self.provider.begin_delete(&creds, &address).await {
            Ok(Poll::Pending(token)) => {
                object.status.continuation = Continuation::pending(OperationKind::Delete, token);
                object.status.provisioning_state = Some(ProvisioningState::Deleting);
                Ok(true)
            }
            Ok(Poll::Done) | Err(ProviderError::NotFound(_)) => {
                self.confirm_deleted(object, &spec).await
            }
            Err(e) => Err(e.into()),
        }
    }
}
