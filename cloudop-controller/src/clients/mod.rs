//! Resource clients.
//!
//! A client adapts one object kind to the cloud provider. Clients come in two
//! shapes: sync clients finish within one call, async clients may need several
//! calls because the provider itself works asynchronously and report whether
//! they are done (ensure) or whether the resource still exists (delete).

mod arm;
mod compare;
mod generated_secret;
mod redis_cache;
mod resource_group;
pub mod secret;
mod sql_server;
mod virtual_network;

use std::sync::Arc;

use async_trait::async_trait;
use cloudop_api::{Object, ObjectStore};

use crate::error::{Error, Result};
use crate::provider::CloudProvider;

pub use arm::{ArmClient, ArmKind, Session};
pub use generated_secret::{GeneratedSecretClient, GeneratedSecretSpec};
pub use redis_cache::{RedisCache, RedisCacheSpec};
pub use resource_group::{ResourceGroup, ResourceGroupSpec};
pub use sql_server::{SqlServer, SqlServerSpec};
pub use virtual_network::{VirtualNetwork, VirtualNetworkSpec};

/// Binding of provider credentials, shared by both client shapes.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Bind credentials scoped to the object's subscription.
    async fn authorize(&self, object: &Object) -> Result<()>;
}

#[async_trait]
pub trait SyncResourceClient: ResourceClient {
    async fn ensure(&self, object: &mut Object) -> Result<()>;
    async fn delete(&self, object: &mut Object) -> Result<()>;
}

#[async_trait]
pub trait AsyncResourceClient: ResourceClient {
    /// Returns true once the remote resource has converged.
    async fn ensure(&self, object: &mut Object) -> Result<bool>;
    /// Returns true while the remote resource still exists.
    async fn delete(&self, object: &mut Object) -> Result<bool>;
}

/// What the engine holds for one object.
#[derive(Clone)]
pub enum ClientHandle {
    Sync(Arc<dyn SyncResourceClient>),
    Async(Arc<dyn AsyncResourceClient>),
}

impl ClientHandle {
    pub fn is_sync(&self) -> bool {
        matches!(self, ClientHandle::Sync(_))
    }

    pub async fn authorize(&self, object: &Object) -> Result<()> {
        match self {
            ClientHandle::Sync(c) => c.authorize(object).await,
            ClientHandle::Async(c) => c.authorize(object).await,
        }
    }

    /// Ensure in async shape. A sync client that succeeds is done.
    pub async fn ensure(&self, object: &mut Object) -> Result<bool> {
        match self {
            ClientHandle::Sync(c) => c.ensure(object).await.map(|()| true),
            ClientHandle::Async(c) => c.ensure(object).await,
        }
    }

    /// Delete in async shape. A sync client that succeeds leaves nothing behind.
    pub async fn delete(&self, object: &mut Object) -> Result<bool> {
        match self {
            ClientHandle::Sync(c) => c.delete(object).await.map(|()| false),
            ClientHandle::Async(c) => c.delete(object).await,
        }
    }
}

/// Collaborators a client constructor may use.
#[derive(Clone)]
pub struct ClientDeps {
    pub provider: Arc<dyn CloudProvider>,
    pub store: Option<Arc<dyn ObjectStore>>,
}

impl ClientDeps {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The store client, for kinds that write or read other objects.
    pub fn store(&self, kind: &str) -> Result<Arc<dyn ObjectStore>> {
        self.store
            .clone()
            .ok_or_else(|| Error::type_mismatch(kind, "kind requires a store client"))
    }
}

/// Decode an object's spec for the given kind.
pub(crate) fn decode_spec<T: serde::de::DeserializeOwned>(object: &Object, kind: &str) -> Result<T> {
    if object.kind != kind {
        return Err(Error::type_mismatch(
            kind,
            format!("client received a {} object", object.kind),
        ));
    }
    object
        .spec_as()
        .map_err(|e| Error::type_mismatch(kind, format!("invalid spec: {}", e)))
}
