//! ObjectStore trait definition.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::Result;
use super::event::Event;
use crate::object::{Object, ObjectRef};

/// The declarative store: single source of truth for desired-state objects.
///
/// Every write is checked against `metadata.resource_version`; a stale copy is
/// rejected with `StoreError::VersionMismatch` and must be re-fetched.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object. Absent objects are `StoreError::NotFound`.
    async fn get(&self, object_ref: &ObjectRef) -> Result<Object>;

    /// List objects, optionally restricted to one kind.
    async fn list(&self, kind: Option<&str>) -> Result<Vec<Object>>;

    /// Create a new object. Fails with `Conflict` if it already exists.
    async fn create(&self, object: Object) -> Result<Object>;

    /// Write metadata (finalizers, labels) and spec. Status is left untouched.
    ///
    /// If the object is being deleted and no finalizers remain, the object is
    /// removed and its final copy returned.
    async fn update(&self, object: &Object) -> Result<Object>;

    /// Write status only.
    async fn update_status(&self, object: &Object) -> Result<Object>;

    /// Request deletion. Objects without finalizers are removed immediately;
    /// others get a deletion timestamp and stay until their finalizers are gone.
    async fn delete(&self, object_ref: &ObjectRef) -> Result<()>;

    /// Create the object or replace spec and labels of the existing one.
    async fn apply(&self, object: Object) -> Result<Object>;

    /// Subscribe to write events.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}
