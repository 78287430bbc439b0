//! Per-object reconciliation.
//!
//! One call to `Reconciler::reconcile` performs exactly one state transition
//! for one object:
//!
//! 1. Fetch the object. Absence means there is nothing to do.
//! 2. Build the kind's client and bind credentials. An authorization failure
//!    ends the attempt before anything is written.
//! 3. Branch on deletion state and the managed finalizer:
//!    - live, no finalizer: attach it and stop; ensure runs on the next pass
//!    - live, finalizer: ensure
//!    - deleting, finalizer: delete; the finalizer goes once the resource is gone
//!    - deleting, no finalizer: nothing left for us
//!
//! Status is written after every ensure or delete, whatever its result.

use std::sync::Arc;

use cloudop_api::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use cloudop_api::{FINALIZER, Object, ObjectRef, ObjectStore};
use tracing::{debug, error, info, warn};

use crate::clients::{ClientDeps, ClientHandle};
use crate::error::{AggregateError, Error, Result};
use crate::provider::CloudProvider;
use crate::registry::Registry;

/// Attempts for a finalizer or status write that keeps hitting stale versions.
const CONFLICT_RETRIES: usize = 5;

/// Result of one reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The object no longer exists.
    Absent,
    /// Unregistered kind, or deleting without our finalizer.
    Ignored,
    /// The finalizer was attached; ensure is deferred.
    FinalizerAdded,
    /// The resource matches the spec.
    Reconciled,
    /// Ensure is making progress but has not converged.
    Requeue,
    /// Delete was issued or is running; the finalizer stays.
    DeletionPending,
    /// The resource is gone and the finalizer removed.
    FinalizerRemoved,
}

impl Outcome {
    /// Whether the object needs another pass without any external change.
    pub fn requeue(&self) -> bool {
        matches!(self, Outcome::Requeue | Outcome::DeletionPending)
    }
}

fn combine<T>(result: Result<T>, persisted: Result<()>) -> Result<T> {
    match (result, persisted) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(p)) => Err(p),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(p)) => Err(Error::Aggregate(AggregateError(vec![e, p]))),
    }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    registry: Arc<Registry>,
    deps: ClientDeps,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<Registry>,
        provider: Arc<dyn CloudProvider>,
    ) -> Self {
        let deps = ClientDeps::new(provider).with_store(store.clone());
        Self {
            store,
            registry,
            deps,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn reconcile(&self, object_ref: &ObjectRef) -> Result<Outcome> {
        let mut object = match self.store.get(object_ref).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                debug!(object = %object_ref, "Object gone, nothing to reconcile");
                return Ok(Outcome::Absent);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(entry) = self.registry.get(&object.kind) else {
            debug!(object = %object_ref, "No client registered for kind");
            return Ok(Outcome::Ignored);
        };
        let client = entry.client(&self.deps).inspect_err(|e| {
            error!(object = %object_ref, error = %e, "Client wiring is broken for this kind");
        })?;

        if let Err(e) = client.authorize(&object).await {
            warn!(object = %object_ref, error = %e, "Authorization failed");
            return Err(e);
        }

        let deleting = object.is_deleting();
        match (deleting, has_finalizer(&object.metadata, FINALIZER)) {
            (false, false) => {
                self.write_finalizers(&mut object, |meta| add_finalizer(meta, FINALIZER))
                    .await?;
                info!(object = %object_ref, "Finalizer attached");
                Ok(Outcome::FinalizerAdded)
            }
            (false, true) => self.ensure(&client, &mut object).await,
            (true, true) => self.delete(&client, &mut object).await,
            (true, false) => Ok(Outcome::Ignored),
        }
    }

    async fn ensure(&self, client: &ClientHandle, object: &mut Object) -> Result<Outcome> {
        let generation = object.metadata.generation;
        let result = client.ensure(object).await;
        match &result {
            Ok(true) => {
                object.status.observed_generation = Some(generation);
                object.status.message = None;
            }
            Ok(false) => object.status.message = None,
            Err(e) => object.status.message = Some(e.to_string()),
        }

        let persisted = self.persist_status(object).await;
        let done = combine(result, persisted)?;
        let state = object
            .status
            .provisioning_state
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("Unknown");

        if done {
            info!(object = %object.object_ref(), state, "Reconciled");
            Ok(Outcome::Reconciled)
        } else {
            debug!(object = %object.object_ref(), state, "Ensure in progress");
            Ok(Outcome::Requeue)
        }
    }

    async fn delete(&self, client: &ClientHandle, object: &mut Object) -> Result<Outcome> {
        // Only the client can confirm absence; an error keeps the finalizer.
        let result = client.delete(object).await;
        object.status.message = result.as_ref().err().map(|e| e.to_string());

        let persisted = self.persist_status(object).await;
        if combine(result, persisted)? {
            debug!(object = %object.object_ref(), "Deletion unfinished");
            return Ok(Outcome::DeletionPending);
        }

        self.write_finalizers(object, |meta| remove_finalizer(meta, FINALIZER))
            .await?;
        info!(object = %object.object_ref(), "Finalizer removed");
        Ok(Outcome::FinalizerRemoved)
    }

    /// Write the object's status, re-applying it onto a fresh copy on
    /// version conflicts. An object that vanished meanwhile is not an error.
    async fn persist_status(&self, object: &mut Object) -> Result<()> {
        let status = object.status.clone();
        let mut attempt = 1;
        loop {
            match self.store.update_status(object).await {
                Ok(stored) => {
                    *object = stored;
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(object = %object.object_ref(), attempt, "Status write conflict, refetching");
                    match self.store.get(&object.object_ref()).await {
                        Ok(fresh) => {
                            *object = fresh;
                            object.status = status.clone();
                        }
                        Err(e) if e.is_not_found() => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply a finalizer change and write it, re-fetching on conflicts.
    async fn write_finalizers<F>(&self, object: &mut Object, change: F) -> Result<()>
    where
        F: Fn(&mut cloudop_api::ObjectMeta) -> bool,
    {
        let mut attempt = 1;
        loop {
            if !change(&mut object.metadata) {
                return Ok(());
            }
            match self.store.update(object).await {
                Ok(stored) => {
                    *object = stored;
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(object = %object.object_ref(), attempt, "Finalizer write conflict, refetching");
                    *object = self.store.get(&object.object_ref()).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
