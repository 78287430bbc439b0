//! Write rules shared by every store backend.
//!
//! Each function takes the currently stored copy (if any) and the caller's
//! input and decides what to persist. Backends only do the I/O.

use chrono::Utc;
use uuid::Uuid;

use super::error::{Result, StoreError};
use super::event::Event;
use crate::object::{Object, ObjectRef};

/// Outcome of applying a rule.
#[derive(Debug)]
pub(crate) enum Write {
    Put(Object),
    /// Status-only write.
    Status(Object),
    Remove(Object),
    Unchanged(Object),
}

impl Write {
    pub(crate) fn event(&self) -> Option<Event> {
        match self {
            Write::Put(o) => Some(Event::Applied(o.object_ref())),
            Write::Status(o) => Some(Event::StatusChanged(o.object_ref())),
            Write::Remove(o) => Some(Event::Deleted(o.object_ref())),
            Write::Unchanged(_) => None,
        }
    }

    pub(crate) fn into_object(self) -> Object {
        match self {
            Write::Put(o) | Write::Status(o) | Write::Remove(o) | Write::Unchanged(o) => o,
        }
    }
}

fn not_found(object_ref: &ObjectRef) -> StoreError {
    StoreError::NotFound(object_ref.to_string())
}

fn validate(object: &Object) -> Result<()> {
    if object.kind.trim().is_empty() {
        return Err(StoreError::Invalid("kind must not be empty".to_string()));
    }
    if object.metadata.name.trim().is_empty() {
        return Err(StoreError::Invalid("metadata.name must not be empty".to_string()));
    }
    if object.metadata.namespace.trim().is_empty() {
        return Err(StoreError::Invalid(
            "metadata.namespace must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn check_version(current: &Object, incoming: &Object) -> Result<()> {
    if current.metadata.resource_version != incoming.metadata.resource_version {
        return Err(StoreError::VersionMismatch {
            key: current.object_ref().key(),
            expected: current.metadata.resource_version,
            actual: incoming.metadata.resource_version,
        });
    }
    Ok(())
}

pub(crate) fn create(current: Option<&Object>, mut object: Object) -> Result<Write> {
    validate(&object)?;
    if current.is_some() {
        return Err(StoreError::Conflict(format!(
            "{} already exists",
            object.object_ref()
        )));
    }

    if object.metadata.uid.is_empty() {
        object.metadata.uid = Uuid::new_v4().to_string();
    }
    object.metadata.generation = 1;
    object.metadata.resource_version = 1;
    object.metadata.deletion_timestamp = None;
    Ok(Write::Put(object))
}

pub(crate) fn update(current: Option<&Object>, incoming: &Object) -> Result<Write> {
    let current = current.ok_or_else(|| not_found(&incoming.object_ref()))?;
    check_version(current, incoming)?;

    let mut next = current.clone();
    if next.spec != incoming.spec {
        next.spec = incoming.spec.clone();
        next.metadata.generation += 1;
    }
    next.metadata.finalizers = incoming.metadata.finalizers.clone();
    next.metadata.labels = incoming.metadata.labels.clone();
    next.metadata.resource_version += 1;

    if next.is_deleting() && next.metadata.finalizers.is_empty() {
        return Ok(Write::Remove(next));
    }
    Ok(Write::Put(next))
}

pub(crate) fn update_status(current: Option<&Object>, incoming: &Object) -> Result<Write> {
    let current = current.ok_or_else(|| not_found(&incoming.object_ref()))?;
    check_version(current, incoming)?;

    let mut next = current.clone();
    next.status = incoming.status.clone();
    next.metadata.resource_version += 1;
    Ok(Write::Status(next))
}

pub(crate) fn delete(current: Option<&Object>, object_ref: &ObjectRef) -> Result<Write> {
    let current = current.ok_or_else(|| not_found(object_ref))?;

    if current.metadata.finalizers.is_empty() {
        return Ok(Write::Remove(current.clone()));
    }
    if current.is_deleting() {
        return Ok(Write::Unchanged(current.clone()));
    }

    let mut next = current.clone();
    next.metadata.deletion_timestamp = Some(Utc::now());
    next.metadata.resource_version += 1;
    Ok(Write::Put(next))
}

pub(crate) fn apply(current: Option<&Object>, object: Object) -> Result<Write> {
    match current {
        None => create(None, object),
        Some(existing) => {
            validate(&object)?;
            let mut incoming = existing.clone();
            incoming.spec = object.spec;
            incoming.metadata.labels = object.metadata.labels;
            if incoming.spec == existing.spec && incoming.metadata.labels == existing.metadata.labels {
                return Ok(Write::Unchanged(existing.clone()));
            }
            update(Some(existing), &incoming)
        }
    }
}
