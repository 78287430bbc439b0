//! Events emitted by store writes.

use crate::object::ObjectRef;

/// Events emitted after a write has been committed.
///
/// These events are dispatched via a broadcast channel to subscribers;
/// the controller uses them as reconcile triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An object was created, or its metadata or spec changed.
    Applied(ObjectRef),
    /// Only the status of an object changed.
    StatusChanged(ObjectRef),
    /// An object was removed from the store.
    Deleted(ObjectRef),
}

impl Event {
    pub fn object_ref(&self) -> &ObjectRef {
        match self {
            Event::Applied(r) | Event::StatusChanged(r) | Event::Deleted(r) => r,
        }
    }
}
