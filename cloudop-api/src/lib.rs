//! cloudop-api: desired-state objects and the declarative store.
//!
//! Everything the controller and the CLI share lives here:
//! - The object model (metadata, spec, status, continuation tokens)
//! - Finalizer manipulation
//! - Manifest decoding
//! - The `ObjectStore` contract with in-memory and redb-backed stores
//! - A small REST surface over any store

pub mod continuation;
pub mod finalizer;
pub mod manifest;
pub mod object;
pub mod rest;
pub mod store;

pub use continuation::{Continuation, OperationKind};
pub use object::{
    API_VERSION, DEFAULT_NAMESPACE, FINALIZER, Object, ObjectMeta, ObjectRef, ProvisioningState,
    Status,
};
pub use store::{Event, MemoryStore, ObjectStore, RedbStore, StoreError};
