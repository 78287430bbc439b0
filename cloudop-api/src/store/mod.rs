//! Declarative store abstraction.
//!
//! Provides a domain-oriented interface for object CRUD that is independent of
//! the backend. Backends share their write semantics through `rules`.

mod error;
mod event;
mod memory;
mod redb_store;
mod rules;
mod traits;

pub use error::{Result, StoreError};
pub use event::Event;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use traits::ObjectStore;
