//! cloudop-controller: converges cloud resources toward the objects in a
//! declarative store.
//!
//! Two ways in:
//! - `Controller` watches the store and reconciles objects as they change,
//!   one state transition per pass, gated by a finalizer on deletion.
//! - `BatchApplier` drives a fixed set of objects to completion and returns,
//!   which is what the `cloudop` CLI uses.
//!
//! Both dispatch through the kind `Registry` to a client per kind, and the
//! clients talk to a `CloudProvider`.

pub mod backoff;
pub mod batch;
pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod provider;
pub mod reconciler;
pub mod registry;
pub mod shutdown;

pub use backoff::{BackoffPolicy, FixedIntervalPoll};
pub use batch::{ApplyMode, BatchApplier, BatchConfig, BatchSummary};
pub use config::{BackoffArgs, ControllerConfig, ProviderArgs};
pub use controller::Controller;
pub use error::{AggregateError, Error, Result};
pub use provider::{CloudProvider, MemoryProvider};
pub use reconciler::{Outcome, Reconciler};
pub use registry::{EnsureStrategy, KindEntry, PollingStrategy, Registry};
pub use shutdown::Shutdown;
