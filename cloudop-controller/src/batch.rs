//! One-shot application of a batch of objects.
//!
//! Every object of a registered kind becomes one unit of work that runs the
//! kind's client until it converges, paced by the kind's polling strategy.
//! At most `workers` units run at once; a slot is taken before a unit starts
//! and given back when it finishes. Units are independent: one failing or
//! slow object does not hold up the others.

use std::collections::HashMap;
use std::sync::Arc;

use cloudop_api::{Object, ObjectRef};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffPolicy, FixedIntervalPoll, poll_until, retry};
use crate::clients::{ClientDeps, ClientHandle};
use crate::error::{Error, Result};
use crate::registry::{KindEntry, PollingStrategy, Registry};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Ensure,
    Delete,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub workers: usize,
    pub backoff: BackoffPolicy,
    pub poll: FixedIntervalPoll,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            backoff: BackoffPolicy::default(),
            poll: FixedIntervalPoll::default(),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct BatchSummary {
    /// Objects that converged, in completion order.
    pub applied: Vec<ObjectRef>,
    /// Objects of kinds without a registered client.
    pub skipped: Vec<ObjectRef>,
}

pub struct BatchApplier {
    registry: Arc<Registry>,
    deps: ClientDeps,
    config: BatchConfig,
}

struct Unit {
    object: Object,
    authorized: bool,
}

impl BatchApplier {
    pub fn new(registry: Arc<Registry>, deps: ClientDeps, config: BatchConfig) -> Self {
        Self {
            registry,
            deps,
            config,
        }
    }

    /// Apply all objects and wait for every unit to finish.
    ///
    /// Units keep running when another fails. If any failed, the result is
    /// `Error::Batch` with all failures in completion order, the first one
    /// being the primary error, and the summary of the objects that did not
    /// fail. Once shutdown is signalled no further unit is started; the
    /// objects left over are reported as `Cancelled` after the others.
    pub async fn apply(&self, objects: Vec<Object>, mode: ApplyMode, shutdown: &Shutdown) -> Result<BatchSummary> {
        let slots = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut stopping = shutdown.clone();
        let mut units = JoinSet::new();
        let mut refs = HashMap::new();
        let mut summary = BatchSummary::default();
        let mut not_started = Vec::new();
        let mut total = 0;

        for object in objects {
            let object_ref = object.object_ref();
            let Some(entry) = self.registry.get(&object.kind) else {
                warn!(object = %object_ref, "Skipping object of unknown kind");
                summary.skipped.push(object_ref);
                continue;
            };
            total += 1;

            if shutdown.is_triggered() {
                not_started.push(object_ref);
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = stopping.triggered() => None,
                permit = slots.clone().acquire_owned() => Some(permit.map_err(|_| Error::Cancelled)?),
            };
            let Some(permit) = permit.filter(|_| !shutdown.is_triggered()) else {
                not_started.push(object_ref);
                continue;
            };

            let entry = entry.clone();
            let deps = self.deps.clone();
            let config = self.config.clone();
            let shutdown = shutdown.clone();

            debug!(object = %object_ref, ?mode, "Dispatching");
            let handle = units.spawn(async move {
                let _permit = permit;
                run_unit(entry, deps, config, object, mode, shutdown).await
            });
            refs.insert(handle.id(), object_ref);
        }

        let mut failures: Vec<(ObjectRef, Error)> = Vec::new();
        while let Some(joined) = units.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => (e.id(), Err(Error::Cancelled)),
            };
            let Some(object_ref) = refs.remove(&id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    info!(object = %object_ref, ?mode, "Applied");
                    summary.applied.push(object_ref);
                }
                Err(e) => {
                    error!(object = %object_ref, ?mode, error = %e, "Apply failed");
                    failures.push((object_ref, e));
                }
            }
        }

        if !not_started.is_empty() {
            warn!(count = not_started.len(), "Shutting down, objects left unapplied");
        }
        failures.extend(not_started.into_iter().map(|r| (r, Error::Cancelled)));

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(Error::Batch {
                total,
                failures,
                summary,
            })
        }
    }
}

async fn run_unit(
    entry: KindEntry,
    deps: ClientDeps,
    config: BatchConfig,
    object: Object,
    mode: ApplyMode,
    shutdown: Shutdown,
) -> Result<()> {
    let client = entry.client(&deps)?;
    let unit = Arc::new(Mutex::new(Unit {
        object,
        authorized: false,
    }));

    let probe = || {
        let client = client.clone();
        let unit = unit.clone();
        async move {
            let mut unit = unit.lock().await;
            attempt(&client, &mut unit, mode).await
        }
    };

    match entry.polling {
        PollingStrategy::Backoff => retry(&config.backoff, shutdown, probe).await,
        PollingStrategy::FixedInterval => poll_until(&config.poll, shutdown, probe).await,
    }
}

/// One try at converging a unit. Transient failures and authorization that has
/// not propagated yet count as "not done" so the pacer retries them.
async fn attempt(client: &ClientHandle, unit: &mut Unit, mode: ApplyMode) -> Result<bool> {
    let object_ref = unit.object.object_ref();
    let result = async {
        if !unit.authorized {
            client.authorize(&unit.object).await?;
            unit.authorized = true;
        }
        match mode {
            ApplyMode::Ensure => client.ensure(&mut unit.object).await,
            ApplyMode::Delete => client.delete(&mut unit.object).await.map(|found| !found),
        }
    }
    .await;

    match result {
        Ok(done) => {
            if !done {
                let state = unit
                    .object
                    .status
                    .provisioning_state
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                debug!(object = %object_ref, state, "Not converged yet");
            }
            Ok(done)
        }
        Err(e) if e.is_transient() || e.is_authorization() => {
            warn!(object = %object_ref, error = %e, "Retrying");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
