//! Watch-triggered controller.
//!
//! Turns store events, a periodic resync and delayed requeues into reconciles.
//! Each object is queued at most once and reconciled by at most one task at a
//! time; a change arriving while its reconcile runs schedules one more pass.
//! Reconciles of one kind are bounded by that kind's concurrency ceiling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use cloudop_api::{Event, ObjectRef};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{Id, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::reconciler::{Outcome, Reconciler};
use crate::shutdown::Shutdown;

/// Pending, running and re-dirtied objects.
#[derive(Debug, Default)]
struct WorkQueue {
    pending: VecDeque<ObjectRef>,
    queued: HashSet<ObjectRef>,
    in_flight: HashSet<ObjectRef>,
    dirty: HashSet<ObjectRef>,
}

impl WorkQueue {
    fn push(&mut self, object_ref: ObjectRef) {
        if self.in_flight.contains(&object_ref) {
            self.dirty.insert(object_ref);
        } else if self.queued.insert(object_ref.clone()) {
            self.pending.push_back(object_ref);
        }
    }

    /// Take every pending object that `start` accepts; the rest stay queued
    /// in order.
    fn start_ready<F>(&mut self, mut start: F)
    where
        F: FnMut(&ObjectRef) -> bool,
    {
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(object_ref) = self.pending.pop_front() {
            if start(&object_ref) {
                self.queued.remove(&object_ref);
                self.in_flight.insert(object_ref);
            } else {
                waiting.push_back(object_ref);
            }
        }
        self.pending = waiting;
    }

    fn drop_queued(&mut self, object_ref: &ObjectRef) {
        self.queued.remove(object_ref);
    }

    fn finish(&mut self, object_ref: &ObjectRef) {
        self.in_flight.remove(object_ref);
        if self.dirty.remove(object_ref) {
            self.push(object_ref.clone());
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    limits: HashMap<String, Arc<Semaphore>>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, config: ControllerConfig) -> Self {
        let limits = reconciler
            .registry()
            .entries()
            .map(|entry| {
                let limit = config
                    .concurrency
                    .get(&entry.kind)
                    .copied()
                    .unwrap_or(entry.max_concurrent)
                    .max(1);
                (entry.kind.clone(), Arc::new(Semaphore::new(limit)))
            })
            .collect();
        Self {
            reconciler,
            config,
            limits,
        }
    }

    /// Run until shutdown. In-flight reconciles are allowed to finish.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut events = self.reconciler.store().subscribe();
        let mut resync = interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<ObjectRef>();

        let mut queue = WorkQueue::default();
        let mut tasks: JoinSet<(ObjectRef, Result<Outcome>)> = JoinSet::new();
        let mut running: HashMap<Id, ObjectRef> = HashMap::new();
        let mut failures: HashMap<ObjectRef, usize> = HashMap::new();

        info!(kinds = self.limits.len(), "Controller started");

        loop {
            self.dispatch(&mut queue, &mut tasks, &mut running);

            tokio::select! {
                _ = shutdown.triggered() => {
                    info!("Shutdown requested, no new reconciles will start");
                    break;
                }
                _ = resync.tick() => self.resync(&mut queue).await,
                event = events.recv() => match event {
                    Ok(Event::Applied(r)) | Ok(Event::Deleted(r)) => {
                        if self.limits.contains_key(&r.kind) {
                            queue.push(r);
                        }
                    }
                    Ok(Event::StatusChanged(_)) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Event stream lagged, resyncing");
                        self.resync(&mut queue).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Store event stream closed");
                        break;
                    }
                },
                Some(object_ref) = requeue_rx.recv() => queue.push(object_ref),
                Some(joined) = tasks.join_next_with_id() => {
                    let (object_ref, result) = match joined {
                        Ok((id, (object_ref, result))) => {
                            running.remove(&id);
                            (object_ref, result)
                        }
                        Err(e) => {
                            let Some(object_ref) = running.remove(&e.id()) else {
                                continue;
                            };
                            error!(object = %object_ref, error = %e, "Reconcile task died");
                            (object_ref, Err(Error::Cancelled))
                        }
                    };
                    queue.finish(&object_ref);
                    if let Some(delay) = self.next_pass(&object_ref, result, &mut failures) {
                        let tx = requeue_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(object_ref);
                        });
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(running = tasks.len(), "Waiting for in-flight reconciles");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok((object_ref, Err(e))) = joined {
                warn!(object = %object_ref, error = %e, "Reconcile failed during shutdown");
            }
        }
        info!("Controller stopped");
    }

    fn dispatch(
        &self,
        queue: &mut WorkQueue,
        tasks: &mut JoinSet<(ObjectRef, Result<Outcome>)>,
        running: &mut HashMap<Id, ObjectRef>,
    ) {
        let mut unknown = Vec::new();
        queue.start_ready(|object_ref| {
            let Some(limit) = self.limits.get(&object_ref.kind) else {
                unknown.push(object_ref.clone());
                return false;
            };
            let Ok(permit) = limit.clone().try_acquire_owned() else {
                return false;
            };
            let reconciler = self.reconciler.clone();
            let task_ref = object_ref.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let result = reconciler.reconcile(&task_ref).await;
                (task_ref, result)
            });
            running.insert(handle.id(), object_ref.clone());
            true
        });
        for object_ref in unknown {
            queue.pending.retain(|r| r != &object_ref);
            queue.drop_queued(&object_ref);
        }
    }

    async fn resync(&self, queue: &mut WorkQueue) {
        match self.reconciler.store().list(None).await {
            Ok(objects) => {
                let mut queued = 0;
                for object in objects {
                    if self.limits.contains_key(&object.kind) {
                        queue.push(object.object_ref());
                        queued += 1;
                    }
                }
                debug!(queued, "Resync");
            }
            Err(e) => warn!(error = %e, "Resync list failed"),
        }
    }

    /// Decide when the object should be looked at again, if at all.
    fn next_pass(
        &self,
        object_ref: &ObjectRef,
        result: Result<Outcome>,
        failures: &mut HashMap<ObjectRef, usize>,
    ) -> Option<Duration> {
        match result {
            Ok(outcome) => {
                failures.remove(object_ref);
                debug!(object = %object_ref, ?outcome, "Reconcile finished");
                outcome.requeue().then_some(self.config.requeue_interval)
            }
            Err(e) => {
                let count = failures.entry(object_ref.clone()).or_insert(0);
                let policy = &self.config.error_backoff;
                let delay = policy.jittered(policy.delay_for(*count));
                *count += 1;
                warn!(object = %object_ref, error = %e, failures = *count, retry_in = ?delay, "Reconcile failed");
                Some(delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(name: &str) -> ObjectRef {
        ObjectRef::new("ResourceGroup", "default", name)
    }

    #[test]
    fn test_queue_deduplicates() {
        let mut queue = WorkQueue::default();
        queue.push(r("a"));
        queue.push(r("a"));
        queue.push(r("b"));
        assert_eq!(queue.pending.len(), 2);
    }

    #[test]
    fn test_change_during_reconcile_runs_once_more() {
        let mut queue = WorkQueue::default();
        queue.push(r("a"));
        queue.start_ready(|_| true);
        assert!(queue.pending.is_empty());

        queue.push(r("a"));
        queue.push(r("a"));
        assert!(queue.pending.is_empty());

        queue.finish(&r("a"));
        assert_eq!(queue.pending, VecDeque::from([r("a")]));

        queue.start_ready(|_| true);
        queue.finish(&r("a"));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_rejected_objects_keep_their_order() {
        let mut queue = WorkQueue::default();
        for name in ["a", "b", "c"] {
            queue.push(r(name));
        }
        queue.start_ready(|object_ref| object_ref.name == "b");
        assert_eq!(queue.pending, VecDeque::from([r("a"), r("c")]));
        assert!(queue.in_flight.contains(&r("b")));
    }
}
