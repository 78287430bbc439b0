//! In-process simulated cloud.
//!
//! Long-running writes complete after a configurable number of polls. Paths
//! registered with `status_only_for` instead return immediately without a
//! token and report progress only through `provisioningState` on reads.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{CloudProvider, Credentials, Poll, ProviderError, RemoteResource, ResourceAddress, Result};

/// Number of calls per provider method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub authorize: usize,
    pub get: usize,
    pub put: usize,
    pub delete: usize,
    pub poll: usize,
    pub invoke: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Token {
    op: u64,
}

#[derive(Debug)]
enum Operation {
    Put { id: String, remaining: usize },
    Delete { id: String, remaining: usize },
}

#[derive(Debug)]
struct Entry {
    resource: RemoteResource,
    /// Reads left before a status-only resource reports `Succeeded`.
    settling: usize,
    keys: (String, String),
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, Entry>,
    operations: HashMap<u64, Operation>,
    next_op: u64,
    calls: CallCounts,
    denied: HashMap<String, usize>,
    failures: VecDeque<ProviderError>,
}

pub struct MemoryProvider {
    polls: usize,
    status_only: Vec<String>,
    inner: Mutex<Inner>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            polls: 1,
            status_only: Vec::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Polls (or, for status-only paths, reads) needed before an operation
    /// completes. Zero completes writes synchronously.
    pub fn with_polls(mut self, polls: usize) -> Self {
        self.polls = polls;
        self
    }

    /// Resource paths containing `segment` report progress only through
    /// their provisioning state.
    pub fn status_only_for(mut self, segment: impl Into<String>) -> Self {
        self.status_only.push(segment.into());
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ProviderError::Transport("simulated provider lock poisoned".into()))
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().map(|inner| inner.calls).unwrap_or_default()
    }

    /// Reject the next `times` authorizations for `subscription_id`.
    pub fn deny_authorization(&self, subscription_id: &str, times: usize) {
        if let Ok(mut inner) = self.lock() {
            inner.denied.insert(subscription_id.to_string(), times);
        }
    }

    /// Fail the next non-authorize call with `error`.
    pub fn fail_next(&self, error: ProviderError) {
        if let Ok(mut inner) = self.lock() {
            inner.failures.push_back(error);
        }
    }

    /// Seed a resource as if it had been created out of band.
    pub fn insert(&self, resource: RemoteResource) {
        if let Ok(mut inner) = self.lock() {
            let id = resource.id.clone();
            inner.resources.insert(
                id,
                Entry {
                    resource,
                    settling: 0,
                    keys: (random_key(), random_key()),
                },
            );
        }
    }

    /// Drop a resource as if it had been deleted out of band.
    pub fn remove(&self, id: &str) -> Option<RemoteResource> {
        self.lock()
            .ok()
            .and_then(|mut inner| inner.resources.remove(id).map(|e| e.resource))
    }

    /// Current remote state of a resource, without counting as a call.
    pub fn resource(&self, id: &str) -> Option<RemoteResource> {
        self.lock()
            .ok()
            .and_then(|inner| inner.resources.get(id).map(|e| e.resource.clone()))
    }

    fn is_status_only(&self, id: &str) -> bool {
        self.status_only.iter().any(|segment| id.contains(segment.as_str()))
    }
}

impl Inner {
    fn injected(&mut self) -> Result<()> {
        match self.failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start(&mut self, op: Operation) -> Result<Poll> {
        self.next_op += 1;
        let id = self.next_op;
        self.operations.insert(id, op);
        let token = serde_json::to_vec(&Token { op: id })
            .map_err(|e| ProviderError::InvalidToken(e.to_string()))?;
        Ok(Poll::Pending(token))
    }
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(44)
        .map(char::from)
        .collect()
}

fn set_state(resource: &mut RemoteResource, state: &str) {
    if !resource.properties.is_object() {
        resource.properties = json!({});
    }
    if let Some(props) = resource.properties.as_object_mut() {
        props.insert("provisioningState".into(), Value::String(state.into()));
    }
}

fn resource_from_body(id: &str, body: &Value) -> RemoteResource {
    RemoteResource {
        id: id.to_string(),
        location: body.get("location").and_then(Value::as_str).map(str::to_string),
        properties: body.get("properties").cloned().unwrap_or_else(|| json!({})),
        tags: body
            .get("tags")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    async fn authorize(&self, subscription_id: &str) -> Result<Credentials> {
        let mut inner = self.lock()?;
        inner.calls.authorize += 1;
        if let Some(left) = inner.denied.get_mut(subscription_id) {
            if *left > 0 {
                *left -= 1;
                return Err(ProviderError::Unauthorized {
                    scope: subscription_id.to_string(),
                    message: "role assignment has not propagated".into(),
                });
            }
        }
        Ok(Credentials {
            subscription_id: subscription_id.to_string(),
        })
    }

    async fn get(&self, _creds: &Credentials, addr: &ResourceAddress) -> Result<Option<RemoteResource>> {
        let mut inner = self.lock()?;
        inner.calls.get += 1;
        inner.injected()?;

        let Some(entry) = inner.resources.get_mut(&addr.id) else {
            return Ok(None);
        };
        if entry.settling > 0 {
            entry.settling -= 1;
            if entry.settling == 0 {
                set_state(&mut entry.resource, "Succeeded");
            }
        }
        Ok(Some(entry.resource.clone()))
    }

    async fn begin_put(&self, _creds: &Credentials, addr: &ResourceAddress, body: Value) -> Result<Poll> {
        let mut inner = self.lock()?;
        inner.calls.put += 1;
        inner.injected()?;

        let mut resource = resource_from_body(&addr.id, &body);
        let existing = inner.resources.remove(&addr.id);
        let state = if existing.is_some() { "Updating" } else { "Creating" };
        let keys = existing
            .map(|e| e.keys)
            .unwrap_or_else(|| (random_key(), random_key()));
        debug!(id = %addr.id, "Simulated put");

        if self.polls == 0 {
            set_state(&mut resource, "Succeeded");
            inner.resources.insert(addr.id.clone(), Entry { resource, settling: 0, keys });
            return Ok(Poll::Done);
        }

        set_state(&mut resource, state);

        if self.is_status_only(&addr.id) {
            inner.resources.insert(
                addr.id.clone(),
                Entry {
                    resource,
                    settling: self.polls,
                    keys,
                },
            );
            return Ok(Poll::Done);
        }

        inner.resources.insert(addr.id.clone(), Entry { resource, settling: 0, keys });
        inner.start(Operation::Put {
            id: addr.id.clone(),
            remaining: self.polls,
        })
    }

    async fn begin_delete(&self, _creds: &Credentials, addr: &ResourceAddress) -> Result<Poll> {
        let mut inner = self.lock()?;
        inner.calls.delete += 1;
        inner.injected()?;

        if self.polls == 0 {
            inner.resources.remove(&addr.id);
            return Ok(Poll::Done);
        }
        let Some(entry) = inner.resources.get_mut(&addr.id) else {
            return Ok(Poll::Done);
        };
        set_state(&mut entry.resource, "Deleting");
        inner.start(Operation::Delete {
            id: addr.id.clone(),
            remaining: self.polls,
        })
    }

    async fn poll(&self, _creds: &Credentials, token: &[u8]) -> Result<Poll> {
        let mut inner = self.lock()?;
        inner.calls.poll += 1;
        inner.injected()?;

        let Token { op } =
            serde_json::from_slice::<Token>(token).map_err(|e| ProviderError::InvalidToken(e.to_string()))?;
        let finished = match inner.operations.get_mut(&op) {
            None => return Err(ProviderError::InvalidToken(format!("unknown operation {}", op))),
            Some(Operation::Put { remaining, .. }) | Some(Operation::Delete { remaining, .. }) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
        };
        if !finished {
            return Ok(Poll::Pending(token.to_vec()));
        }

        match inner.operations.remove(&op) {
            Some(Operation::Put { id, .. }) => {
                if let Some(entry) = inner.resources.get_mut(&id) {
                    set_state(&mut entry.resource, "Succeeded");
                }
            }
            Some(Operation::Delete { id, .. }) => {
                inner.resources.remove(&id);
            }
            None => {}
        }
        Ok(Poll::Done)
    }

    async fn invoke(&self, _creds: &Credentials, addr: &ResourceAddress, action: &str) -> Result<Value> {
        let mut inner = self.lock()?;
        inner.calls.invoke += 1;
        inner.injected()?;

        let entry = inner
            .resources
            .get(&addr.id)
            .ok_or_else(|| ProviderError::NotFound(addr.id.clone()))?;
        match action {
            "listKeys" => Ok(json!({
                "primaryKey": entry.keys.0,
                "secondaryKey": entry.keys.1,
            })),
            other => Err(ProviderError::Operation {
                status: 400,
                message: format!("unsupported action {}", other),
            }),
        }
    }
}
