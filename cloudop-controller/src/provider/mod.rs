//! Cloud provider contract.
//!
//! The narrow surface the resource clients need from a management API:
//! credential binding, reads, long-running writes that hand out a
//! continuation token, and resource actions such as `listKeys`.

mod arm;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use cloudop_api::ProvisioningState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use arm::ArmProvider;
pub use memory::{CallCounts, MemoryProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not authorized for {scope}: {message}")]
    Unauthorized { scope: String, message: String },

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("operation failed ({status}): {message}")]
    Operation { status: u16, message: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("invalid continuation token: {0}")]
    InvalidToken(String),
}

impl ProviderError {
    /// Failures that say nothing about the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transport(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Credentials bound to one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub subscription_id: String,
}

/// A resource path together with the API version it is served under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAddress {
    pub id: String,
    pub api_version: &'static str,
}

impl ResourceAddress {
    pub fn new(id: impl Into<String>, api_version: &'static str) -> Self {
        Self {
            id: id.into(),
            api_version,
        }
    }
}

/// Remote representation of a resource as returned by a read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl RemoteResource {
    /// Resources without a reported state (resource groups on some API
    /// versions) are treated as settled.
    pub fn provisioning_state(&self) -> ProvisioningState {
        self.properties
            .get("provisioningState")
            .and_then(Value::as_str)
            .map(ProvisioningState::from)
            .unwrap_or(ProvisioningState::Succeeded)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// Result of starting or polling a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Done,
    Pending(Vec<u8>),
}

impl Poll {
    pub fn is_done(&self) -> bool {
        matches!(self, Poll::Done)
    }
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Bind credentials for a subscription.
    async fn authorize(&self, subscription_id: &str) -> Result<Credentials>;

    /// Read a resource. `None` if it does not exist.
    async fn get(&self, creds: &Credentials, addr: &ResourceAddress) -> Result<Option<RemoteResource>>;

    /// Start creating or replacing a resource.
    async fn begin_put(&self, creds: &Credentials, addr: &ResourceAddress, body: Value) -> Result<Poll>;

    /// Start deleting a resource. Deleting an absent resource is `Done`.
    async fn begin_delete(&self, creds: &Credentials, addr: &ResourceAddress) -> Result<Poll>;

    /// Check a pending operation. Provider-side failure of the operation is
    /// reported as an error.
    async fn poll(&self, creds: &Credentials, token: &[u8]) -> Result<Poll>;

    /// Invoke a resource action (`listKeys`, ...).
    async fn invoke(&self, creds: &Credentials, addr: &ResourceAddress, action: &str) -> Result<Value>;
}
