//! Kind registry.
//!
//! Maps an object kind to everything needed to dispatch it: how to build its
//! client, which contract shape the client has, how the one-shot path paces
//! it, and how many objects of the kind may reconcile at once. Built once at
//! startup and shared read-only.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::clients::{
    ArmClient, ClientDeps, ClientHandle, GeneratedSecretClient, RedisCache, ResourceGroup,
    SqlServer, VirtualNetwork,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureStrategy {
    Sync,
    Async,
}

/// How the one-shot path waits between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStrategy {
    /// Exponential backoff; the provider hands out continuation tokens.
    Backoff,
    /// Constant interval; progress is only visible as a status field.
    FixedInterval,
}

pub type Constructor = Arc<dyn Fn(&ClientDeps) -> Result<ClientHandle> + Send + Sync>;

#[derive(Clone)]
pub struct KindEntry {
    pub kind: String,
    pub strategy: EnsureStrategy,
    pub polling: PollingStrategy,
    pub requires_store: bool,
    pub max_concurrent: usize,
    pub constructor: Constructor,
}

impl fmt::Debug for KindEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindEntry")
            .field("kind", &self.kind)
            .field("strategy", &self.strategy)
            .field("polling", &self.polling)
            .field("requires_store", &self.requires_store)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl KindEntry {
    pub fn new<F>(kind: impl Into<String>, strategy: EnsureStrategy, constructor: F) -> Self
    where
        F: Fn(&ClientDeps) -> Result<ClientHandle> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            strategy,
            polling: PollingStrategy::Backoff,
            requires_store: false,
            max_concurrent: 5,
            constructor: Arc::new(constructor),
        }
    }

    pub fn polling(mut self, polling: PollingStrategy) -> Self {
        self.polling = polling;
        self
    }

    pub fn requires_store(mut self) -> Self {
        self.requires_store = true;
        self
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = limit.max(1);
        self
    }

    /// Build a client, checking the wiring against the entry.
    pub fn client(&self, deps: &ClientDeps) -> Result<ClientHandle> {
        if self.requires_store && deps.store.is_none() {
            return Err(Error::type_mismatch(&self.kind, "kind requires a store client"));
        }
        let handle = (self.constructor)(deps)?;
        let strategy = if handle.is_sync() {
            EnsureStrategy::Sync
        } else {
            EnsureStrategy::Async
        };
        if strategy != self.strategy {
            return Err(Error::type_mismatch(
                &self.kind,
                format!("registered as {:?} but constructor built a {:?} client", self.strategy, strategy),
            ));
        }
        Ok(handle)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, KindEntry>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// All kinds this controller knows how to reconcile.
    pub fn standard() -> Self {
        Self::builder()
            .register(
                KindEntry::new("ResourceGroup", EnsureStrategy::Async, |deps| {
                    Ok(ClientHandle::Async(Arc::new(ArmClient::new(
                        ResourceGroup,
                        deps.provider.clone(),
                    ))))
                })
                .max_concurrent(1),
            )
            .register(
                KindEntry::new("VirtualNetwork", EnsureStrategy::Async, |deps| {
                    Ok(ClientHandle::Async(Arc::new(ArmClient::new(
                        VirtualNetwork,
                        deps.provider.clone(),
                    ))))
                })
                .max_concurrent(1),
            )
            .register(
                KindEntry::new("RedisCache", EnsureStrategy::Async, |deps| {
                    let kind = RedisCache::new(deps.store("RedisCache")?);
                    Ok(ClientHandle::Async(Arc::new(ArmClient::new(
                        kind,
                        deps.provider.clone(),
                    ))))
                })
                .polling(PollingStrategy::FixedInterval)
                .requires_store()
                .max_concurrent(5),
            )
            .register(
                KindEntry::new("SqlServer", EnsureStrategy::Async, |deps| {
                    let kind = SqlServer::new(deps.store("SqlServer")?);
                    Ok(ClientHandle::Async(Arc::new(ArmClient::new(
                        kind,
                        deps.provider.clone(),
                    ))))
                })
                .requires_store()
                .max_concurrent(5),
            )
            .register(
                KindEntry::new("GeneratedSecret", EnsureStrategy::Sync, |deps| {
                    Ok(ClientHandle::Sync(Arc::new(GeneratedSecretClient::new(
                        deps.store("GeneratedSecret")?,
                    ))))
                })
                .requires_store()
                .max_concurrent(15),
            )
            .build()
    }

    pub fn get(&self, kind: &str) -> Option<&KindEntry> {
        self.entries.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn entries(&self) -> impl Iterator<Item = &KindEntry> {
        self.entries.values()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<String, KindEntry>,
}

impl RegistryBuilder {
    /// Register a kind. A later registration of the same kind replaces it.
    pub fn register(mut self, entry: KindEntry) -> Self {
        self.entries.insert(entry.kind.clone(), entry);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
        }
    }
}
