//! In-memory store, used in development mode and in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use super::error::{Result, StoreError};
use super::event::Event;
use super::rules::{self, Write};
use super::traits::ObjectStore;
use crate::object::{Object, ObjectRef};

pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Object>>,
    events: broadcast::Sender<Event>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    async fn modify<F>(&self, key: String, rule: F) -> Result<Object>
    where
        F: FnOnce(Option<&Object>) -> Result<Write>,
    {
        let mut objects = self.objects.write().await;
        let write = rule(objects.get(&key))?;

        match &write {
            Write::Put(o) | Write::Status(o) => {
                objects.insert(key, o.clone());
            }
            Write::Remove(_) => {
                objects.remove(&key);
            }
            Write::Unchanged(_) => {}
        }
        drop(objects);

        if let Some(event) = write.event() {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        Ok(write.into_object())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, object_ref: &ObjectRef) -> Result<Object> {
        self.objects
            .read()
            .await
            .get(&object_ref.key())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(object_ref.to_string()))
    }

    async fn list(&self, kind: Option<&str>) -> Result<Vec<Object>> {
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|o| kind.is_none_or(|k| o.kind == k))
            .cloned()
            .collect())
    }

    async fn create(&self, object: Object) -> Result<Object> {
        let key = object.object_ref().key();
        self.modify(key, |current| rules::create(current, object))
            .await
    }

    async fn update(&self, object: &Object) -> Result<Object> {
        self.modify(object.object_ref().key(), |current| {
            rules::update(current, object)
        })
        .await
    }

    async fn update_status(&self, object: &Object) -> Result<Object> {
        self.modify(object.object_ref().key(), |current| {
            rules::update_status(current, object)
        })
        .await
    }

    async fn delete(&self, object_ref: &ObjectRef) -> Result<()> {
        self.modify(object_ref.key(), |current| rules::delete(current, object_ref))
            .await
            .map(|_| ())
    }

    async fn apply(&self, object: Object) -> Result<Object> {
        let key = object.object_ref().key();
        self.modify(key, |current| rules::apply(current, object))
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
