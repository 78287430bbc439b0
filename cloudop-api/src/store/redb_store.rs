//! Persistent store backed by redb.
//!
//! Objects are stored as JSON under their `kind/namespace/name` key, so status
//! (including continuation tokens) survives process restarts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::broadcast;
use tracing::debug;

use super::error::{Result, StoreError};
use super::event::Event;
use super::rules::{self, Write};
use super::traits::ObjectStore;
use crate::object::{Object, ObjectRef};

const TABLE_OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

fn storage<E: Into<redb::Error>>(e: E) -> StoreError {
    StoreError::Storage(e.into().to_string())
}

fn read(db: &Database, key: &str) -> Result<Option<Object>> {
    let txn = db.begin_read().map_err(storage)?;
    let table = txn.open_table(TABLE_OBJECTS).map_err(storage)?;
    let value = table.get(key).map_err(storage)?;
    match value {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        None => Ok(None),
    }
}

fn list(db: &Database, kind: Option<&str>) -> Result<Vec<Object>> {
    let txn = db.begin_read().map_err(storage)?;
    let table = txn.open_table(TABLE_OBJECTS).map_err(storage)?;

    let mut objects = Vec::new();
    for entry in table.iter().map_err(storage)? {
        let (_, value) = entry.map_err(storage)?;
        let object: Object = serde_json::from_slice(value.value())?;
        if kind.is_none_or(|k| object.kind == k) {
            objects.push(object);
        }
    }
    Ok(objects)
}

/// Run `rule` against the stored object and commit what it decides.
fn modify<F>(db: &Database, key: &str, rule: F) -> Result<Write>
where
    F: FnOnce(Option<&Object>) -> Result<Write>,
{
    let txn = db.begin_write().map_err(storage)?;
    let write = {
        let mut table = txn.open_table(TABLE_OBJECTS).map_err(storage)?;
        let current: Option<Object> = match table.get(key).map_err(storage)? {
            Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
            None => None,
        };

        let write = rule(current.as_ref())?;
        match &write {
            Write::Put(o) | Write::Status(o) => {
                let bytes = serde_json::to_vec(o)?;
                table.insert(key, bytes.as_slice()).map_err(storage)?;
            }
            Write::Remove(_) => {
                table.remove(key).map_err(storage)?;
            }
            Write::Unchanged(_) => {}
        }
        write
    };
    txn.commit().map_err(storage)?;
    Ok(write)
}

pub struct RedbStore {
    db: Arc<Database>,
    events: broadcast::Sender<Event>,
}

impl RedbStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(storage)?;

        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(TABLE_OBJECTS).map_err(storage)?;
        txn.commit().map_err(storage)?;

        debug!(path = %path.as_ref().display(), "Opened object store");
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            db: Arc::new(db),
            events,
        })
    }

    /// Run a redb transaction on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Storage(format!("store task failed: {e}")))?
    }

    async fn write<F>(&self, key: String, rule: F) -> Result<Object>
    where
        F: FnOnce(Option<&Object>) -> Result<Write> + Send + 'static,
    {
        let write = self.blocking(move |db| modify(db, &key, rule)).await?;
        if let Some(event) = write.event() {
            let _ = self.events.send(event);
        }
        Ok(write.into_object())
    }
}

#[async_trait]
impl ObjectStore for RedbStore {
    async fn get(&self, object_ref: &ObjectRef) -> Result<Object> {
        let key = object_ref.key();
        self.blocking(move |db| read(db, &key))
            .await?
            .ok_or_else(|| StoreError::NotFound(object_ref.to_string()))
    }

    async fn list(&self, kind: Option<&str>) -> Result<Vec<Object>> {
        let kind = kind.map(str::to_string);
        self.blocking(move |db| list(db, kind.as_deref())).await
    }

    async fn create(&self, object: Object) -> Result<Object> {
        let key = object.object_ref().key();
        self.write(key, |current| rules::create(current, object)).await
    }

    async fn update(&self, object: &Object) -> Result<Object> {
        let object = object.clone();
        self.write(object.object_ref().key(), move |current| {
            rules::update(current, &object)
        })
        .await
    }

    async fn update_status(&self, object: &Object) -> Result<Object> {
        let object = object.clone();
        self.write(object.object_ref().key(), move |current| {
            rules::update_status(current, &object)
        })
        .await
    }

    async fn delete(&self, object_ref: &ObjectRef) -> Result<()> {
        let target = object_ref.clone();
        self.write(object_ref.key(), move |current| rules::delete(current, &target))
            .await
            .map(|_| ())
    }

    async fn apply(&self, object: Object) -> Result<Object> {
        let key = object.object_ref().key();
        self.write(key, |current| rules::apply(current, object)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
