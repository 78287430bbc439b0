//! `Secret` objects in the declarative store.
//!
//! Secrets are plain data objects written by other clients; they are not
//! reconciled themselves.

use std::collections::BTreeMap;

use cloudop_api::{Object, ObjectRef, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const SECRET_KIND: &str = "Secret";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretData {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Reference to one value inside a secret.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

pub fn secret_ref(namespace: &str, name: &str) -> ObjectRef {
    ObjectRef::new(SECRET_KIND, namespace, name)
}

/// Read a secret. `None` if it does not exist.
pub async fn read(store: &dyn ObjectStore, namespace: &str, name: &str) -> Result<Option<SecretData>> {
    match store.get(&secret_ref(namespace, name)).await {
        Ok(object) => object
            .spec_as()
            .map(Some)
            .map_err(|e| Error::type_mismatch(SECRET_KIND, e)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read one value. A missing secret or key is reported as a conflict, since
/// it is usually written by another object that has not converged yet.
pub async fn read_key(store: &dyn ObjectStore, namespace: &str, key_ref: &SecretKeyRef) -> Result<String> {
    let secret = read(store, namespace, &key_ref.name).await?.ok_or_else(|| {
        Error::Conflict(format!("secret {}/{} does not exist yet", namespace, key_ref.name))
    })?;
    secret.data.get(&key_ref.key).cloned().ok_or_else(|| {
        Error::Conflict(format!(
            "secret {}/{} has no key {}",
            namespace, key_ref.name, key_ref.key
        ))
    })
}

/// Create or replace a secret's data. Returns true if anything was written.
pub async fn write(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<bool> {
    let spec = serde_json::to_value(SecretData { data }).map_err(cloudop_api::StoreError::from)?;
    match store.get(&secret_ref(namespace, name)).await {
        Ok(mut existing) => {
            if existing.spec == spec {
                return Ok(false);
            }
            existing.spec = spec;
            store.update(&existing).await?;
        }
        Err(e) if e.is_not_found() => {
            store
                .create(Object::new(SECRET_KIND, namespace, name, spec))
                .await?;
        }
        Err(e) => return Err(e.into()),
    }
    debug!(namespace, name, "Secret written");
    Ok(true)
}

/// Remove a secret. Absence is fine.
pub async fn remove(store: &dyn ObjectStore, namespace: &str, name: &str) -> Result<()> {
    match store.delete(&secret_ref(namespace, name)).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudop_api::MemoryStore;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let store = MemoryStore::new();
        assert!(write(&store, "default", "s", data(&[("a", "1")])).await.unwrap());
        assert!(!write(&store, "default", "s", data(&[("a", "1")])).await.unwrap());
        assert!(write(&store, "default", "s", data(&[("a", "2")])).await.unwrap());

        let secret = read(&store, "default", "s").await.unwrap().unwrap();
        assert_eq!(secret.data["a"], "2");
    }

    #[tokio::test]
    async fn test_missing_key_is_transient() {
        let store = MemoryStore::new();
        let key_ref = SecretKeyRef {
            name: "pw".into(),
            key: "password".into(),
        };
        let err = read_key(&store, "default", &key_ref).await.unwrap_err();
        assert!(err.is_transient());

        write(&store, "default", "pw", data(&[("password", "hunter2")]))
            .await
            .unwrap();
        assert_eq!(read_key(&store, "default", &key_ref).await.unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_remove_tolerates_absence() {
        let store = MemoryStore::new();
        remove(&store, "default", "nope").await.unwrap();
    }
}
