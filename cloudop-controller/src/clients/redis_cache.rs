//! Redis caches.
//!
//! The provider reports cache progress only through `provisioningState`, and
//! once the cache is up its access keys are copied into a `Secret`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cloudop_api::{Object, ObjectStore};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::arm::{ArmKind, Session};
use super::compare::{bool_differs, int_differs, lookup, str_differs, tags_differ};
use super::secret;
use crate::error::{Error, Result};
use crate::provider::RemoteResource;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sku {
    pub name: String,
    pub family: String,
    pub capacity: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisCacheSpec {
    pub location: String,
    pub resource_group: String,
    pub subscription_id: String,
    pub sku: Sku,
    #[serde(default)]
    pub enable_non_ssl_port: bool,
    /// Secret receiving the access keys. Defaults to `<name>-keys`.
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RedisCacheSpec {
    fn secret_name(&self, object: &Object) -> String {
        self.secret_name
            .clone()
            .unwrap_or_else(|| format!("{}-keys", object.name()))
    }
}

pub struct RedisCache {
    store: Arc<dyn ObjectStore>,
}

impl RedisCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArmKind for RedisCache {
    type Spec = RedisCacheSpec;

    const KIND: &'static str = "RedisCache";
    const API_VERSION: &'static str = "2023-08-01";

    fn subscription<'a>(&self, spec: &'a RedisCacheSpec) -> &'a str {
        &spec.subscription_id
    }

    fn resource_id(&self, object: &Object, spec: &RedisCacheSpec) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Cache/Redis/{}",
            spec.subscription_id,
            spec.resource_group,
            object.name()
        )
    }

    async fn payload(&self, _object: &Object, spec: &RedisCacheSpec) -> Result<Value> {
        Ok(json!({
            "location": spec.location,
            "tags": spec.tags,
            "properties": {
                "sku": {
                    "name": spec.sku.name,
                    "family": spec.sku.family,
                    "capacity": spec.sku.capacity,
                },
                "enableNonSslPort": spec.enable_non_ssl_port,
            }
        }))
    }

    fn needs_update(&self, spec: &RedisCacheSpec, remote: &RemoteResource) -> bool {
        let props = &remote.properties;
        str_differs(&spec.sku.name, lookup(props, "sku.name"))
            || str_differs(&spec.sku.family, lookup(props, "sku.family"))
            || int_differs(spec.sku.capacity, lookup(props, "sku.capacity"))
            || bool_differs(spec.enable_non_ssl_port, props.get("enableNonSslPort"))
            || tags_differ(&spec.tags, &remote.tags)
    }

    async fn on_ready(&self, session: &Session<'_>, object: &mut Object, spec: &RedisCacheSpec) -> Result<()> {
        let keys = session
            .provider
            .invoke(session.creds, session.address, "listKeys")
            .await?;

        let mut data = BTreeMap::new();
        for field in ["primaryKey", "secondaryKey"] {
            let value = keys.get(field).and_then(Value::as_str).ok_or_else(|| {
                Error::type_mismatch(Self::KIND, format!("listKeys response lacks {}", field))
            })?;
            data.insert(field.to_string(), value.to_string());
        }
        data.insert(
            "hostName".to_string(),
            format!("{}.redis.cache.windows.net", object.name()),
        );

        let name = spec.secret_name(object);
        if secret::write(self.store.as_ref(), object.namespace(), &name, data).await? {
            info!(namespace = object.namespace(), cache = object.name(), secret = %name, "Access keys stored");
        }
        Ok(())
    }

    async fn on_deleted(&self, object: &Object, spec: &RedisCacheSpec) -> Result<()> {
        secret::remove(self.store.as_ref(), object.namespace(), &spec.secret_name(object)).await
    }
}
