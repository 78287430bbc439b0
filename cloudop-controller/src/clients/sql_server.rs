//! SQL servers. The administrator password is read from a `Secret`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cloudop_api::{Object, ObjectStore};
use serde::Deserialize;
use serde_json::{Value, json};

use super::arm::ArmKind;
use super::compare::{str_differs, tags_differ};
use super::secret::{self, SecretKeyRef};
use crate::error::Result;
use crate::provider::RemoteResource;

fn default_version() -> String {
    "12.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlServerSpec {
    pub location: String,
    pub resource_group: String,
    pub subscription_id: String,
    pub administrator_login: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub password_secret: SecretKeyRef,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

pub struct SqlServer {
    store: Arc<dyn ObjectStore>,
}

impl SqlServer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArmKind for SqlServer {
    type Spec = SqlServerSpec;

    const KIND: &'static str = "SqlServer";
    const API_VERSION: &'static str = "2021-11-01";

    fn subscription<'a>(&self, spec: &'a SqlServerSpec) -> &'a str {
        &spec.subscription_id
    }

    fn resource_id(&self, object: &Object, spec: &SqlServerSpec) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Sql/servers/{}",
            spec.subscription_id,
            spec.resource_group,
            object.name()
        )
    }

    async fn payload(&self, object: &Object, spec: &SqlServerSpec) -> Result<Value> {
        let password =
            secret::read_key(self.store.as_ref(), object.namespace(), &spec.password_secret).await?;
        Ok(json!({
            "location": spec.location,
            "tags": spec.tags,
            "properties": {
                "administratorLogin": spec.administrator_login,
                "administratorLoginPassword": password,
                "version": spec.version,
            }
        }))
    }

    // The login is fixed at creation and the password is write-only.
    fn needs_update(&self, spec: &SqlServerSpec, remote: &RemoteResource) -> bool {
        str_differs(&spec.version, remote.property("version")) || tags_differ(&spec.tags, &remote.tags)
    }
}
