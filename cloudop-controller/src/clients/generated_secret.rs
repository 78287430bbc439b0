//! Generated secrets: random values written into a `Secret` object.

use std::sync::Arc;

use async_trait::async_trait;
use cloudop_api::{Object, ObjectStore, ProvisioningState};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use tracing::info;

use super::secret;
use super::{ResourceClient, SyncResourceClient, decode_spec};
use crate::error::{Error, Result};

pub const KIND: &str = "GeneratedSecret";

fn default_length() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSecretSpec {
    #[serde(default = "default_length")]
    pub length: usize,
    pub keys: Vec<String>,
    /// Target secret. Defaults to the object name.
    #[serde(default)]
    pub secret_name: Option<String>,
}

impl GeneratedSecretSpec {
    fn target<'a>(&'a self, object: &'a Object) -> &'a str {
        self.secret_name.as_deref().unwrap_or(object.name())
    }
}

fn generate(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub struct GeneratedSecretClient {
    store: Arc<dyn ObjectStore>,
}

impl GeneratedSecretClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResourceClient for GeneratedSecretClient {
    // Nothing leaves the store, so there is no subscription to bind.
    async fn authorize(&self, object: &Object) -> Result<()> {
        let spec: GeneratedSecretSpec = decode_spec(object, KIND)?;
        if spec.length == 0 {
            return Err(Error::type_mismatch(KIND, "length must be positive"));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncResourceClient for GeneratedSecretClient {
    /// Fill in missing keys. Existing values are never regenerated.
    async fn ensure(&self, object: &mut Object) -> Result<()> {
        let spec: GeneratedSecretSpec = decode_spec(object, KIND)?;
        let target = spec.target(object).to_string();

        let mut data = secret::read(self.store.as_ref(), object.namespace(), &target)
            .await?
            .map(|s| s.data)
            .unwrap_or_default();
        let mut generated = 0;
        for key in &spec.keys {
            data.entry(key.clone()).or_insert_with(|| {
                generated += 1;
                generate(spec.length)
            });
        }

        secret::write(self.store.as_ref(), object.namespace(), &target, data).await?;
        if generated > 0 {
            info!(namespace = object.namespace(), secret = %target, generated, "Generated secret values");
        }

        object.status.provisioning_state = Some(ProvisioningState::Succeeded);
        object.status.resource_id = Some(secret::secret_ref(object.namespace(), &target).to_string());
        Ok(())
    }

    async fn delete(&self, object: &mut Object) -> Result<()> {
        let spec: GeneratedSecretSpec = decode_spec(object, KIND)?;
        let target = spec.target(object).to_string();
        secret::remove(self.store.as_ref(), object.namespace(), &target).await?;
        object.status.provisioning_state = Some(ProvisioningState::NotFound);
        Ok(())
    }
}
