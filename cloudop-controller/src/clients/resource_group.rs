//! Resource groups.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cloudop_api::Object;
use serde::Deserialize;
use serde_json::{Value, json};

use super::arm::ArmKind;
use super::compare::tags_differ;
use crate::error::Result;
use crate::provider::RemoteResource;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupSpec {
    /// Defaults to the object name.
    #[serde(default)]
    pub name: Option<String>,
    pub location: String,
    pub subscription_id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

pub struct ResourceGroup;

#[async_trait]
impl ArmKind for ResourceGroup {
    type Spec = ResourceGroupSpec;

    const KIND: &'static str = "ResourceGroup";
    const API_VERSION: &'static str = "2021-04-01";

    fn subscription<'a>(&self, spec: &'a ResourceGroupSpec) -> &'a str {
        &spec.subscription_id
    }

    fn resource_id(&self, object: &Object, spec: &ResourceGroupSpec) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            spec.subscription_id,
            spec.name.as_deref().unwrap_or(object.name())
        )
    }

    async fn payload(&self, _object: &Object, spec: &ResourceGroupSpec) -> Result<Value> {
        Ok(json!({
            "location": spec.location,
            "tags": spec.tags,
        }))
    }

    // Name, subscription and location are fixed at creation.
    fn needs_update(&self, spec: &ResourceGroupSpec, remote: &RemoteResource) -> bool {
        tags_differ(&spec.tags, &remote.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> Object {
        Object::new(
            "ResourceGroup",
            "default",
            "rg-test",
            json!({
                "location": "westus2",
                "subscriptionId": "00000000-0000-0000-0000-000000000000",
                "tags": { "env": "dev" }
            }),
        )
    }

    #[test]
    fn test_resource_id_defaults_to_object_name() {
        let obj = object();
        let spec: ResourceGroupSpec = obj.spec_as().unwrap();
        assert_eq!(
            ResourceGroup.resource_id(&obj, &spec),
            "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg-test"
        );
    }

    #[test]
    fn test_location_change_is_ignored() {
        let spec: ResourceGroupSpec = object().spec_as().unwrap();
        let remote = RemoteResource {
            location: Some("eastus".into()),
            tags: spec.tags.clone(),
            ..Default::default()
        };
        assert!(!ResourceGroup.needs_update(&spec, &remote));

        let untagged = RemoteResource::default();
        assert!(ResourceGroup.needs_update(&spec, &untagged));
    }
}
