//! Virtual networks with inline subnets.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cloudop_api::Object;
use serde::Deserialize;
use serde_json::{Value, json};

use super::arm::ArmKind;
use super::compare::{lookup, set_differs, str_differs, tags_differ};
use crate::error::Result;
use crate::provider::RemoteResource;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub name: String,
    pub address_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetworkSpec {
    pub location: String,
    pub resource_group: String,
    pub subscription_id: String,
    pub address_prefixes: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

pub struct VirtualNetwork;

fn subnets_differ(desired: &[Subnet], observed: Option<&Value>) -> bool {
    let observed = observed.and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
    if desired.len() != observed.len() {
        return true;
    }
    desired.iter().any(|want| {
        let found = observed.iter().find(|have| {
            have.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n.eq_ignore_ascii_case(&want.name))
        });
        match found {
            Some(have) => str_differs(&want.address_prefix, lookup(have, "properties.addressPrefix")),
            None => true,
        }
    })
}

#[async_trait]
impl ArmKind for VirtualNetwork {
    type Spec = VirtualNetworkSpec;

    const KIND: &'static str = "VirtualNetwork";
    const API_VERSION: &'static str = "2023-05-01";

    fn subscription<'a>(&self, spec: &'a VirtualNetworkSpec) -> &'a str {
        &spec.subscription_id
    }

    fn resource_id(&self, object: &Object, spec: &VirtualNetworkSpec) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}",
            spec.subscription_id,
            spec.resource_group,
            object.name()
        )
    }

    async fn payload(&self, _object: &Object, spec: &VirtualNetworkSpec) -> Result<Value> {
        let subnets: Vec<Value> = spec
            .subnets
            .iter()
            .map(|s| json!({ "name": s.name, "properties": { "addressPrefix": s.address_prefix } }))
            .collect();
        Ok(json!({
            "location": spec.location,
            "tags": spec.tags,
            "properties": {
                "addressSpace": { "addressPrefixes": spec.address_prefixes },
                "subnets": subnets,
            }
        }))
    }

    fn needs_update(&self, spec: &VirtualNetworkSpec, remote: &RemoteResource) -> bool {
        set_differs(
            &spec.address_prefixes,
            lookup(&remote.properties, "addressSpace.addressPrefixes"),
        ) || subnets_differ(&spec.subnets, remote.property("subnets"))
            || tags_differ(&spec.tags, &remote.tags)
    }
}
