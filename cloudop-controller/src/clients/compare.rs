//! Field comparison for the update short-circuit.
//!
//! Provider-controlled enums (SKU names, versions, families) come back with
//! whatever casing the provider prefers, so they compare case-insensitively.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

pub fn str_differs(desired: &str, observed: Option<&Value>) -> bool {
    match observed.and_then(Value::as_str) {
        Some(observed) => !desired.eq_ignore_ascii_case(observed),
        None => true,
    }
}

pub fn bool_differs(desired: bool, observed: Option<&Value>) -> bool {
    observed.and_then(Value::as_bool) != Some(desired)
}

pub fn int_differs(desired: i64, observed: Option<&Value>) -> bool {
    observed.and_then(Value::as_i64) != Some(desired)
}

/// Tags are user data and compare exactly.
pub fn tags_differ(desired: &BTreeMap<String, String>, observed: &BTreeMap<String, String>) -> bool {
    desired != observed
}

/// Order-insensitive comparison of a list of provider strings.
pub fn set_differs(desired: &[String], observed: Option<&Value>) -> bool {
    let Some(observed) = observed.and_then(Value::as_array) else {
        return !desired.is_empty();
    };
    let observed: BTreeSet<String> = observed
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_ascii_lowercase)
        .collect();
    let desired: BTreeSet<String> = desired.iter().map(|s| s.to_ascii_lowercase()).collect();
    desired != observed
}

/// Walk a dotted path (`sku.name`) into a JSON value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}
