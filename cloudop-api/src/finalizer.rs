//! Finalizer tokens on object metadata.
//!
//! An object may carry finalizers owned by several controllers. These helpers
//! only ever touch the token they are given and keep the others in place.

use crate::object::ObjectMeta;

pub fn has_finalizer(meta: &ObjectMeta, token: &str) -> bool {
    meta.finalizers.iter().any(|f| f == token)
}

/// Add `token` unless it is already present. Returns true if the list changed.
pub fn add_finalizer(meta: &mut ObjectMeta, token: &str) -> bool {
    if has_finalizer(meta, token) {
        return false;
    }
    meta.finalizers.push(token.to_string());
    true
}

/// Remove every occurrence of `token`. Returns true if the list changed.
pub fn remove_finalizer(meta: &mut ObjectMeta, token: &str) -> bool {
    let before = meta.finalizers.len();
    meta.finalizers.retain(|f| f != token);
    meta.finalizers.len() != before
}
