//! Ownership index
//!
//! Which definitions own an object is read straight from the object's
//! `metadata.ownerReferences`; there is no separate index to keep in sync.
//! An object may be owned by several definitions at once, so references are
//! recorded without `controller: true`.

use crate::crd::{DefinitionId, RbacDefinition, API_GROUP, API_VERSION, KIND};
use crate::error::{OperatorError, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

/// Label put on every generated object, used to scope list and watch calls
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "rbac-operator";

/// Annotation holding the hash of the content the operator last wrote
///
/// Co-owners of a shared object compare their desired content against it:
/// a match means the live content drifted and may be restored, anything else
/// means the owners disagree.
pub const CONTENT_HASH_ANNOTATION: &str = "rbac.hupe1980.github.io/content-hash";

/// Label selector matching every generated object
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Labels every generated object carries
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

fn is_definition_ref(owner: &OwnerReference) -> bool {
    owner.kind == KIND
        && owner
            .api_version
            .split_once('/')
            .is_some_and(|(group, _)| group == API_GROUP)
}

/// All definitions referenced by an object's owner references
pub fn owners_of(meta: &ObjectMeta) -> BTreeSet<DefinitionId> {
    meta.owner_references
        .iter()
        .flatten()
        .filter(|o| is_definition_ref(o))
        .map(|o| DefinitionId::cluster(o.name.clone()))
        .collect()
}

/// Whether `id` is among the object's owners
pub fn is_owned_by(meta: &ObjectMeta, id: &DefinitionId) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| is_definition_ref(o) && o.name == id.name)
}

/// Whether the object is owned by some definition other than `id`
pub fn has_other_owners(meta: &ObjectMeta, id: &DefinitionId) -> bool {
    owners_of(meta).iter().any(|owner| owner != id)
}

/// Build the owner reference generated objects carry for `definition`
pub fn owner_reference(definition: &RbacDefinition) -> Result<OwnerReference> {
    let uid = definition.uid().ok_or_else(|| {
        OperatorError::InvalidSpec(format!(
            "RbacDefinition {} has no uid yet",
            definition.name_any()
        ))
    })?;

    Ok(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: definition.name_any(),
        uid,
        controller: None,
        block_owner_deletion: Some(true),
    })
}

/// Add or refresh `owner` on the object
///
/// An existing reference to the same definition with a stale uid is
/// replaced. Returns whether the metadata changed.
pub fn add_owner(meta: &mut ObjectMeta, owner: &OwnerReference) -> bool {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs
        .iter_mut()
        .find(|o| is_definition_ref(o) && o.name == owner.name)
    {
        Some(existing) if existing == owner => false,
        Some(existing) => {
            *existing = owner.clone();
            true
        }
        None => {
            refs.push(owner.clone());
            true
        }
    }
}

/// Remove `id`'s reference from the object, returning whether one was removed
pub fn remove_owner(meta: &mut ObjectMeta, id: &DefinitionId) -> bool {
    let Some(refs) = meta.owner_references.as_mut() else {
        return false;
    };
    let before = refs.len();
    refs.retain(|o| !(is_definition_ref(o) && o.name == id.name));
    let removed = refs.len() != before;
    if refs.is_empty() {
        meta.owner_references = None;
    }
    removed
}

/// Whether the object carries `owner` exactly (same uid) and all managed labels
pub fn metadata_current(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    let owned = meta.owner_references.iter().flatten().any(|o| o == owner);
    let labelled = managed_labels()
        .iter()
        .all(|(k, v)| meta.labels.as_ref().and_then(|l| l.get(k)) == Some(v));
    owned && labelled
}

/// Content hash recorded by the last write, if any
pub fn recorded_content_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(CONTENT_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Record the content hash of the object about to be written
pub fn set_content_hash(meta: &mut ObjectMeta, hash: String) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(CONTENT_HASH_ANNOTATION.to_string(), hash);
}

/// Merge the managed labels into the object's labels
pub fn ensure_managed_labels(meta: &mut ObjectMeta) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(managed_labels());
}
