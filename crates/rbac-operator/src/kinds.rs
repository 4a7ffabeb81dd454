//! Managed RBAC kinds
//!
//! The five generated kinds share one CRUD shape. [`ManagedResource`] is the
//! per-kind adapter: it names the kind and exposes the fields the operator
//! owns, so the engine, client and watchers are written once, generically.

use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Anything the cluster client can read and watch
pub trait ClusterResource:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// The kinds of object the operator generates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RbacKind {
    ServiceAccount,
    ClusterRole,
    Role,
    ClusterRoleBinding,
    RoleBinding,
}

impl RbacKind {
    /// Creation order: identities and roles before the bindings that use them
    pub const ALL: [RbacKind; 5] = [
        RbacKind::ServiceAccount,
        RbacKind::ClusterRole,
        RbacKind::Role,
        RbacKind::ClusterRoleBinding,
        RbacKind::RoleBinding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RbacKind::ServiceAccount => "ServiceAccount",
            RbacKind::ClusterRole => "ClusterRole",
            RbacKind::Role => "Role",
            RbacKind::ClusterRoleBinding => "ClusterRoleBinding",
            RbacKind::RoleBinding => "RoleBinding",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        matches!(
            self,
            RbacKind::ServiceAccount | RbacKind::Role | RbacKind::RoleBinding
        )
    }
}

impl fmt::Display for RbacKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind + namespace + name of a generated object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: RbacKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn of<K: ManagedResource>(obj: &K) -> Self {
        Self {
            kind: K::MANAGED_KIND,
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    /// `namespace/name`, or `name` for cluster-scoped objects
    pub fn path(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path())
    }
}

/// Per-kind adapter for generated objects
pub trait ManagedResource: ClusterResource {
    const MANAGED_KIND: RbacKind;

    /// The fields the operator owns, used for diffing
    fn content(&self) -> serde_json::Value;

    /// Copy the owned fields of `desired` onto `self`
    fn apply_content(&mut self, desired: &Self);

    /// Whether moving to `desired` cannot be done in place
    fn requires_replace(&self, _desired: &Self) -> bool {
        false
    }

    fn content_matches(&self, desired: &Self) -> bool {
        self.content() == desired.content()
    }

    /// Truncated SHA-256 of [`ManagedResource::content`], stable across releases
    fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.content().to_string().as_bytes());
        hex::encode(&digest[..8])
    }
}

impl ManagedResource for ServiceAccount {
    const MANAGED_KIND: RbacKind = RbacKind::ServiceAccount;

    fn content(&self) -> serde_json::Value {
        let pull_secrets: Vec<&str> = self
            .image_pull_secrets
            .iter()
            .flatten()
            .map(|s: &LocalObjectReference| s.name.as_str())
            .collect();
        serde_json::json!({
            "automountServiceAccountToken": self.automount_service_account_token,
            "imagePullSecrets": pull_secrets,
        })
    }

    fn apply_content(&mut self, desired: &Self) {
        self.automount_service_account_token = desired.automount_service_account_token;
        self.image_pull_secrets = desired.image_pull_secrets.clone();
    }
}

impl ManagedResource for ClusterRole {
    const MANAGED_KIND: RbacKind = RbacKind::ClusterRole;

    fn content(&self) -> serde_json::Value {
        serde_json::json!({ "rules": self.rules })
    }

    fn apply_content(&mut self, desired: &Self) {
        self.rules = desired.rules.clone();
    }
}

impl ManagedResource for Role {
    const MANAGED_KIND: RbacKind = RbacKind::Role;

    fn content(&self) -> serde_json::Value {
        serde_json::json!({ "rules": self.rules })
    }

    fn apply_content(&mut self, desired: &Self) {
        self.rules = desired.rules.clone();
    }
}

impl ManagedResource for ClusterRoleBinding {
    const MANAGED_KIND: RbacKind = RbacKind::ClusterRoleBinding;

    fn content(&self) -> serde_json::Value {
        serde_json::json!({ "roleRef": self.role_ref, "subjects": self.subjects })
    }

    fn apply_content(&mut self, desired: &Self) {
        self.role_ref = desired.role_ref.clone();
        self.subjects = desired.subjects.clone();
    }

    // roleRef is immutable on the API server
    fn requires_replace(&self, desired: &Self) -> bool {
        self.role_ref != desired.role_ref
    }
}

impl ManagedResource for RoleBinding {
    const MANAGED_KIND: RbacKind = RbacKind::RoleBinding;

    fn content(&self) -> serde_json::Value {
        serde_json::json!({ "roleRef": self.role_ref, "subjects": self.subjects })
    }

    fn apply_content(&mut self, desired: &Self) {
        self.role_ref = desired.role_ref.clone();
        self.subjects = desired.subjects.clone();
    }

    fn requires_replace(&self, desired: &Self) -> bool {
        self.role_ref != desired.role_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::{RoleRef, Subject};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn binding(role: &str, subject: &str) -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some("rb".to_string()),
                namespace: Some("ns1".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: role.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "User".to_string(),
                name: subject.to_string(),
                api_group: Some("rbac.authorization.k8s.io".to_string()),
                namespace: None,
            }]),
        }
    }

    #[test]
    fn test_kind_order_puts_bindings_last() {
        let bindings_start = RbacKind::ALL
            .iter()
            .position(|k| *k == RbacKind::ClusterRoleBinding)
            .unwrap();
        assert!(RbacKind::ALL[..bindings_start]
            .iter()
            .all(|k| !k.as_str().ends_with("Binding")));
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::of(&binding("edit", "alice"));
        assert_eq!(key.to_string(), "RoleBinding ns1/rb");
        assert!(key.kind.is_namespaced());
        assert!(!RbacKind::ClusterRole.is_namespaced());
    }

    #[test]
    fn test_content_ignores_metadata() {
        let a = binding("edit", "alice");
        let mut b = a.clone();
        b.metadata.resource_version = Some("43".to_string());
        b.metadata.labels = Some([("x".to_string(), "y".to_string())].into());
        assert!(a.content_matches(&b));

        let c = binding("edit", "bob");
        assert!(!a.content_matches(&c));
        assert!(!a.requires_replace(&c));
    }

    #[test]
    fn test_content_hash_follows_content() {
        let a = binding("edit", "alice");
        let mut b = a.clone();
        b.metadata.resource_version = Some("43".to_string());
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 16);
        assert_ne!(a.content_hash(), binding("edit", "bob").content_hash());
    }

    #[test]
    fn test_role_ref_change_requires_replace() {
        let current = binding("edit", "alice");
        let desired = binding("view", "alice");
        assert!(current.requires_replace(&desired));

        let mut merged = current.clone();
        merged.apply_content(&desired);
        assert!(merged.content_matches(&desired));
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn test_service_account_content() {
        let mut sa = ServiceAccount::default();
        sa.automount_service_account_token = Some(false);
        sa.image_pull_secrets = Some(vec![LocalObjectReference {
            name: "registry".to_string(),
        }]);
        // API-server populated fields are not part of the owned content
        sa.secrets = Some(vec![]);

        let content = sa.content();
        assert_eq!(content["automountServiceAccountToken"], false);
        assert_eq!(content["imagePullSecrets"][0], "registry");
    }
}
