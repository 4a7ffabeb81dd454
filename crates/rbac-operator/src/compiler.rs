//! Desired-state compiler
//!
//! Turns one `RbacDefinition` into the exact set of RBAC objects that should
//! exist for it. Compilation is pure: the same definition and namespace list
//! always yield the same objects with the same names.

use crate::crd::{BindingRule, PolicyRuleSpec, RbacDefinition, SubjectSpec};
use crate::error::{OperatorError, Result};
use crate::kinds::{ManagedResource, ObjectKey};
use crate::ownership::{managed_labels, owner_reference};
use k8s_openapi::api::core::v1::{LocalObjectReference, Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use validator::Validate;

/// API group of roles and non-ServiceAccount subjects
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Longest name the API server accepts for RBAC objects
const MAX_NAME_LENGTH: usize = 253;

/// Name and labels of a namespace, the only cluster input compilation needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl From<&Namespace> for NamespaceInfo {
    fn from(ns: &Namespace) -> Self {
        Self {
            name: ns.name_any(),
            labels: ns.labels().clone(),
        }
    }
}

/// Every object a definition wants, grouped by kind and sorted by key
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_roles: Vec<ClusterRole>,
    pub roles: Vec<Role>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub role_bindings: Vec<RoleBinding>,
}

impl DesiredState {
    pub fn len(&self) -> usize {
        self.service_accounts.len()
            + self.cluster_roles.len()
            + self.roles.len()
            + self.cluster_role_bindings.len()
            + self.role_bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every desired object
    pub fn keys(&self) -> BTreeSet<ObjectKey> {
        let mut keys = BTreeSet::new();
        keys.extend(self.service_accounts.iter().map(ObjectKey::of));
        keys.extend(self.cluster_roles.iter().map(ObjectKey::of));
        keys.extend(self.roles.iter().map(ObjectKey::of));
        keys.extend(self.cluster_role_bindings.iter().map(ObjectKey::of));
        keys.extend(self.role_bindings.iter().map(ObjectKey::of));
        keys
    }
}

/// Compile a definition against the current namespaces
pub fn compile(definition: &RbacDefinition, namespaces: &[NamespaceInfo]) -> Result<DesiredState> {
    DesiredStateCompiler::new(definition)?.compile(namespaces)
}

/// Builder for the objects of one RbacDefinition
pub struct DesiredStateCompiler<'a> {
    definition: &'a RbacDefinition,
    name: String,
    owner: OwnerReference,
}

impl<'a> DesiredStateCompiler<'a> {
    /// Create a compiler, rejecting specs that fail field validation
    pub fn new(definition: &'a RbacDefinition) -> Result<Self> {
        if let Err(errors) = definition.spec.validate() {
            return Err(OperatorError::InvalidSpec(errors.to_string()));
        }

        Ok(Self {
            definition,
            name: definition.name_any(),
            owner: owner_reference(definition)?,
        })
    }

    /// Build the full desired set
    pub fn compile(&self, namespaces: &[NamespaceInfo]) -> Result<DesiredState> {
        let mut cluster_role_bindings = BTreeMap::new();
        let mut role_bindings = BTreeMap::new();

        for (index, rule) in self.definition.spec.bindings.iter().enumerate() {
            self.build_bindings(
                index,
                rule,
                namespaces,
                &mut cluster_role_bindings,
                &mut role_bindings,
            )?;
        }

        Ok(DesiredState {
            service_accounts: self.build_service_accounts()?,
            cluster_roles: self.build_cluster_roles()?,
            roles: self.build_roles()?,
            cluster_role_bindings: cluster_role_bindings.into_values().collect(),
            role_bindings: role_bindings.into_values().collect(),
        })
    }

    fn metadata(&self, name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            labels: Some(managed_labels()),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    fn build_service_accounts(&self) -> Result<Vec<ServiceAccount>> {
        let mut accounts = BTreeMap::new();
        for spec in &self.definition.spec.service_accounts {
            let pull_secrets: Vec<LocalObjectReference> = spec
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect();
            let sa = ServiceAccount {
                metadata: self.metadata(&spec.name, Some(&spec.namespace)),
                automount_service_account_token: spec.automount_service_account_token,
                image_pull_secrets: (!pull_secrets.is_empty()).then_some(pull_secrets),
                ..Default::default()
            };
            insert_unique(&mut accounts, sa)?;
        }
        Ok(accounts.into_values().collect())
    }

    fn build_cluster_roles(&self) -> Result<Vec<ClusterRole>> {
        let mut roles = BTreeMap::new();
        for spec in &self.definition.spec.cluster_roles {
            let role = ClusterRole {
                metadata: self.metadata(&spec.name, None),
                rules: Some(spec.rules.iter().map(policy_rule).collect()),
                ..Default::default()
            };
            insert_unique(&mut roles, role)?;
        }
        Ok(roles.into_values().collect())
    }

    fn build_roles(&self) -> Result<Vec<Role>> {
        let mut roles = BTreeMap::new();
        for spec in &self.definition.spec.roles {
            if spec.rules.iter().any(|r| !r.non_resource_urls.is_empty()) {
                return Err(OperatorError::InvalidSpec(format!(
                    "Role {}/{}: nonResourceURLs are only valid in ClusterRoles",
                    spec.namespace, spec.name
                )));
            }
            let role = Role {
                metadata: self.metadata(&spec.name, Some(&spec.namespace)),
                rules: Some(spec.rules.iter().map(policy_rule).collect()),
            };
            insert_unique(&mut roles, role)?;
        }
        Ok(roles.into_values().collect())
    }

    /// One binding per (subject, scope): a ClusterRoleBinding for cluster scope,
    /// a RoleBinding for each namespace otherwise
    fn build_bindings(
        &self,
        index: usize,
        rule: &BindingRule,
        namespaces: &[NamespaceInfo],
        cluster_role_bindings: &mut BTreeMap<ObjectKey, ClusterRoleBinding>,
        role_bindings: &mut BTreeMap<ObjectKey, RoleBinding>,
    ) -> Result<()> {
        let label = rule.name.clone().unwrap_or_else(|| index.to_string());
        let role_ref = role_ref(&label, rule)?;
        validate_scope(&label, rule)?;

        if rule.subjects.is_empty() {
            return Err(OperatorError::InvalidSpec(format!(
                "binding rule {} has no subjects",
                label
            )));
        }

        let target_namespaces = resolve_namespaces(rule, namespaces);

        for (subject_index, subject_spec) in rule.subjects.iter().enumerate() {
            let subject = subject(&label, subject_spec)?;
            let name = format!("{}-{}-{}", self.name, label, subject_index);
            if name.len() > MAX_NAME_LENGTH {
                return Err(OperatorError::InvalidSpec(format!(
                    "generated binding name '{}' exceeds {} characters",
                    name, MAX_NAME_LENGTH
                )));
            }

            if rule.scope.cluster {
                let crb = ClusterRoleBinding {
                    metadata: self.metadata(&name, None),
                    role_ref: role_ref.clone(),
                    subjects: Some(vec![subject.clone()]),
                };
                insert_unique(cluster_role_bindings, crb)?;
            }

            for namespace in &target_namespaces {
                let rb = RoleBinding {
                    metadata: self.metadata(&name, Some(namespace)),
                    role_ref: role_ref.clone(),
                    subjects: Some(vec![subject.clone()]),
                };
                insert_unique(role_bindings, rb)?;
            }
        }

        Ok(())
    }
}

/// Add `obj` to the set; an identical duplicate collapses, a divergent one is an error
fn insert_unique<K: ManagedResource>(set: &mut BTreeMap<ObjectKey, K>, obj: K) -> Result<()> {
    let key = ObjectKey::of(&obj);
    match set.get(&key) {
        Some(existing) if existing.content_matches(&obj) => Ok(()),
        Some(_) => Err(OperatorError::InvalidSpec(format!(
            "{} is declared twice with different content",
            key
        ))),
        None => {
            set.insert(key, obj);
            Ok(())
        }
    }
}

fn validate_scope(label: &str, rule: &BindingRule) -> Result<()> {
    let scope = &rule.scope;
    if scope.cluster && scope.is_namespaced() {
        return Err(OperatorError::InvalidSpec(format!(
            "binding rule {} is cluster-scoped but also restricted to namespaces",
            label
        )));
    }
    if !scope.cluster && !scope.is_namespaced() {
        return Err(OperatorError::InvalidSpec(format!(
            "binding rule {} has no scope (set cluster, namespaces or namespaceSelector)",
            label
        )));
    }
    if scope.cluster && rule.role_ref.kind == "Role" {
        return Err(OperatorError::InvalidSpec(format!(
            "binding rule {} grants Role {} cluster-wide; only ClusterRoles can be bound cluster-wide",
            label, rule.role_ref.name
        )));
    }
    Ok(())
}

fn role_ref(label: &str, rule: &BindingRule) -> Result<RoleRef> {
    match rule.role_ref.kind.as_str() {
        "Role" | "ClusterRole" => Ok(RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: rule.role_ref.kind.clone(),
            name: rule.role_ref.name.clone(),
        }),
        other => Err(OperatorError::InvalidSpec(format!(
            "binding rule {} references '{}', expected Role or ClusterRole",
            label, other
        ))),
    }
}

/// Subjects in the form the API server stores them, so they diff cleanly
fn subject(label: &str, spec: &SubjectSpec) -> Result<Subject> {
    match spec.kind.as_str() {
        "ServiceAccount" => {
            let namespace = spec.namespace.clone().ok_or_else(|| {
                OperatorError::InvalidSpec(format!(
                    "binding rule {}: ServiceAccount subject {} needs a namespace",
                    label, spec.name
                ))
            })?;
            Ok(Subject {
                kind: spec.kind.clone(),
                name: spec.name.clone(),
                namespace: Some(namespace),
                api_group: None,
            })
        }
        "User" | "Group" => Ok(Subject {
            kind: spec.kind.clone(),
            name: spec.name.clone(),
            namespace: None,
            api_group: Some(RBAC_API_GROUP.to_string()),
        }),
        other => Err(OperatorError::InvalidSpec(format!(
            "binding rule {}: unsupported subject kind '{}'",
            label, other
        ))),
    }
}

fn resolve_namespaces(rule: &BindingRule, namespaces: &[NamespaceInfo]) -> BTreeSet<String> {
    let mut resolved: BTreeSet<String> = rule.scope.namespaces.iter().cloned().collect();
    if let Some(selector) = &rule.scope.namespace_selector {
        resolved.extend(
            namespaces
                .iter()
                .filter(|ns| selector.matches(&ns.labels))
                .map(|ns| ns.name.clone()),
        );
    }
    resolved
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

fn policy_rule(spec: &PolicyRuleSpec) -> PolicyRule {
    PolicyRule {
        api_groups: non_empty(&spec.api_groups),
        resources: non_empty(&spec.resources),
        resource_names: non_empty(&spec.resource_names),
        non_resource_urls: non_empty(&spec.non_resource_urls),
        verbs: spec.verbs.clone(),
    }
}
