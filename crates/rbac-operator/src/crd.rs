//! Custom Resource Definitions for the RBAC operator
//!
//! This module defines the `RbacDefinition` CRD, the declarative source of
//! truth for the ServiceAccounts, Roles, ClusterRoles and bindings the
//! operator generates.

use kube::{CustomResource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the RbacDefinition resource
pub const API_GROUP: &str = "rbac.hupe1980.github.io";

/// API version of the RbacDefinition resource
pub const API_VERSION: &str = "rbac.hupe1980.github.io/v1alpha1";

/// Kind of the RbacDefinition resource
pub const KIND: &str = "RbacDefinition";

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating RFC 1123 subdomains (Role/ClusterRole names may contain dots and colons)
static ROLE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.:]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a Role or ClusterRole name (`system:aggregate-to-edit` is legal)
fn validate_role_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > 253 {
        return Err(ValidationError::new("invalid_role_name")
            .with_message("role name must be 1-253 characters".into()));
    }
    if !ROLE_NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_role_name")
            .with_message(format!("'{}' is not a valid role name", value).into()));
    }
    Ok(())
}

fn validate_namespaces(namespaces: &[String]) -> Result<(), ValidationError> {
    for ns in namespaces {
        validate_k8s_name(ns)?;
    }
    Ok(())
}

/// RbacDefinition custom resource definition
///
/// Declares the RBAC objects that should exist in the cluster. The operator
/// compiles each definition into ServiceAccounts, Roles, ClusterRoles,
/// RoleBindings and ClusterRoleBindings, keeps them converged, and repairs
/// them when they are changed or deleted out-of-band.
///
/// The resource is cluster-scoped: generated objects live in many
/// namespaces and carry an owner reference back to their definition.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "rbac.hupe1980.github.io",
    version = "v1alpha1",
    kind = "RbacDefinition",
    plural = "rbacdefinitions",
    shortname = "rbacdef",
    status = "RbacDefinitionStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Objects","type":"integer","jsonPath":".status.managedObjects"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RbacDefinitionSpec {
    /// ServiceAccounts to create (max 100)
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 service accounts allowed"))]
    #[validate(nested)]
    pub service_accounts: Vec<ServiceAccountSpec>,

    /// ClusterRoles to create (max 50)
    #[serde(default)]
    #[validate(length(max = 50, message = "maximum 50 cluster roles allowed"))]
    #[validate(nested)]
    pub cluster_roles: Vec<ClusterRoleSpec>,

    /// Namespaced Roles to create (max 100)
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 roles allowed"))]
    #[validate(nested)]
    pub roles: Vec<RoleSpec>,

    /// Binding rules granting a role to a set of subjects (max 100)
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 binding rules allowed"))]
    #[validate(nested)]
    pub bindings: Vec<BindingRule>,
}

/// A ServiceAccount the definition requests
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSpec {
    /// ServiceAccount name
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    /// Namespace the ServiceAccount is created in
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: String,

    /// Whether pods using this ServiceAccount get an API token mounted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,

    /// Image pull secrets attached to the ServiceAccount (max 10)
    #[serde(default)]
    #[validate(length(max = 10, message = "maximum 10 image pull secrets allowed"))]
    pub image_pull_secrets: Vec<String>,
}

/// A ClusterRole the definition requests
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleSpec {
    /// ClusterRole name
    #[validate(custom(function = "validate_role_name"))]
    pub name: String,

    /// Permissions granted by the ClusterRole
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 rules allowed"))]
    #[validate(nested)]
    pub rules: Vec<PolicyRuleSpec>,
}

/// A namespaced Role the definition requests
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    /// Role name
    #[validate(custom(function = "validate_role_name"))]
    pub name: String,

    /// Namespace the Role is created in
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: String,

    /// Permissions granted by the Role
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 rules allowed"))]
    #[validate(nested)]
    pub rules: Vec<PolicyRuleSpec>,
}

/// A single permission rule
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRuleSpec {
    /// API groups, `""` is the core group
    #[serde(default)]
    pub api_groups: Vec<String>,

    /// Resources the rule applies to
    #[serde(default)]
    pub resources: Vec<String>,

    /// Optional allow-list of resource names
    #[serde(default)]
    pub resource_names: Vec<String>,

    /// Verbs the rule allows
    #[validate(length(min = 1, message = "a rule needs at least one verb"))]
    pub verbs: Vec<String>,

    /// Non-resource URLs (ClusterRoles only)
    #[serde(default, rename = "nonResourceURLs")]
    pub non_resource_urls: Vec<String>,
}

/// A binding rule: grant `role_ref` to `subjects` within `scope`
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingRule {
    /// Stable name used in generated binding names (defaults to the rule position)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: Option<String>,

    /// Role or ClusterRole being granted
    #[validate(nested)]
    pub role_ref: RoleRefSpec,

    /// Subjects receiving the role (max 100)
    #[serde(default)]
    #[validate(length(max = 100, message = "maximum 100 subjects per rule allowed"))]
    #[validate(nested)]
    pub subjects: Vec<SubjectSpec>,

    /// Where the role is granted
    #[serde(default)]
    #[validate(nested)]
    pub scope: BindingScope,
}

/// Reference to a Role or ClusterRole
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRefSpec {
    /// `Role` or `ClusterRole`
    pub kind: String,

    /// Name of the referenced role
    #[validate(custom(function = "validate_role_name"))]
    pub name: String,
}

/// A subject receiving a role
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSpec {
    /// `ServiceAccount`, `User` or `Group`
    pub kind: String,

    /// Subject name
    #[validate(length(min = 1, max = 253, message = "subject name must be 1-253 characters"))]
    pub name: String,

    /// Namespace of a ServiceAccount subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: Option<String>,
}

/// Scope of a binding rule: the whole cluster, or a set of namespaces
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingScope {
    /// Grant cluster-wide through a ClusterRoleBinding
    #[serde(default)]
    pub cluster: bool,

    /// Grant in each of these namespaces through a RoleBinding
    #[serde(default)]
    #[validate(length(max = 200, message = "maximum 200 namespaces per rule allowed"))]
    #[validate(custom(function = "validate_namespaces"))]
    pub namespaces: Vec<String>,

    /// Grant in every namespace whose labels match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub namespace_selector: Option<NamespaceSelector>,
}

impl BindingScope {
    /// Whether the scope restricts the grant to namespaces
    pub fn is_namespaced(&self) -> bool {
        !self.namespaces.is_empty() || self.namespace_selector.is_some()
    }
}

/// Label selector over namespaces
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Labels that must all be present with these values
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based requirements, all of which must hold
    #[serde(default)]
    #[validate(nested)]
    pub match_expressions: Vec<SelectorRequirement>,
}

/// A set-based label requirement
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    /// Label key
    #[validate(length(min = 1, max = 317, message = "label key must be 1-317 characters"))]
    pub key: String,

    pub operator: SelectorOperator,

    /// Values for In and NotIn
    #[serde(default)]
    pub values: Vec<String>,
}

/// Operator of a [`SelectorRequirement`]
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SelectorOperator {
    /// The label is set to one of the values
    In,
    /// The label is unset or set to none of the values
    NotIn,
    Exists,
    DoesNotExist,
}

impl NamespaceSelector {
    /// Check whether a label set satisfies the selector
    ///
    /// An empty selector matches every namespace.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_match && self.match_expressions.iter().all(|req| req.matches(labels))
    }
}

impl SelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Identity of an RbacDefinition
///
/// `namespace` is `None` for the cluster-scoped resource; owner references
/// cannot carry a namespace, so identities derived from them never have one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinitionId {
    pub namespace: Option<String>,
    pub name: String,
}

impl DefinitionId {
    /// Identity of a cluster-scoped definition
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl RbacDefinition {
    /// Identity used by the work queue and ownership index
    pub fn id(&self) -> DefinitionId {
        DefinitionId {
            namespace: self.namespace(),
            name: self.name_any(),
        }
    }

    /// Whether any binding rule depends on namespace labels
    pub fn uses_namespace_selector(&self) -> bool {
        self.spec
            .bindings
            .iter()
            .any(|b| b.scope.namespace_selector.is_some())
    }
}

/// Status of the RbacDefinition resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RbacDefinitionStatus {
    /// Current phase
    #[serde(default)]
    pub phase: DefinitionPhase,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec the status describes
    #[serde(default)]
    pub observed_generation: i64,

    /// Number of objects in the desired set
    #[serde(default)]
    pub managed_objects: i32,

    /// Conditions for detailed status tracking
    #[serde(default)]
    pub conditions: Vec<DefinitionCondition>,

    /// Last time the status changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,
}

/// Phase of an RbacDefinition
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DefinitionPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Every desired object exists with the desired content
    Ready,
    /// Some objects failed to converge
    Degraded,
    /// The spec cannot be compiled
    Invalid,
}

impl fmt::Display for DefinitionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DefinitionPhase::Pending => "Pending",
            DefinitionPhase::Ready => "Ready",
            DefinitionPhase::Degraded => "Degraded",
            DefinitionPhase::Invalid => "Invalid",
        };
        f.write_str(s)
    }
}

/// Condition describing an aspect of definition state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionCondition {
    /// Type of condition: Ready, Synced
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last transition time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}
