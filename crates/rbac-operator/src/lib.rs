//! # RBAC Kubernetes Operator
//!
//! Keeps ServiceAccounts, Roles, ClusterRoles, RoleBindings and
//! ClusterRoleBindings in sync with declarative `RbacDefinition` resources,
//! and repairs them when they drift.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rbac_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let (_tx, shutdown) = tokio::sync::watch::channel(false);
//!     run_controller(client, ClusterClientConfig::default(), OperatorConfig::default(), shutdown)
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: definitions, namespaces and every generated kind are watched;
//!    each event becomes a reconcile request for the definitions it concerns
//! 2. **Queue**: requests are deduplicated per definition, and no two workers
//!    ever reconcile the same definition at once
//! 3. **Compile**: a definition plus the current namespaces yields the exact
//!    set of objects it should own
//! 4. **Converge**: missing objects are created, drifted ones updated and
//!    objects no longer desired released or deleted
//! 5. **Status**: the outcome is written back to the definition
//!
//! Generated objects carry an owner reference to every definition that wants
//! them and the `app.kubernetes.io/managed-by: rbac-operator` label. An
//! object is only deleted once no definition owns it.
//!
//! ## Modules
//!
//! - [`crd`] - `RbacDefinition` CRD types with validation
//! - [`compiler`] - desired-state compilation
//! - [`engine`] - convergence of actual state towards desired state
//! - [`controller`] - workers, status and controller setup
//! - [`watcher`] - watch loops and event attribution
//! - [`queue`] - deduplicating work queue
//! - [`cluster_client`] - Kubernetes API access
//! - `memory` - in-memory cluster for tests (`test-util` feature)
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: rbac.hupe1980.github.io/v1alpha1
//! kind: RbacDefinition
//! metadata:
//!   name: team-a
//! spec:
//!   serviceAccounts:
//!     - name: deployer
//!       namespace: ci
//!   bindings:
//!     - roleRef:
//!         kind: ClusterRole
//!         name: edit
//!       subjects:
//!         - kind: Group
//!           name: team-a
//!       scope:
//!         namespaces: [ns1, ns2]
//! ```
//!
//! ## Metrics
//!
//! - `rbac_operator_reconciliations_total` - Total reconciliation attempts
//! - `rbac_operator_reconciliation_errors_total` - Reconciliation errors by reason
//! - `rbac_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `rbac_operator_objects_total` - Object writes by kind and action
//! - `rbac_operator_watch_errors_total` - Broken watches by kind
//! - `rbac_operator_queue_depth` - Requests waiting for a worker

pub mod cluster_client;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod kinds;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod metrics;
pub mod ownership;
pub mod queue;
pub mod watcher;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::cluster_client::{
        ClusterClient, ClusterClientConfig, KubeClusterClient, WatchEvent,
    };
    pub use crate::compiler::{compile, DesiredState, NamespaceInfo};
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{run, run_controller, ControllerContext};
    pub use crate::crd::{
        BindingRule, BindingScope, ClusterRoleSpec, DefinitionCondition, DefinitionId,
        DefinitionPhase, NamespaceSelector, PolicyRuleSpec, RbacDefinition, RbacDefinitionSpec,
        RbacDefinitionStatus, RoleRefSpec, RoleSpec, SelectorOperator, SelectorRequirement,
        ServiceAccountSpec, SubjectSpec,
    };
    pub use crate::engine::{ConvergenceEngine, ReconcileOutcome, ReconcileReport};
    pub use crate::error::{ObjectFailure, OperatorError, Result};
    pub use crate::kinds::{ManagedResource, ObjectKey, RbacKind};
    pub use crate::metrics::{ControllerMetrics, NoopRecorder, OutcomeRecorder};
    pub use crate::queue::WorkQueue;
}
