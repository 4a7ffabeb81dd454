//! Convergence engine
//!
//! Drives the cluster toward one definition's desired set:
//!
//! 1. fetch the definition (absent or deleting: nothing to do, garbage
//!    collection removes its objects);
//! 2. compile the desired set;
//! 3. per kind, list the managed objects and plan creates, updates,
//!    replaces, releases and deletes by matching on name;
//! 4. apply creates and updates for every kind first, then deletes and
//!    releases in reverse kind order.
//!
//! Each object is applied independently; failures are collected into the
//! [`ReconcileReport`] instead of aborting the batch.

use crate::cluster_client::ClusterClient;
use crate::compiler::compile;
use crate::crd::{DefinitionId, RbacDefinition};
use crate::error::{ObjectFailure, OperatorError, Result};
use crate::kinds::{ManagedResource, ObjectKey, RbacKind};
use crate::ownership::{
    add_owner, ensure_managed_labels, has_other_owners, is_owned_by, managed_selector,
    metadata_current, owner_reference, owners_of, recorded_content_hash, remove_owner,
    set_content_hash,
};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One step toward the desired state for a single object
#[derive(Debug)]
pub enum Action<K> {
    /// Not in the managed list; look it up and create it if absent
    Create(K),
    /// Owned object whose content or metadata drifted
    Update(K),
    /// Owned object that must be deleted and recreated (immutable roleRef)
    Replace(K),
    /// Identical object owned by other definitions; add our owner reference
    Join(K),
    /// Pre-existing object the definition must leave alone
    Skip(ObjectKey, String),
    /// Object this definition must not overwrite
    Conflict(ObjectKey, OperatorError),
    /// Orphan shared with other definitions; drop only our owner reference
    Release(K),
    /// Orphan owned by this definition alone
    Delete(K),
}

/// Actions for one kind, split by apply phase
#[derive(Debug)]
pub struct Plan<K> {
    pub converge: Vec<Action<K>>,
    pub prune: Vec<Action<K>>,
}

/// Decide what to do with an existing object that has the desired name
///
/// A shared object may only be rewritten when this definition wants the
/// content last written to it, i.e. the owners agree and the live content
/// drifted. Returns `None` when the object already matches.
pub fn decide<K: ManagedResource>(
    id: &DefinitionId,
    owner: &OwnerReference,
    current: &K,
    desired: &K,
) -> Option<Action<K>> {
    let key = ObjectKey::of(desired);
    let owned = is_owned_by(current.meta(), id);
    let shared = has_other_owners(current.meta(), id);
    let same = current.content_matches(desired);
    let desired_hash = desired.content_hash();
    let agreed = recorded_content_hash(current.meta()) == Some(desired_hash.as_str());

    let merged = || {
        let mut merged = current.clone();
        merged.apply_content(desired);
        add_owner(merged.meta_mut(), owner);
        ensure_managed_labels(merged.meta_mut());
        set_content_hash(merged.meta_mut(), desired_hash.clone());
        merged
    };
    let conflict = |reason: String| {
        let err = OperatorError::Conflict {
            kind: key.kind.to_string(),
            name: key.path(),
            reason,
        };
        Some(Action::Conflict(key.clone(), err))
    };
    let others = || {
        owners_of(current.meta())
            .iter()
            .filter(|o| *o != id)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    match (owned, shared, same) {
        (false, false, _) if K::MANAGED_KIND == RbacKind::ServiceAccount => Some(Action::Skip(
            key.clone(),
            "ServiceAccount already exists and is not managed by any RbacDefinition".to_string(),
        )),
        (false, false, _) => {
            conflict("object exists and is not managed by any RbacDefinition".to_string())
        }
        (false, true, false) if !agreed => conflict(format!(
            "object is owned by {} with different content",
            others()
        )),
        (true, true, false) if !agreed => conflict(format!(
            "object is shared with {} and its content would change",
            others()
        )),
        (_, _, false) if current.requires_replace(desired) => Some(Action::Replace(merged())),
        (false, true, _) => Some(Action::Join(merged())),
        (true, _, false) => Some(Action::Update(merged())),
        (true, _, true) if !metadata_current(current.meta(), owner) || !agreed => {
            Some(Action::Update(merged()))
        }
        (true, _, true) => None,
    }
}

/// `obj` with the hash of its content recorded
fn stamped<K: ManagedResource>(mut obj: K) -> K {
    let hash = obj.content_hash();
    set_content_hash(obj.meta_mut(), hash);
    obj
}

/// Plan one kind by matching desired objects against the managed objects listed
pub fn plan<K: ManagedResource>(
    id: &DefinitionId,
    owner: &OwnerReference,
    desired: Vec<K>,
    actual: Vec<K>,
) -> Plan<K> {
    let mut actual: BTreeMap<ObjectKey, K> = actual
        .into_iter()
        .map(|obj| (ObjectKey::of(&obj), obj))
        .collect();

    let mut converge = Vec::new();
    for obj in desired {
        match actual.remove(&ObjectKey::of(&obj)) {
            None => converge.push(Action::Create(stamped(obj))),
            Some(current) => converge.extend(decide(id, owner, &current, &obj)),
        }
    }

    let prune = actual
        .into_values()
        .filter(|obj| is_owned_by(obj.meta(), id))
        .map(|mut obj| {
            if has_other_owners(obj.meta(), id) {
                remove_owner(obj.meta_mut(), id);
                Action::Release(obj)
            } else {
                Action::Delete(obj)
            }
        })
        .collect();

    Plan { converge, prune }
}

/// Per-object result of one reconcile
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Size of the compiled desired set
    pub desired: usize,
    pub created: Vec<ObjectKey>,
    pub updated: Vec<ObjectKey>,
    pub replaced: Vec<ObjectKey>,
    pub deleted: Vec<ObjectKey>,
    pub released: Vec<ObjectKey>,
    pub skipped: Vec<ObjectKey>,
    pub failures: Vec<ObjectFailure>,
}

impl ReconcileReport {
    fn new(desired: usize) -> Self {
        Self {
            desired,
            ..Default::default()
        }
    }

    pub fn is_converged(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of writes performed on generated objects
    pub fn mutations(&self) -> usize {
        self.created.len()
            + self.updated.len()
            + self.replaced.len()
            + self.deleted.len()
            + self.released.len()
    }

    /// Desired objects this definition actually manages
    pub fn managed(&self) -> usize {
        self.desired.saturating_sub(self.skipped.len())
    }

    fn fail(&mut self, key: &ObjectKey, err: &OperatorError) {
        self.failures
            .push(ObjectFailure::new(key.kind.as_str(), key.path(), err));
    }
}

/// What a reconcile did
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The definition no longer exists or is being deleted
    Absent(DefinitionId),
    /// The definition cannot be compiled; nothing was applied
    Invalid {
        definition: RbacDefinition,
        reason: String,
    },
    /// The desired set was applied, possibly with per-object failures
    Applied {
        definition: RbacDefinition,
        report: ReconcileReport,
    },
}

impl ReconcileOutcome {
    pub fn definition(&self) -> Option<&RbacDefinition> {
        match self {
            ReconcileOutcome::Absent(_) => None,
            ReconcileOutcome::Invalid { definition, .. }
            | ReconcileOutcome::Applied { definition, .. } => Some(definition),
        }
    }

    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            ReconcileOutcome::Applied { report, .. } => Some(report),
            _ => None,
        }
    }

    /// The error the outcome amounts to, if any
    pub fn error(&self) -> Option<OperatorError> {
        match self {
            ReconcileOutcome::Absent(_) => None,
            ReconcileOutcome::Invalid { reason, .. } => {
                Some(OperatorError::InvalidSpec(reason.clone()))
            }
            ReconcileOutcome::Applied { report, .. } if !report.is_converged() => {
                Some(OperatorError::PartialFailure {
                    failures: report.failures.clone(),
                })
            }
            ReconcileOutcome::Applied { .. } => None,
        }
    }
}

/// Pending prune actions for every kind, applied after all creates and updates
struct PrunePlan {
    service_accounts: Vec<Action<ServiceAccount>>,
    cluster_roles: Vec<Action<ClusterRole>>,
    roles: Vec<Action<Role>>,
    cluster_role_bindings: Vec<Action<ClusterRoleBinding>>,
    role_bindings: Vec<Action<RoleBinding>>,
}

/// Reconciles definitions against the cluster
pub struct ConvergenceEngine<C> {
    client: Arc<C>,
}

impl<C> Clone for ConvergenceEngine<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

/// Copy of an object suitable for a create call
fn for_create<K: ManagedResource>(obj: &K) -> K {
    let mut fresh = obj.clone();
    let meta = fresh.meta_mut();
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    fresh
}

impl<C: ClusterClient> ConvergenceEngine<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Converge one definition
    ///
    /// Errors are returned only when the definition itself cannot be read;
    /// per-object failures end up in the report.
    #[instrument(skip(self), fields(definition = %id))]
    pub async fn reconcile(&self, id: &DefinitionId) -> Result<ReconcileOutcome> {
        let Some(definition) = self.client.get_definition(id).await? else {
            debug!("RbacDefinition no longer exists");
            return Ok(ReconcileOutcome::Absent(id.clone()));
        };
        if definition.metadata.deletion_timestamp.is_some() {
            debug!("RbacDefinition is being deleted, leaving objects to garbage collection");
            return Ok(ReconcileOutcome::Absent(id.clone()));
        }

        let namespaces = if definition.uses_namespace_selector() {
            self.client.list_namespaces().await?
        } else {
            Vec::new()
        };

        let desired = match compile(&definition, &namespaces) {
            Ok(desired) => desired,
            Err(OperatorError::InvalidSpec(reason)) => {
                warn!(reason = %reason, "RbacDefinition is invalid");
                return Ok(ReconcileOutcome::Invalid { definition, reason });
            }
            Err(e) => return Err(e),
        };
        let owner = owner_reference(&definition)?;
        let mut report = ReconcileReport::new(desired.len());

        let prune = PrunePlan {
            service_accounts: self
                .converge(id, &owner, desired.service_accounts, &mut report)
                .await,
            cluster_roles: self
                .converge(id, &owner, desired.cluster_roles, &mut report)
                .await,
            roles: self.converge(id, &owner, desired.roles, &mut report).await,
            cluster_role_bindings: self
                .converge(id, &owner, desired.cluster_role_bindings, &mut report)
                .await,
            role_bindings: self
                .converge(id, &owner, desired.role_bindings, &mut report)
                .await,
        };

        self.prune(prune.role_bindings, &mut report).await;
        self.prune(prune.cluster_role_bindings, &mut report).await;
        self.prune(prune.roles, &mut report).await;
        self.prune(prune.cluster_roles, &mut report).await;
        self.prune(prune.service_accounts, &mut report).await;

        info!(
            desired = report.desired,
            created = report.created.len(),
            updated = report.updated.len() + report.replaced.len(),
            deleted = report.deleted.len(),
            released = report.released.len(),
            skipped = report.skipped.len(),
            failures = report.failures.len(),
            "Reconciled RbacDefinition"
        );

        Ok(ReconcileOutcome::Applied { definition, report })
    }

    /// List, plan and apply creates/updates for one kind; returns the prune actions
    async fn converge<K: ManagedResource>(
        &self,
        id: &DefinitionId,
        owner: &OwnerReference,
        desired: Vec<K>,
        report: &mut ReconcileReport,
    ) -> Vec<Action<K>> {
        let actual = match self.client.list::<K>(&managed_selector()).await {
            Ok(actual) => actual,
            Err(e) => {
                warn!(kind = %K::MANAGED_KIND, error = %e, "Failed to list managed objects");
                report.failures.push(ObjectFailure::new(
                    K::MANAGED_KIND.as_str(),
                    "*",
                    &e,
                ));
                return Vec::new();
            }
        };

        let plan = plan(id, owner, desired, actual);
        for action in plan.converge {
            match action {
                Action::Create(obj) => self.claim(id, owner, obj, report).await,
                other => self.apply(other, report).await,
            }
        }
        plan.prune
    }

    async fn prune<K: ManagedResource>(&self, actions: Vec<Action<K>>, report: &mut ReconcileReport) {
        for action in actions {
            self.apply(action, report).await;
        }
    }

    /// Create a desired object the managed list did not show, unless the name is taken
    async fn claim<K: ManagedResource>(
        &self,
        id: &DefinitionId,
        owner: &OwnerReference,
        desired: K,
        report: &mut ReconcileReport,
    ) {
        let key = ObjectKey::of(&desired);
        match self
            .client
            .get::<K>(key.namespace.as_deref(), &key.name)
            .await
        {
            Ok(None) => self.create(&desired, &key, report).await,
            Ok(Some(current)) => {
                if let Some(action) = decide(id, owner, &current, &desired) {
                    self.apply(action, report).await;
                }
            }
            Err(e) => {
                warn!(object = %key, error = %e, "Failed to read object");
                report.fail(&key, &e);
            }
        }
    }

    async fn create<K: ManagedResource>(
        &self,
        obj: &K,
        key: &ObjectKey,
        report: &mut ReconcileReport,
    ) {
        match self.client.create(&for_create(obj)).await {
            Ok(_) => {
                info!(object = %key, "Created");
                report.created.push(key.clone());
            }
            Err(e) => {
                warn!(object = %key, error = %e, "Failed to create");
                report.fail(key, &e);
            }
        }
    }

    async fn apply<K: ManagedResource>(&self, action: Action<K>, report: &mut ReconcileReport) {
        match action {
            Action::Create(obj) => {
                let key = ObjectKey::of(&obj);
                self.create(&obj, &key, report).await;
            }
            Action::Update(obj) | Action::Join(obj) => {
                let key = ObjectKey::of(&obj);
                match self.client.replace(&obj).await {
                    Ok(_) => {
                        info!(object = %key, "Updated");
                        report.updated.push(key);
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(object = %key, "Object vanished before update, recreating");
                        self.create(&obj, &key, report).await;
                    }
                    Err(e) => {
                        warn!(object = %key, error = %e, "Failed to update");
                        report.fail(&key, &e);
                    }
                }
            }
            Action::Replace(obj) => {
                let key = ObjectKey::of(&obj);
                let deleted = self
                    .client
                    .delete::<K>(key.namespace.as_deref(), &key.name)
                    .await;
                if let Some(e) = deleted.as_ref().err().filter(|e| !e.is_not_found()) {
                    warn!(object = %key, error = %e, "Failed to delete for replacement");
                    report.fail(&key, e);
                    return;
                }
                match self.client.create(&for_create(&obj)).await {
                    Ok(_) => {
                        info!(object = %key, "Replaced");
                        report.replaced.push(key);
                    }
                    Err(e) => {
                        warn!(object = %key, error = %e, "Failed to recreate");
                        report.fail(&key, &e);
                    }
                }
            }
            Action::Skip(key, reason) => {
                info!(object = %key, reason = %reason, "Skipped");
                report.skipped.push(key);
            }
            Action::Conflict(key, err) => {
                warn!(object = %key, error = %err, "Ownership conflict");
                report.fail(&key, &err);
            }
            Action::Release(obj) => {
                let key = ObjectKey::of(&obj);
                match self.client.replace(&obj).await {
                    Ok(_) => {
                        info!(object = %key, "Released");
                        report.released.push(key);
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(object = %key, "Object already gone");
                    }
                    Err(e) => {
                        warn!(object = %key, error = %e, "Failed to release");
                        report.fail(&key, &e);
                    }
                }
            }
            Action::Delete(obj) => {
                let key = ObjectKey::of(&obj);
                match self
                    .client
                    .delete::<K>(key.namespace.as_deref(), &key.name)
                    .await
                {
                    Ok(()) => {
                        info!(object = %key, "Deleted");
                        report.deleted.push(key);
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(object = %key, "Object already gone");
                    }
                    Err(e) => {
                        warn!(object = %key, error = %e, "Failed to delete");
                        report.fail(&key, &e);
                    }
                }
            }
        }
    }
}
