//! RbacDefinition controller
//!
//! Wires the watchers, the work queue and a pool of reconcile workers
//! together. Each worker takes a definition off the queue, converges it and
//! writes its status. Converged definitions come back after the resync
//! interval; retryable failures back off exponentially. Invalid definitions
//! and ownership conflicts wait for their next change.

use crate::cluster_client::{ClusterClient, ClusterClientConfig, KubeClusterClient};
use crate::config::OperatorConfig;
use crate::crd::{
    DefinitionCondition, DefinitionId, DefinitionPhase, RbacDefinition, RbacDefinitionStatus,
};
use crate::engine::{ConvergenceEngine, ReconcileOutcome};
use crate::error::{OperatorError, Result};
use crate::metrics::{ControllerMetrics, OutcomeRecorder};
use crate::ownership::managed_selector;
use crate::queue::WorkQueue;
use crate::watcher::{
    run_watch, DefinitionWatcher, DriftWatcher, NamespaceWatcher, WatchBackoff,
};
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Context shared by the workers
pub struct ControllerContext<C> {
    /// Convergence engine (owns the cluster client)
    pub engine: ConvergenceEngine<C>,
    /// Pending reconcile requests
    pub queue: Arc<WorkQueue>,
    pub config: OperatorConfig,
    /// Metrics recorder
    pub recorder: Arc<dyn OutcomeRecorder>,
    /// Per-definition error retry counts for exponential backoff
    pub error_counts: DashMap<DefinitionId, u32>,
}

impl<C: ClusterClient> ControllerContext<C> {
    pub fn new(
        client: Arc<C>,
        config: OperatorConfig,
        recorder: Arc<dyn OutcomeRecorder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine: ConvergenceEngine::new(client),
            queue: WorkQueue::new(),
            config,
            recorder,
            error_counts: DashMap::new(),
        })
    }

    pub fn client(&self) -> &Arc<C> {
        self.engine.client()
    }
}

/// Start the controller against a real cluster and run until `shutdown` flips
pub async fn run_controller(
    client: Client,
    client_config: ClusterClientConfig,
    config: OperatorConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let client = Arc::new(KubeClusterClient::with_config(client, client_config));
    let recorder: Arc<dyn OutcomeRecorder> = Arc::new(ControllerMetrics::new());
    run(client, config, recorder, shutdown).await
}

/// Run the controller on any cluster client
///
/// Fails only if the definitions cannot be listed at startup.
pub async fn run<C: ClusterClient>(
    client: Arc<C>,
    config: OperatorConfig,
    recorder: Arc<dyn OutcomeRecorder>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let definitions = client.list_definitions().await?;
    let ctx = ControllerContext::new(Arc::clone(&client), config, recorder);
    for definition in &definitions {
        ctx.queue.enqueue(definition.id());
    }

    info!(
        definitions = definitions.len(),
        workers = ctx.config.workers,
        "Starting RbacDefinition controller"
    );

    let mut watchers = JoinSet::new();
    spawn_watchers(&mut watchers, &ctx, &shutdown);

    let mut workers = JoinSet::new();
    for index in 0..ctx.config.workers {
        workers.spawn(worker(index, Arc::clone(&ctx)));
    }

    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("Shutting down, waiting for in-flight reconciliations");
    ctx.queue.shutdown();
    while watchers.join_next().await.is_some() {}
    while workers.join_next().await.is_some() {}
    info!("RbacDefinition controller stopped");
    Ok(())
}

fn spawn_watchers<C: ClusterClient>(
    tasks: &mut JoinSet<()>,
    ctx: &Arc<ControllerContext<C>>,
    shutdown: &watch::Receiver<bool>,
) {
    let client = ctx.client();
    let recorder = &ctx.recorder;
    let queue = &ctx.queue;
    let backoff = WatchBackoff {
        base: ctx.config.watch_backoff_base,
        max: ctx.config.watch_backoff_max,
    };
    let managed = Some(managed_selector());

    tasks.spawn(run_watch::<C, RbacDefinition, _>(
        Arc::clone(client),
        None,
        backoff,
        Arc::clone(recorder),
        shutdown.clone(),
        DefinitionWatcher::new(Arc::clone(queue)),
    ));
    tasks.spawn(run_watch::<C, Namespace, _>(
        Arc::clone(client),
        None,
        backoff,
        Arc::clone(recorder),
        shutdown.clone(),
        NamespaceWatcher::new(Arc::clone(client), Arc::clone(queue)),
    ));

    macro_rules! drift {
        ($kind:ty) => {
            tasks.spawn(run_watch::<C, $kind, _>(
                Arc::clone(client),
                managed.clone(),
                backoff,
                Arc::clone(recorder),
                shutdown.clone(),
                DriftWatcher::new(Arc::clone(queue)),
            ));
        };
    }
    drift!(ServiceAccount);
    drift!(ClusterRole);
    drift!(Role);
    drift!(ClusterRoleBinding);
    drift!(RoleBinding);
}

async fn worker<C: ClusterClient>(index: usize, ctx: Arc<ControllerContext<C>>) {
    while let Some(lease) = ctx.queue.next().await {
        ctx.recorder.record_queue_depth(ctx.queue.len());
        let id = lease.id().clone();
        let requeue = reconcile(&id, &ctx).await;
        // release the identity before scheduling the next look
        drop(lease);
        if let Some(delay) = requeue {
            ctx.queue.enqueue_after(id, delay);
        }
    }
    debug!(worker = index, "Worker stopped");
}

/// Reconcile one definition and write its status
///
/// Returns when the definition should be looked at again, if ever.
#[instrument(skip(id, ctx), fields(definition = %id))]
pub async fn reconcile<C: ClusterClient>(
    id: &DefinitionId,
    ctx: &ControllerContext<C>,
) -> Option<Duration> {
    let start = Instant::now();

    let outcome = match ctx.engine.reconcile(id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.recorder.record_error(e.reason());
            return error_policy(id, &e, ctx);
        }
    };
    ctx.recorder.record(&outcome, start.elapsed());

    if let Err(e) = update_status(ctx.client().as_ref(), &outcome).await {
        warn!(error = %e, "Failed to update RbacDefinition status");
        if e.is_retryable() && !e.is_not_found() {
            return error_policy(id, &e, ctx);
        }
    }

    match outcome.error() {
        Some(e) => error_policy(id, &e, ctx),
        None => {
            ctx.error_counts.remove(id);
            match outcome {
                ReconcileOutcome::Absent(_) => None,
                _ => ctx.config.resync_interval,
            }
        }
    }
}

/// Error policy: exponential backoff for retryable errors, no retry otherwise
fn error_policy<C>(
    id: &DefinitionId,
    error: &OperatorError,
    ctx: &ControllerContext<C>,
) -> Option<Duration> {
    if !error.is_retryable() {
        warn!(error = %error, "Reconciliation of '{}' failed, not retrying until it changes", id);
        ctx.error_counts.remove(id);
        return None;
    }

    let retries = {
        let mut entry = ctx.error_counts.entry(id.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = error.requeue_delay(
        retries,
        ctx.config.error_backoff_base,
        ctx.config.error_backoff_max,
    );

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.map(|d| d.as_secs()).unwrap_or_default(),
        "Reconciliation error for '{}', will retry",
        id
    );
    delay
}

/// Write the status for an outcome if it differs from what is stored
///
/// Returns whether a patch was sent.
pub async fn update_status<C: ClusterClient>(
    client: &C,
    outcome: &ReconcileOutcome,
) -> Result<bool> {
    let Some(definition) = outcome.definition() else {
        return Ok(false);
    };
    let Some(status) = build_status(outcome, &Utc::now().to_rfc3339()) else {
        return Ok(false);
    };
    if !status_changed(definition.status.as_ref(), &status) {
        return Ok(false);
    }

    debug!(phase = %status.phase, "Updating RbacDefinition status");
    client
        .patch_definition_status(&definition.id(), &status)
        .await?;
    Ok(true)
}

fn condition(
    previous: &[DefinitionCondition],
    condition_type: &str,
    ok: bool,
    reason: &str,
    message: String,
    now: &str,
) -> DefinitionCondition {
    let status = if ok { "True" } else { "False" };
    let last_transition_time = previous
        .iter()
        .find(|c| c.condition_type == condition_type && c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());

    DefinitionCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Some(last_transition_time),
    }
}

/// Build the status an outcome should leave on its definition
pub fn build_status(outcome: &ReconcileOutcome, now: &str) -> Option<RbacDefinitionStatus> {
    let (definition, phase, reason, message, managed_objects) = match outcome {
        ReconcileOutcome::Absent(_) => return None,
        ReconcileOutcome::Invalid { definition, reason } => {
            let previous = previous_managed(definition);
            (
                definition,
                DefinitionPhase::Invalid,
                "InvalidSpec",
                reason.clone(),
                previous,
            )
        }
        ReconcileOutcome::Applied { definition, report } if report.is_converged() => (
            definition,
            DefinitionPhase::Ready,
            "Converged",
            format!("{} object(s) in sync", report.managed()),
            report.managed() as i32,
        ),
        ReconcileOutcome::Applied { definition, report } => {
            let reason = if report.failures.iter().any(|f| f.retryable) {
                "PartialFailure"
            } else {
                "Conflict"
            };
            let message = outcome
                .error()
                .map(|e| e.to_string())
                .unwrap_or_default();
            (
                definition,
                DefinitionPhase::Degraded,
                reason,
                message,
                report.managed() as i32,
            )
        }
    };

    let previous = definition.status.clone().unwrap_or_default();
    let ready = phase == DefinitionPhase::Ready;
    let synced_message = match phase {
        DefinitionPhase::Invalid => "spec cannot be compiled".to_string(),
        _ => format!("generation {} applied", definition.metadata.generation.unwrap_or(0)),
    };

    Some(RbacDefinitionStatus {
        phase,
        message: Some(message.clone()),
        observed_generation: definition.metadata.generation.unwrap_or(0),
        managed_objects,
        conditions: vec![
            condition(&previous.conditions, "Ready", ready, reason, message, now),
            condition(
                &previous.conditions,
                "Synced",
                phase != DefinitionPhase::Invalid,
                reason,
                synced_message,
                now,
            ),
        ],
        last_reconcile_time: Some(now.to_string()),
    })
}

fn previous_managed(definition: &RbacDefinition) -> i32 {
    definition
        .status
        .as_ref()
        .map(|s| s.managed_objects)
        .unwrap_or(0)
}

/// Whether `next` differs from `previous` other than in timestamps
pub fn status_changed(previous: Option<&RbacDefinitionStatus>, next: &RbacDefinitionStatus) -> bool {
    fn strip(status: &RbacDefinitionStatus) -> RbacDefinitionStatus {
        let mut status = status.clone();
        status.last_reconcile_time = None;
        for condition in &mut status.conditions {
            condition.last_transition_time = None;
        }
        status
    }

    match previous {
        Some(previous) => strip(previous) != strip(next),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReconcileReport;
    use crate::error::ObjectFailure;
    use crate::memory::MemoryCluster;
    use crate::metrics::NoopRecorder;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const T0: &str = "2026-01-01T00:00:00+00:00";
    const T1: &str = "2026-01-01T00:05:00+00:00";

    fn create_test_definition() -> RbacDefinition {
        RbacDefinition {
            metadata: ObjectMeta {
                name: Some("team-a".to_string()),
                uid: Some("test-uid".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    fn applied(definition: RbacDefinition, failures: Vec<ObjectFailure>) -> ReconcileOutcome {
        ReconcileOutcome::Applied {
            definition,
            report: ReconcileReport {
                desired: 3,
                failures,
                ..Default::default()
            },
        }
    }

    fn failure(retryable: bool) -> ObjectFailure {
        ObjectFailure {
            kind: "RoleBinding".to_string(),
            name: "ns1/team-a-0-0".to_string(),
            message: "boom".to_string(),
            retryable,
        }
    }

    #[test]
    fn test_build_status_ready() {
        let status = build_status(&applied(create_test_definition(), vec![]), T0).unwrap();
        assert_eq!(status.phase, DefinitionPhase::Ready);
        assert_eq!(status.observed_generation, 3);
        assert_eq!(status.managed_objects, 3);
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == "True" && c.reason == "Converged"));
    }

    #[test]
    fn test_build_status_degraded() {
        let status =
            build_status(&applied(create_test_definition(), vec![failure(true)]), T0).unwrap();
        assert_eq!(status.phase, DefinitionPhase::Degraded);
        assert_eq!(status.conditions[0].reason, "PartialFailure");
        assert!(status.message.unwrap().contains("ns1/team-a-0-0"));

        let status =
            build_status(&applied(create_test_definition(), vec![failure(false)]), T0).unwrap();
        assert_eq!(status.conditions[0].reason, "Conflict");
    }

    #[test]
    fn test_build_status_invalid() {
        let outcome = ReconcileOutcome::Invalid {
            definition: create_test_definition(),
            reason: "binding rule 0 has no subjects".to_string(),
        };
        let status = build_status(&outcome, T0).unwrap();
        assert_eq!(status.phase, DefinitionPhase::Invalid);
        assert_eq!(status.conditions[1].condition_type, "Synced");
        assert_eq!(status.conditions[1].status, "False");
    }

    #[test]
    fn test_absent_definition_has_no_status() {
        let outcome = ReconcileOutcome::Absent(DefinitionId::cluster("gone"));
        assert!(build_status(&outcome, T0).is_none());
    }

    #[test]
    fn test_unchanged_status_keeps_transition_time() {
        let mut definition = create_test_definition();
        let first = build_status(&applied(definition.clone(), vec![]), T0).unwrap();
        definition.status = Some(first.clone());

        let second = build_status(&applied(definition, vec![]), T1).unwrap();
        assert_eq!(
            second.conditions[0].last_transition_time.as_deref(),
            Some(T0)
        );
        assert!(!status_changed(Some(&first), &second));
        assert!(status_changed(None, &second));
    }

    #[test]
    fn test_phase_change_is_a_status_change() {
        let mut definition = create_test_definition();
        let ready = build_status(&applied(definition.clone(), vec![]), T0).unwrap();
        definition.status = Some(ready.clone());

        let degraded = build_status(&applied(definition, vec![failure(true)]), T1).unwrap();
        assert!(status_changed(Some(&ready), &degraded));
        assert_eq!(
            degraded.conditions[0].last_transition_time.as_deref(),
            Some(T1)
        );
    }

    #[tokio::test]
    async fn test_error_policy_backoff() {
        let ctx = ControllerContext::new(
            Arc::new(MemoryCluster::new()),
            OperatorConfig::default(),
            Arc::new(NoopRecorder),
        );
        let id = DefinitionId::cluster("team-a");
        let transient = OperatorError::Transient("timeout".to_string());

        assert_eq!(
            error_policy(&id, &transient, &ctx),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(&id, &transient, &ctx),
            Some(Duration::from_secs(10))
        );

        let invalid = OperatorError::InvalidSpec("no subjects".to_string());
        assert_eq!(error_policy(&id, &invalid, &ctx), None);
        assert!(ctx.error_counts.get(&id).is_none());
    }
}
