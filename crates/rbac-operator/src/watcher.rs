//! Watch loops
//!
//! Every watched kind runs its own long-lived task. A task is either
//! `Running` (dispatching events to its handler) or `Error` (stream failing,
//! backing off between polls until it recovers or is replaced). It only
//! stops on shutdown.
//!
//! Handlers turn events into reconcile requests:
//! - [`DriftWatcher`]: modify/delete of a generated object enqueues each
//!   owner, past and present;
//! - [`DefinitionWatcher`]: any change to a definition enqueues it;
//! - [`NamespaceWatcher`]: namespace changes enqueue definitions that select
//!   namespaces by label.

use crate::cluster_client::{ClusterClient, WatchEvent};
use crate::crd::{DefinitionId, RbacDefinition};
use crate::error::{exponential_backoff, OperatorError};
use crate::kinds::ClusterResource;
use crate::metrics::OutcomeRecorder;
use crate::ownership::owners_of;
use crate::queue::WorkQueue;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// State of one watch task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Running,
    Error,
}

/// Reacts to the events of one watched kind
#[async_trait]
pub trait WatchHandler<K: Send + 'static>: Send {
    async fn handle(&mut self, event: WatchEvent<K>);

    /// Called after the watch was re-established following an error
    async fn resubscribed(&mut self) {}
}

/// Backoff for re-subscribing broken watches
#[derive(Debug, Clone, Copy)]
pub struct WatchBackoff {
    pub base: Duration,
    pub max: Duration,
}

/// Run a watch until `shutdown` flips
///
/// A stream error puts the task in `Error`: it backs off, then keeps polling
/// the same stream, whose underlying watcher reconnects and relists on its
/// own. Only a stream that ends is replaced by a fresh subscription, after
/// which the handler's [`WatchHandler::resubscribed`] runs.
pub async fn run_watch<C, K, H>(
    client: Arc<C>,
    selector: Option<String>,
    backoff: WatchBackoff,
    recorder: Arc<dyn OutcomeRecorder>,
    mut shutdown: watch::Receiver<bool>,
    mut handler: H,
) where
    C: ClusterClient,
    K: ClusterResource,
    H: WatchHandler<K>,
{
    let kind = K::kind(&()).to_string();
    let mut state = WatchState::Running;
    let mut failures: u32 = 0;
    let mut subscribed = false;

    'subscribe: loop {
        if *shutdown.borrow() {
            break;
        }

        if subscribed {
            let delay = exponential_backoff(failures, backoff.base, backoff.max);
            warn!(kind = %kind, delay_ms = delay.as_millis() as u64, "Watch ended, re-subscribing after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        let mut stream = client.watch::<K>(selector.as_deref());
        if subscribed {
            info!(kind = %kind, "Watch re-subscribed");
            handler.resubscribed().await;
        } else {
            debug!(kind = %kind, "Watch subscribed");
            subscribed = true;
        }

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = shutdown.changed() => break 'subscribe,
            };

            match item {
                Some(Ok(event)) => {
                    if state == WatchState::Error {
                        info!(kind = %kind, "Watch recovered");
                        state = WatchState::Running;
                    }
                    failures = 0;
                    handler.handle(event).await;
                }
                Some(Err(e @ OperatorError::Decode { .. })) => {
                    error!(kind = %kind, error = %e, "Could not parse watched object, dropping event");
                }
                Some(Err(e)) => {
                    recorder.record_watch_error(&kind);
                    failures = failures.saturating_add(1);
                    state = WatchState::Error;
                    let delay = exponential_backoff(failures, backoff.base, backoff.max);
                    warn!(kind = %kind, error = %e, delay_ms = delay.as_millis() as u64, "Watch failed, retrying after backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break 'subscribe,
                    }
                }
                None => {
                    recorder.record_watch_error(&kind);
                    failures = failures.saturating_add(1);
                    state = WatchState::Error;
                    continue 'subscribe;
                }
            }
        }
    }
    debug!(kind = %kind, "Watch stopped");
}

/// Re-enqueues the owners of generated objects that were modified or deleted
///
/// The owners of every live object are remembered, so an owner reference
/// removed out of band still rechecks the former owner, and a fresh
/// subscription can recheck everything the old one knew about.
pub struct DriftWatcher {
    queue: Arc<WorkQueue>,
    tracked: HashMap<String, BTreeSet<DefinitionId>>,
}

impl DriftWatcher {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            queue,
            tracked: HashMap::new(),
        }
    }

    /// Enqueue one request per owner the event concerns; returns how many were enqueued
    pub fn on_event<K: Resource>(&mut self, event: &WatchEvent<K>) -> usize {
        let obj = event.object();
        let path = match obj.namespace() {
            Some(ns) => format!("{}/{}", ns, obj.name_any()),
            None => obj.name_any(),
        };
        let owners = owners_of(obj.meta());

        let affected = match event {
            WatchEvent::Added(_) => {
                self.track(path, owners);
                return 0;
            }
            WatchEvent::Modified(_) => {
                let mut affected = self.tracked.get(&path).cloned().unwrap_or_default();
                affected.extend(owners.iter().cloned());
                self.track(path.clone(), owners);
                affected
            }
            WatchEvent::Deleted(_) => {
                let mut affected = self.tracked.remove(&path).unwrap_or_default();
                affected.extend(owners);
                affected
            }
        };

        for owner in &affected {
            debug!(definition = %owner, object = %path, "Drift detected");
            self.queue.enqueue(owner.clone());
        }
        affected.len()
    }

    fn track(&mut self, path: String, owners: BTreeSet<DefinitionId>) {
        if owners.is_empty() {
            self.tracked.remove(&path);
        } else {
            self.tracked.insert(path, owners);
        }
    }

    /// Number of live objects whose owners are remembered
    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }
}

#[async_trait]
impl<K> WatchHandler<K> for DriftWatcher
where
    K: Resource + Send + Sync + 'static,
{
    async fn handle(&mut self, event: WatchEvent<K>) {
        self.on_event(&event);
    }

    /// Changes while unsubscribed were not seen; recheck every known owner
    /// and rebuild from the new subscription's initial listing
    async fn resubscribed(&mut self) {
        let owners: BTreeSet<DefinitionId> = self.tracked.drain().flat_map(|(_, o)| o).collect();
        for owner in owners {
            self.queue.enqueue(owner);
        }
    }
}

/// Enqueues a definition whenever it is created, changed or deleted
pub struct DefinitionWatcher {
    queue: Arc<WorkQueue>,
}

impl DefinitionWatcher {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl WatchHandler<RbacDefinition> for DefinitionWatcher {
    async fn handle(&mut self, event: WatchEvent<RbacDefinition>) {
        self.queue.enqueue(event.object().id());
    }
}

/// Enqueues selector-based definitions when namespaces appear, disappear or
/// change labels
pub struct NamespaceWatcher<C> {
    client: Arc<C>,
    queue: Arc<WorkQueue>,
    labels: HashMap<String, BTreeMap<String, String>>,
}

impl<C: ClusterClient> NamespaceWatcher<C> {
    pub fn new(client: Arc<C>, queue: Arc<WorkQueue>) -> Self {
        Self {
            client,
            queue,
            labels: HashMap::new(),
        }
    }

    /// Whether the event can change what a namespace selector matches
    fn is_relevant(&mut self, event: &WatchEvent<Namespace>) -> bool {
        let ns = event.object();
        let name = ns.name_any();
        match event {
            WatchEvent::Deleted(_) => {
                self.labels.remove(&name);
                true
            }
            WatchEvent::Added(_) | WatchEvent::Modified(_) => {
                let labels = ns.labels().clone();
                self.labels.insert(name, labels.clone()) != Some(labels)
            }
        }
    }

    async fn enqueue_selector_definitions(&self) {
        match self.client.list_definitions().await {
            Ok(definitions) => {
                for def in definitions.iter().filter(|d| d.uses_namespace_selector()) {
                    self.queue.enqueue(def.id());
                }
            }
            Err(e) => warn!(error = %e, "Failed to list RbacDefinitions after namespace change"),
        }
    }
}

#[async_trait]
impl<C: ClusterClient> WatchHandler<Namespace> for NamespaceWatcher<C> {
    async fn handle(&mut self, event: WatchEvent<Namespace>) {
        if self.is_relevant(&event) {
            debug!(namespace = %event.object().name_any(), "Namespace changed");
            self.enqueue_selector_definitions().await;
        }
    }

    async fn resubscribed(&mut self) {
        self.enqueue_selector_definitions().await;
    }
}
