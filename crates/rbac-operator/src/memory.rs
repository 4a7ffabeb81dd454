//! In-memory cluster for tests
//!
//! [`MemoryCluster`] implements [`ClusterClient`] over a map of JSON objects.
//! It assigns resourceVersions and uids, enforces optimistic concurrency on
//! updates, garbage-collects dependents of deleted definitions, broadcasts
//! watch events, counts every write, and can be told to fail specific calls.

use crate::cluster_client::{ClusterClient, WatchEvent};
use crate::compiler::NamespaceInfo;
use crate::crd::{DefinitionId, RbacDefinition, RbacDefinitionStatus, KIND};
use crate::error::{OperatorError, Result};
use crate::kinds::{ClusterResource, ManagedResource};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};

/// Calls that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
    PatchStatus,
}

type StoreKey = (String, Option<String>, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
enum Broadcast {
    Object {
        kind: String,
        event_type: EventType,
        object: Value,
    },
    Broken(String),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, Value>,
    next_version: u64,
    next_uid: u64,
    failures: HashMap<(Operation, String, String), usize>,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Consume one injected failure for `(op, kind, name)`, `*` matching any name
    fn take_failure(&mut self, op: Operation, kind: &str, name: &str) -> bool {
        for candidate in [name, "*"] {
            let key = (op, kind.to_string(), candidate.to_string());
            if let Some(remaining) = self.failures.get_mut(&key) {
                *remaining -= 1;
                if *remaining == 0 {
                    self.failures.remove(&key);
                }
                return true;
            }
        }
        false
    }
}

/// Write counters
#[derive(Debug, Default)]
struct Counters {
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    status_patches: AtomicU64,
}

/// An in-memory [`ClusterClient`]
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
    events: broadcast::Sender<Broadcast>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

fn key_of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> StoreKey {
    (kind_of::<K>(), namespace.map(str::to_string), name.to_string())
}

fn decode<K: ClusterResource>(value: Value) -> Result<K> {
    serde_json::from_value(value).map_err(|e| OperatorError::Decode {
        kind: kind_of::<K>(),
        message: e.to_string(),
    })
}

fn meta_of(value: &Value) -> ObjectMeta {
    value
        .get("metadata")
        .cloned()
        .and_then(|m| serde_json::from_value(m).ok())
        .unwrap_or_default()
}

/// Equality-only selector: `k1=v1,k2=v2`
fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        })
}

fn injected(op: Operation, kind: &str, name: &str) -> OperatorError {
    OperatorError::Transient(format!("injected {:?} failure for {} {}", op, kind, name))
}

fn not_found(kind: &str, namespace: Option<&str>, name: &str) -> OperatorError {
    OperatorError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.unwrap_or_default().to_string(),
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            counters: Arc::new(Counters::default()),
            events,
        }
    }

    fn publish(&self, kind: &str, event_type: EventType, object: &Value) {
        // no subscribers is fine
        let _ = self.events.send(Broadcast::Object {
            kind: kind.to_string(),
            event_type,
            object: object.clone(),
        });
    }

    /// Number of creates performed through the client
    pub fn creates(&self) -> u64 {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> u64 {
        self.counters.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u64 {
        self.counters.deletes.load(Ordering::SeqCst)
    }

    pub fn status_patches(&self) -> u64 {
        self.counters.status_patches.load(Ordering::SeqCst)
    }

    /// Every write made through the client, status patches included
    pub fn mutations(&self) -> u64 {
        self.creates() + self.updates() + self.deletes() + self.status_patches()
    }

    /// Make the next `times` calls of `op` on `kind`/`name` fail with a transient error
    ///
    /// `name` may be `*` to match any object of the kind; list failures always use `*`.
    pub async fn fail_next(&self, op: Operation, kind: &str, name: &str, times: usize) {
        self.state
            .lock()
            .await
            .failures
            .insert((op, kind.to_string(), name.to_string()), times);
    }

    /// Create or update a definition the way `kubectl apply` would
    ///
    /// New definitions get a uid and generation 1; a spec change bumps the generation.
    pub async fn put_definition(&self, mut definition: RbacDefinition) -> RbacDefinition {
        let key = key_of::<RbacDefinition>(None, &definition.name_any());
        let mut state = self.state.lock().await;

        let existing: Option<RbacDefinition> = state
            .objects
            .get(&key)
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let event_type = match &existing {
            Some(current) => {
                definition.metadata.uid = current.metadata.uid.clone();
                definition.status = current.status.clone();
                let spec_changed = serde_json::to_value(&current.spec).ok()
                    != serde_json::to_value(&definition.spec).ok();
                let generation = current.metadata.generation.unwrap_or(1);
                definition.metadata.generation =
                    Some(if spec_changed { generation + 1 } else { generation });
                EventType::Modified
            }
            None => {
                state.next_uid += 1;
                definition.metadata.uid = Some(format!("uid-{}", state.next_uid));
                definition.metadata.generation = Some(1);
                EventType::Added
            }
        };
        definition.metadata.resource_version = Some(state.bump_version());

        if let Ok(value) = serde_json::to_value(&definition) {
            state.objects.insert(key, value.clone());
            drop(state);
            self.publish(KIND, event_type, &value);
        }
        definition
    }

    /// Current stored copy of a definition, status included
    pub async fn definition(&self, name: &str) -> Option<RbacDefinition> {
        let key = key_of::<RbacDefinition>(None, name);
        let state = self.state.lock().await;
        state.objects.get(&key).and_then(|v| decode(v.clone()).ok())
    }

    /// Delete a definition and garbage-collect its dependents
    ///
    /// The definition's owner reference is removed from every object; objects
    /// left without owners are deleted, as the API server's collector does.
    pub async fn delete_definition(&self, name: &str) {
        let key = key_of::<RbacDefinition>(None, name);
        let mut state = self.state.lock().await;
        let Some(removed) = state.objects.remove(&key) else {
            return;
        };
        let uid = meta_of(&removed).uid.unwrap_or_default();

        let mut published = vec![(KIND.to_string(), EventType::Deleted, removed)];
        let keys: Vec<StoreKey> = state.objects.keys().cloned().collect();
        for key in keys {
            let Some(value) = state.objects.get(&key) else {
                continue;
            };
            let mut meta = meta_of(value);
            let Some(refs) = meta.owner_references.as_mut() else {
                continue;
            };
            let before = refs.len();
            refs.retain(|r| r.uid != uid);
            if refs.len() == before {
                continue;
            }

            if refs.is_empty() {
                if let Some(value) = state.objects.remove(&key) {
                    published.push((key.0.clone(), EventType::Deleted, value));
                }
            } else {
                let version = state.bump_version();
                meta.resource_version = Some(version);
                if let (Some(value), Ok(meta)) =
                    (state.objects.get_mut(&key), serde_json::to_value(&meta))
                {
                    value["metadata"] = meta;
                    published.push((key.0.clone(), EventType::Modified, value.clone()));
                }
            }
        }
        drop(state);

        for (kind, event_type, value) in published {
            self.publish(&kind, event_type, &value);
        }
    }

    /// Add or relabel a namespace
    pub async fn put_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let mut ns = Namespace::default();
        ns.metadata.name = Some(name.to_string());
        ns.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self.put_object(ns).await;
    }

    /// Write an object directly, bypassing counters and failure injection
    ///
    /// Used to simulate out-of-band edits.
    pub async fn put_object<K: ClusterResource>(&self, mut obj: K) {
        let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
        let mut state = self.state.lock().await;
        let event_type = if state.objects.contains_key(&key) {
            EventType::Modified
        } else {
            EventType::Added
        };
        obj.meta_mut().resource_version = Some(state.bump_version());
        if let Ok(value) = serde_json::to_value(&obj) {
            state.objects.insert(key, value.clone());
            drop(state);
            self.publish(&kind_of::<K>(), event_type, &value);
        }
    }

    /// Delete an object directly, bypassing counters and failure injection
    pub async fn remove_object<K: ClusterResource>(&self, namespace: Option<&str>, name: &str) {
        let key = key_of::<K>(namespace, name);
        let removed = self.state.lock().await.objects.remove(&key);
        if let Some(value) = removed {
            self.publish(&kind_of::<K>(), EventType::Deleted, &value);
        }
    }

    /// Read an object without going through the client
    pub async fn object<K: ClusterResource>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = key_of::<K>(namespace, name);
        let state = self.state.lock().await;
        state.objects.get(&key).and_then(|v| decode(v.clone()).ok())
    }

    /// All stored objects of one kind
    pub async fn objects<K: ClusterResource>(&self) -> Vec<K> {
        let kind = kind_of::<K>();
        let state = self.state.lock().await;
        state
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .filter_map(|(_, v)| decode(v.clone()).ok())
            .collect()
    }

    /// Deliver a raw watch event, e.g. one that does not parse as its kind
    pub fn inject_raw_event(&self, kind: &str, object: Value) {
        self.publish(kind, EventType::Modified, &object);
    }

    /// Make every open watch stream report an error
    pub fn break_watches(&self, reason: &str) {
        let _ = self.events.send(Broadcast::Broken(reason.to_string()));
    }

    /// Number of open watch streams
    pub fn watchers(&self) -> usize {
        self.events.receiver_count()
    }

    async fn check_failure(&self, op: Operation, kind: &str, name: &str) -> Result<()> {
        if self.state.lock().await.take_failure(op, kind, name) {
            return Err(injected(op, kind, name));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get_definition(&self, id: &DefinitionId) -> Result<Option<RbacDefinition>> {
        self.check_failure(Operation::Get, KIND, &id.name).await?;
        let key = key_of::<RbacDefinition>(None, &id.name);
        let value = self.state.lock().await.objects.get(&key).cloned();
        value.map(decode).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<RbacDefinition>> {
        self.check_failure(Operation::List, KIND, "*").await?;
        Ok(self.objects::<RbacDefinition>().await)
    }

    async fn patch_definition_status(
        &self,
        id: &DefinitionId,
        status: &RbacDefinitionStatus,
    ) -> Result<()> {
        self.check_failure(Operation::PatchStatus, KIND, &id.name)
            .await?;
        let key = key_of::<RbacDefinition>(None, &id.name);
        let mut state = self.state.lock().await;
        if !state.objects.contains_key(&key) {
            return Err(not_found(KIND, None, &id.name));
        }
        let version = state.bump_version();
        let status = serde_json::to_value(status)?;
        let Some(value) = state.objects.get_mut(&key) else {
            return Err(not_found(KIND, None, &id.name));
        };
        value["status"] = status;
        value["metadata"]["resourceVersion"] = Value::String(version);
        let value = value.clone();
        drop(state);

        self.counters.status_patches.fetch_add(1, Ordering::SeqCst);
        self.publish(KIND, EventType::Modified, &value);
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        self.check_failure(Operation::List, "Namespace", "*").await?;
        Ok(self
            .objects::<Namespace>()
            .await
            .iter()
            .map(NamespaceInfo::from)
            .collect())
    }

    async fn list<K: ManagedResource>(&self, selector: &str) -> Result<Vec<K>> {
        let kind = kind_of::<K>();
        self.check_failure(Operation::List, &kind, "*").await?;
        let state = self.state.lock().await;
        state
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .filter(|(_, v)| selector_matches(selector, &meta_of(v).labels.unwrap_or_default()))
            .map(|(_, v)| decode(v.clone()))
            .collect()
    }

    async fn get<K: ManagedResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        self.check_failure(Operation::Get, &kind_of::<K>(), name)
            .await?;
        let key = key_of::<K>(namespace, name);
        let value = self.state.lock().await.objects.get(&key).cloned();
        value.map(decode).transpose()
    }

    async fn create<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let name = obj.name_any();
        let namespace = obj.namespace();
        self.check_failure(Operation::Create, &kind, &name).await?;

        let key = key_of::<K>(namespace.as_deref(), &name);
        let mut state = self.state.lock().await;
        if state.objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind,
                name,
                namespace: namespace.unwrap_or_default(),
            });
        }

        let mut created = obj.clone();
        state.next_uid += 1;
        created.meta_mut().uid = Some(format!("uid-{}", state.next_uid));
        created.meta_mut().resource_version = Some(state.bump_version());
        let value = serde_json::to_value(&created)?;
        state.objects.insert(key, value.clone());
        drop(state);

        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        self.publish(&kind, EventType::Added, &value);
        Ok(created)
    }

    async fn replace<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let name = obj.name_any();
        let namespace = obj.namespace();
        self.check_failure(Operation::Update, &kind, &name).await?;

        let key = key_of::<K>(namespace.as_deref(), &name);
        let mut state = self.state.lock().await;
        let Some(current) = state.objects.get(&key) else {
            return Err(not_found(&kind, namespace.as_deref(), &name));
        };
        let current_meta = meta_of(current);
        if obj.resource_version().is_some() && obj.resource_version() != current_meta.resource_version
        {
            return Err(OperatorError::Transient(format!(
                "{} {} was modified concurrently",
                kind, name
            )));
        }

        let mut updated = obj.clone();
        updated.meta_mut().uid = current_meta.uid;
        updated.meta_mut().resource_version = Some(state.bump_version());
        let value = serde_json::to_value(&updated)?;
        state.objects.insert(key, value.clone());
        drop(state);

        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        self.publish(&kind, EventType::Modified, &value);
        Ok(updated)
    }

    async fn delete<K: ManagedResource>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let kind = kind_of::<K>();
        self.check_failure(Operation::Delete, &kind, name).await?;

        let key = key_of::<K>(namespace, name);
        let removed = self.state.lock().await.objects.remove(&key);
        let Some(value) = removed else {
            return Err(not_found(&kind, namespace, name));
        };

        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.publish(&kind, EventType::Deleted, &value);
        Ok(())
    }

    fn watch<K: ClusterResource>(
        &self,
        selector: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent<K>>> {
        // subscribe before listing so nothing falls between the two
        let rx = self.events.subscribe();
        let kind = kind_of::<K>();
        let selector = selector.map(str::to_string);

        let state = Arc::clone(&self.state);
        let (list_kind, list_selector) = (kind.clone(), selector.clone());
        let listing = stream::once(async move {
            let state = state.lock().await;
            state
                .objects
                .iter()
                .filter(|((k, _, _), _)| *k == list_kind)
                .filter(|(_, v)| {
                    list_selector.as_deref().map_or(true, |s| {
                        selector_matches(s, &meta_of(v).labels.unwrap_or_default())
                    })
                })
                .map(|(_, v)| decode::<K>(v.clone()).map(WatchEvent::Added))
                .collect::<Vec<_>>()
        })
        .flat_map(stream::iter);

        let changes = stream::unfold((rx, kind, selector), |(mut rx, kind, selector)| async move {
            loop {
                let item = match rx.recv().await {
                    Ok(Broadcast::Broken(reason)) => Err(OperatorError::WatchError(reason)),
                    Ok(Broadcast::Object {
                        kind: event_kind,
                        event_type,
                        object,
                    }) => {
                        if event_kind != kind {
                            continue;
                        }
                        let labels = meta_of(&object).labels.unwrap_or_default();
                        if let Some(selector) = &selector {
                            if !selector_matches(selector, &labels) {
                                continue;
                            }
                        }
                        decode::<K>(object).map(|obj| match event_type {
                            EventType::Added => WatchEvent::Added(obj),
                            EventType::Modified => WatchEvent::Modified(obj),
                            EventType::Deleted => WatchEvent::Deleted(obj),
                        })
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                };
                return Some((item, (rx, kind, selector)));
            }
        });

        listing.chain(changes).boxed()
    }
}
