//! Cluster client
//!
//! The [`ClusterClient`] trait is the operator's only door to the API server:
//! typed list/get/create/replace/delete for the managed kinds, definition
//! reads and status writes, and watch streams of add/modify/delete events.
//! [`KubeClusterClient`] implements it on top of `kube`; tests use the
//! in-memory `MemoryCluster` behind the `test-util` feature.

use crate::compiler::NamespaceInfo;
use crate::crd::{DefinitionId, RbacDefinition, RbacDefinitionStatus};
use crate::error::{OperatorError, Result};
use crate::kinds::{ClusterResource, ManagedResource};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Default timeout for a single API call
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Field manager recorded on status patches
const FIELD_MANAGER: &str = "rbac-operator";

/// A change observed on a watched kind
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Typed access to the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Fetch a definition, `None` if it does not exist
    async fn get_definition(&self, id: &DefinitionId) -> Result<Option<RbacDefinition>>;

    async fn list_definitions(&self) -> Result<Vec<RbacDefinition>>;

    /// Replace the status subresource of a definition
    async fn patch_definition_status(
        &self,
        id: &DefinitionId,
        status: &RbacDefinitionStatus,
    ) -> Result<()>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>>;

    /// List objects of one kind across all namespaces matching a label selector
    async fn list<K: ManagedResource>(&self, selector: &str) -> Result<Vec<K>>;

    async fn get<K: ManagedResource>(&self, namespace: Option<&str>, name: &str)
        -> Result<Option<K>>;

    async fn create<K: ManagedResource>(&self, obj: &K) -> Result<K>;

    /// Update an object; `obj` must carry the resourceVersion it was read at
    async fn replace<K: ManagedResource>(&self, obj: &K) -> Result<K>;

    async fn delete<K: ManagedResource>(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Subscribe to changes of one kind
    ///
    /// The stream starts with an `Added` event per existing object. Objects
    /// that cannot be parsed as `K` surface as [`OperatorError::Decode`]
    /// items, and connection failures as [`OperatorError::WatchError`]; the
    /// stream keeps going after both, reporting what changed during an outage
    /// once it reconnects.
    fn watch<K: ClusterResource>(
        &self,
        selector: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// Configuration for the kube-backed client
#[derive(Debug, Clone)]
pub struct ClusterClientConfig {
    /// Timeout for a single API call
    pub operation_timeout: Duration,
}

impl Default for ClusterClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// [`ClusterClient`] backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    config: ClusterClientConfig,
}

impl KubeClusterClient {
    /// Create a new cluster client with default configuration
    pub fn new(client: Client) -> Self {
        Self::with_config(client, ClusterClientConfig::default())
    }

    /// Create a new cluster client with custom configuration
    pub fn with_config(client: Client, config: ClusterClientConfig) -> Self {
        Self { client, config }
    }

    /// Untyped API for a managed kind, so namespaced and cluster-scoped
    /// kinds share one code path
    fn dynamic_api<K: ManagedResource>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn definitions(&self) -> Api<RbacDefinition> {
        Api::all(self.client.clone())
    }

    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        timeout(self.config.operation_timeout, fut)
            .await
            .map_err(|_| OperatorError::Transient(format!("{} timed out", what)))?
            .map_err(OperatorError::from)
    }
}

/// Translate API errors for one object into the operator taxonomy
fn classify(err: OperatorError, kind: &str, namespace: Option<&str>, name: &str) -> OperatorError {
    let OperatorError::KubeError(kube::Error::Api(response)) = &err else {
        return err;
    };
    let namespace = namespace.unwrap_or_default().to_string();
    match response.code {
        404 => OperatorError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace,
        },
        409 if response.reason == "AlreadyExists" => OperatorError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace,
        },
        // resourceVersion conflicts, throttling and server errors clear up on retry
        409 | 429 | 500..=599 => OperatorError::Transient(response.message.clone()),
        _ => err,
    }
}

fn to_dynamic<K: ManagedResource>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Parse an untyped object as `K`
pub fn parse_object<K: ClusterResource>(obj: DynamicObject) -> Result<K> {
    obj.try_parse::<K>().map_err(|e| OperatorError::Decode {
        kind: K::kind(&()).to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_definition(&self, id: &DefinitionId) -> Result<Option<RbacDefinition>> {
        let api = self.definitions();
        self.call("get RbacDefinition", api.get_opt(&id.name)).await
    }

    async fn list_definitions(&self) -> Result<Vec<RbacDefinition>> {
        let api = self.definitions();
        let list = self
            .call("list RbacDefinitions", api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn patch_definition_status(
        &self,
        id: &DefinitionId,
        status: &RbacDefinitionStatus,
    ) -> Result<()> {
        let api = self.definitions();
        let patch = serde_json::json!({ "status": status });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.call(
            "patch RbacDefinition status",
            api.patch_status(&id.name, &params, &Patch::Merge(&patch)),
        )
        .await
        .map_err(|e| classify(e, "RbacDefinition", None, &id.name))?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = self
            .call("list Namespaces", api.list(&ListParams::default()))
            .await?;
        Ok(list.items.iter().map(NamespaceInfo::from).collect())
    }

    async fn list<K: ManagedResource>(&self, selector: &str) -> Result<Vec<K>> {
        let api: Api<K> = Api::all(self.client.clone());
        let params = ListParams::default().labels(selector);
        let list = self
            .call(&format!("list {}", K::MANAGED_KIND), api.list(&params))
            .await?;
        Ok(list.items)
    }

    async fn get<K: ManagedResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        let api = self.dynamic_api::<K>(namespace);
        let found = self
            .call(&format!("get {}", K::MANAGED_KIND), api.get_opt(name))
            .await?;
        found.map(parse_object::<K>).transpose()
    }

    async fn create<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let api = self.dynamic_api::<K>(namespace.as_deref());
        let body = to_dynamic(obj)?;

        debug!(kind = %K::MANAGED_KIND, name = %name, "Creating object");
        let created = self
            .call(
                &format!("create {}", K::MANAGED_KIND),
                api.create(&PostParams::default(), &body),
            )
            .await
            .map_err(|e| classify(e, K::MANAGED_KIND.as_str(), namespace.as_deref(), &name))?;
        parse_object(created)
    }

    async fn replace<K: ManagedResource>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let api = self.dynamic_api::<K>(namespace.as_deref());
        let body = to_dynamic(obj)?;

        debug!(kind = %K::MANAGED_KIND, name = %name, "Updating object");
        let updated = self
            .call(
                &format!("update {}", K::MANAGED_KIND),
                api.replace(&name, &PostParams::default(), &body),
            )
            .await
            .map_err(|e| classify(e, K::MANAGED_KIND.as_str(), namespace.as_deref(), &name))?;
        parse_object(updated)
    }

    async fn delete<K: ManagedResource>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let api = self.dynamic_api::<K>(namespace);

        debug!(kind = %K::MANAGED_KIND, name = %name, "Deleting object");
        self.call(
            &format!("delete {}", K::MANAGED_KIND),
            api.delete(name, &DeleteParams::background()),
        )
        .await
        .map_err(|e| classify(e, K::MANAGED_KIND.as_str(), namespace, name))?;
        Ok(())
    }

    fn watch<K: ClusterResource>(
        &self,
        selector: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &ApiResource::erase::<K>(&()));
        let mut config = watcher::Config::default();
        if let Some(selector) = selector {
            config = config.labels(selector);
        }

        // one translator for the life of the stream, so relists after a
        // reconnect are diffed against everything seen before
        let mut translator = EventTranslator::<K>::default();
        watcher(api, config)
            .flat_map(move |event| {
                let items = match event {
                    Ok(event) => translator.translate(event),
                    Err(e) => vec![Err(OperatorError::WatchError(e.to_string()))],
                };
                stream::iter(items)
            })
            .boxed()
    }
}

/// Turns `kube` watcher events (apply/delete plus relist markers) into
/// added/modified/deleted events
///
/// The translator remembers the last seen version of every object, so a
/// relist reports objects that disappeared while the watch was down as
/// deletions, and re-delivered objects with an unchanged resourceVersion
/// produce nothing.
pub struct EventTranslator<K> {
    known: HashMap<String, K>,
    relisted: Option<HashSet<String>>,
}

impl<K> Default for EventTranslator<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

impl<K: ClusterResource> EventTranslator<K> {
    pub fn translate(
        &mut self,
        event: watcher::Event<DynamicObject>,
    ) -> Vec<Result<WatchEvent<K>>> {
        match event {
            watcher::Event::Init => {
                self.begin_relist();
                Vec::new()
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                match parse_object::<K>(obj) {
                    Ok(obj) => self.apply(obj).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                }
            }
            watcher::Event::Delete(obj) => match parse_object::<K>(obj) {
                Ok(obj) => vec![Ok(self.delete(obj))],
                Err(e) => vec![Err(e)],
            },
            watcher::Event::InitDone => self.finish_relist().into_iter().map(Ok).collect(),
        }
    }

    pub fn begin_relist(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    pub fn apply(&mut self, obj: K) -> Option<WatchEvent<K>> {
        let key = object_key(&obj);
        if let Some(seen) = self.relisted.as_mut() {
            seen.insert(key.clone());
        }

        let event = match self.known.get(&key) {
            None => Some(WatchEvent::Added(obj.clone())),
            Some(previous) if previous.resource_version() != obj.resource_version() => {
                Some(WatchEvent::Modified(obj.clone()))
            }
            Some(_) => None,
        };
        self.known.insert(key, obj);
        event
    }

    pub fn delete(&mut self, obj: K) -> WatchEvent<K> {
        self.known.remove(&object_key(&obj));
        WatchEvent::Deleted(obj)
    }

    /// Report everything known that the relist did not mention as deleted
    pub fn finish_relist(&mut self) -> Vec<WatchEvent<K>> {
        let Some(seen) = self.relisted.take() else {
            return Vec::new();
        };
        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        gone.into_iter()
            .filter_map(|key| self.known.remove(&key))
            .map(WatchEvent::Deleted)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::ClusterRole;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn role(name: &str, version: &str) -> ClusterRole {
        ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn names(events: &[WatchEvent<ClusterRole>]) -> Vec<String> {
        events.iter().map(|e| e.object().name_any()).collect()
    }

    #[test]
    fn test_apply_distinguishes_added_and_modified() {
        let mut translator = EventTranslator::default();
        assert!(matches!(
            translator.apply(role("reader", "1")),
            Some(WatchEvent::Added(_))
        ));
        assert!(matches!(
            translator.apply(role("reader", "2")),
            Some(WatchEvent::Modified(_))
        ));
        assert!(translator.apply(role("reader", "2")).is_none());
    }

    #[test]
    fn test_relist_reports_vanished_objects_as_deleted() {
        let mut translator = EventTranslator::default();
        translator.apply(role("a", "1"));
        translator.apply(role("b", "1"));

        translator.begin_relist();
        assert!(translator.apply(role("a", "1")).is_none());
        let deleted = translator.finish_relist();

        assert_eq!(names(&deleted), vec!["b"]);
        assert!(matches!(deleted[0], WatchEvent::Deleted(_)));
        assert!(translator.finish_relist().is_empty());
    }

    #[test]
    fn test_delete_forgets_object() {
        let mut translator = EventTranslator::default();
        translator.apply(role("a", "1"));
        assert!(matches!(
            translator.delete(role("a", "2")),
            WatchEvent::Deleted(_)
        ));
        assert!(matches!(
            translator.apply(role("a", "3")),
            Some(WatchEvent::Added(_))
        ));
    }

    #[test]
    fn test_translate_drops_unparseable_objects() {
        let mut translator = EventTranslator::<ClusterRole>::default();
        let garbage: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": { "name": "broken", "resourceVersion": "1" },
            "rules": "not-a-list"
        }))
        .unwrap();

        let out = translator.translate(watcher::Event::Apply(garbage));
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(OperatorError::Decode { .. })));
    }

    #[test]
    fn test_translate_parses_valid_objects() {
        let mut translator = EventTranslator::<ClusterRole>::default();
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": { "name": "reader", "resourceVersion": "7" },
            "rules": [{ "apiGroups": [""], "resources": ["pods"], "verbs": ["get"] }]
        }))
        .unwrap();

        let out = translator.translate(watcher::Event::InitApply(obj));
        assert!(matches!(out.as_slice(), [Ok(WatchEvent::Added(r))] if r.name_any() == "reader"));
    }
}
