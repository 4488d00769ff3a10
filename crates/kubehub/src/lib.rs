//! Kest kubehub: resource discovery, object CRUD and watch streams.
//!
//! Everything above this crate talks to a cluster through [`ClusterClient`].
//! [`KubeClient`] implements it against a live API server with kube-rs;
//! [`memory::MemoryCluster`] implements it in process for dry runs and tests.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{verbs, Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use kest_core::{ObjectExt, MANAGER_NAME};

pub mod memory;

/// API groups served by the core API server. Objects of these groups
/// accept strategic merge patches.
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "apps",
    "authentication.k8s.io",
    "authorization.k8s.io",
    "autoscaling",
    "batch",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "flowcontrol.apiserver.k8s.io",
    "networking.k8s.io",
    "node.k8s.io",
    "policy",
    "rbac.authorization.k8s.io",
    "scheduling.k8s.io",
    "storage.k8s.io",
];

/// A served API resource.
#[derive(Debug, Clone)]
pub struct Resource {
    pub api: ApiResource,
    pub namespaced: bool,
}

impl Resource {
    pub fn from_parts(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self { api: ApiResource::from_gvk_with_plural(&gvk, plural), namespaced }
    }

    /// Stable identity, e.g. `apps/v1/deployments` or `v1/pods`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api.api_version, self.api.plural)
    }

    pub fn plural(&self) -> &str { &self.api.plural }

    pub fn builtin(&self) -> bool { BUILTIN_GROUPS.contains(&self.api.group.as_str()) }

    pub fn patch_strategy(&self) -> PatchStrategy {
        if self.builtin() { PatchStrategy::Strategic } else { PatchStrategy::Merge }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    Strategic,
    Merge,
}

/// Status returned by the API server for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({reason}, {code})")]
pub struct ApiStatus {
    pub status: String,
    pub message: String,
    pub reason: String,
    pub code: u16,
}

impl ApiStatus {
    pub fn new(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self { status: "Failure".into(), message: message.into(), reason: reason.into(), code }
    }

    pub fn not_found(message: impl Into<String>) -> Self { Self::new(404, "NotFound", message) }
    pub fn already_exists(message: impl Into<String>) -> Self { Self::new(409, "AlreadyExists", message) }
    pub fn invalid(message: impl Into<String>) -> Self { Self::new(422, "Invalid", message) }

    pub fn is_not_found(&self) -> bool { self.code == 404 }
    pub fn is_already_exists(&self) -> bool { self.reason == "AlreadyExists" || self.code == 409 }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiStatus),
    #[error("no served resource for {0}")]
    Unresolved(String),
    #[error("cluster request failed: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn api_status(&self) -> Option<&ApiStatus> {
        match self {
            ClientError::Api(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool { self.api_status().is_some_and(ApiStatus::is_not_found) }
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(r) => ClientError::Api(ApiStatus { status: r.status, message: r.message, reason: r.reason, code: r.code }),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// One change observed on a watched resource.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchDelta {
    Applied(Json),
    Deleted(Json),
    /// The watch (re)listed; carries the full current set.
    Restarted(Vec<Json>),
}

/// Parses `apiVersion` and `kind` of an unstructured object.
pub fn gvk_of(obj: &Json) -> Option<GroupVersionKind> {
    let kind = obj.kind().filter(|k| !k.is_empty())?;
    let (group, version) = obj.group_version();
    if version.is_empty() {
        return None;
    }
    Some(GroupVersionKind::gvk(&group, &version, kind))
}

pub fn gvk_display(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Cluster operations the harness relies on.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Resource, ClientError>;

    /// Every listable resource the cluster serves.
    async fn resources(&self) -> Result<Vec<Resource>, ClientError>;

    /// Creates `obj`; namespaced objects are created in `metadata.namespace`.
    async fn create(&self, res: &Resource, obj: &Json) -> Result<Json, ClientError>;

    async fn patch(
        &self,
        res: &Resource,
        namespace: Option<&str>,
        name: &str,
        patch: &Json,
        strategy: PatchStrategy,
    ) -> Result<Json, ClientError>;

    /// Deletes with foreground propagation.
    async fn delete(&self, res: &Resource, namespace: Option<&str>, name: &str) -> Result<(), ClientError>;

    /// Lists across all namespaces.
    async fn list(&self, res: &Resource, label_selector: &str) -> Result<Vec<Json>, ClientError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClientError>;

    /// Long-lived watch over every object of `res`. The stream starts with
    /// a [`WatchDelta::Restarted`] carrying the current list.
    fn watch(&self, res: &Resource) -> BoxStream<'static, Result<WatchDelta, ClientError>>;
}

fn strip_managed_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    v
}

fn to_json(obj: &DynamicObject) -> Result<Json, ClientError> {
    serde_json::to_value(obj)
        .map(strip_managed_fields)
        .map_err(|e| ClientError::Transport(format!("encoding object: {e}")))
}

fn to_dynamic(obj: &Json) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(obj.clone()).map_err(|e| ClientError::Api(ApiStatus::invalid(format!("object does not decode: {e}"))))
}

/// Live cluster access through kube-rs.
pub struct KubeClient {
    client: Client,
    discovery: Mutex<Option<Arc<Discovery>>>,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: Mutex::new(None) }
    }

    /// Client for the default kubeconfig context or in-cluster config.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("loading kubernetes client configuration")?;
        Ok(Self::new(client))
    }

    async fn discovery(&self, refresh: bool) -> Result<Arc<Discovery>, ClientError> {
        let mut cached = self.discovery.lock().await;
        if let (Some(d), false) = (cached.as_ref(), refresh) {
            return Ok(d.clone());
        }
        let started = std::time::Instant::now();
        let d = Arc::new(Discovery::new(self.client.clone()).run().await?);
        info!(groups = d.groups().count(), took_ms = %started.elapsed().as_millis(), "discovery refreshed");
        *cached = Some(d.clone());
        Ok(d)
    }

    fn api(&self, res: &Resource, namespace: Option<&str>) -> Api<DynamicObject> {
        match (res.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &res.api),
            _ => Api::all_with(self.client.clone(), &res.api),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Resource, ClientError> {
        for refresh in [false, true] {
            let discovery = self.discovery(refresh).await?;
            if let Some((api, caps)) = discovery.resolve_gvk(gvk) {
                return Ok(Resource { api, namespaced: matches!(caps.scope, Scope::Namespaced) });
            }
            debug!(gvk = %gvk_display(gvk), refresh, "kind not in discovery");
        }
        Err(ClientError::Unresolved(gvk_display(gvk)))
    }

    async fn resources(&self) -> Result<Vec<Resource>, ClientError> {
        let discovery = self.discovery(false).await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (api, caps) in group.recommended_resources() {
                if caps.supports_operation(verbs::LIST) {
                    out.push(Resource { api, namespaced: matches!(caps.scope, Scope::Namespaced) });
                }
            }
        }
        Ok(out)
    }

    async fn create(&self, res: &Resource, obj: &Json) -> Result<Json, ClientError> {
        counter!("kube_requests", 1u64, "verb" => "create");
        let api = self.api(res, obj.namespace());
        let pp = PostParams { field_manager: Some(MANAGER_NAME.to_string()), ..Default::default() };
        let created = api.create(&pp, &to_dynamic(obj)?).await?;
        to_json(&created)
    }

    async fn patch(
        &self,
        res: &Resource,
        namespace: Option<&str>,
        name: &str,
        patch: &Json,
        strategy: PatchStrategy,
    ) -> Result<Json, ClientError> {
        counter!("kube_requests", 1u64, "verb" => "patch");
        let api = self.api(res, namespace);
        let pp = PatchParams { field_manager: Some(MANAGER_NAME.to_string()), ..Default::default() };
        let patched = match strategy {
            PatchStrategy::Strategic => api.patch(name, &pp, &Patch::Strategic(patch)).await?,
            PatchStrategy::Merge => api.patch(name, &pp, &Patch::Merge(patch)).await?,
        };
        to_json(&patched)
    }

    async fn delete(&self, res: &Resource, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        counter!("kube_requests", 1u64, "verb" => "delete");
        self.api(res, namespace).delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn list(&self, res: &Resource, label_selector: &str) -> Result<Vec<Json>, ClientError> {
        counter!("kube_requests", 1u64, "verb" => "list");
        let lp = ListParams::default().labels(label_selector);
        let list = self.api(res, None).list(&lp).await?;
        list.items.iter().map(to_json).collect()
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClientError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    fn watch(&self, res: &Resource) -> BoxStream<'static, Result<WatchDelta, ClientError>> {
        let api = self.api(res, None);
        info!(resource = %res.key(), "watch started");
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|ev| match ev {
                Ok(watcher::Event::Applied(o)) => Ok(WatchDelta::Applied(to_json(&o)?)),
                Ok(watcher::Event::Deleted(o)) => Ok(WatchDelta::Deleted(to_json(&o)?)),
                Ok(watcher::Event::Restarted(list)) => {
                    Ok(WatchDelta::Restarted(list.iter().map(to_json).collect::<Result<_, _>>()?))
                }
                Err(e) => Err(ClientError::Transport(e.to_string())),
            })
            .boxed()
    }
}

/// Every object labeled with `selector`, across all listable resources.
/// Resources that refuse the list are skipped with a warning.
pub async fn list_selected(client: &dyn ClusterClient, selector: &str) -> Result<Vec<Json>, ClientError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for res in client.resources().await? {
        match client.list(&res, selector).await {
            Ok(items) => {
                for item in items {
                    // The same object can be served under several group versions.
                    let key = item.uid().map(str::to_string).unwrap_or_else(|| {
                        format!("{}/{}/{}", res.key(), item.namespace().unwrap_or_default(), item.name().unwrap_or_default())
                    });
                    if seen.insert(key) {
                        out.push(item);
                    }
                }
            }
            Err(e) => warn!(resource = %res.key(), error = %e, "list failed"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(group: &str, kind: &str, plural: &str) -> Resource {
        Resource::from_parts(group, "v1", kind, plural, true)
    }

    #[test]
    fn builtin_groups_use_strategic_merge() {
        assert_eq!(resource("", "Pod", "pods").patch_strategy(), PatchStrategy::Strategic);
        assert_eq!(resource("apps", "Deployment", "deployments").patch_strategy(), PatchStrategy::Strategic);
        assert_eq!(resource("example.com", "Widget", "widgets").patch_strategy(), PatchStrategy::Merge);
        assert_eq!(resource("gateway.networking.k8s.io", "Gateway", "gateways").patch_strategy(), PatchStrategy::Merge);
        assert_eq!(resource("", "Pod", "pods").key(), "v1/pods");
        assert_eq!(resource("apps", "Deployment", "deployments").key(), "apps/v1/deployments");
    }

    #[test]
    fn gvk_parsing() {
        let gvk = gvk_of(&json!({ "apiVersion": "apps/v1", "kind": "Deployment" })).unwrap();
        assert_eq!(gvk_display(&gvk), "apps/v1/Deployment");
        let gvk = gvk_of(&json!({ "apiVersion": "v1", "kind": "Pod" })).unwrap();
        assert_eq!(gvk_display(&gvk), "v1/Pod");
        assert!(gvk_of(&json!({ "kind": "Pod" })).is_none());
    }

    #[test]
    fn api_status_classification() {
        assert!(ClientError::from(ApiStatus::not_found("gone")).is_not_found());
        assert!(ApiStatus::already_exists("x").is_already_exists());
        assert!(!ClientError::Transport("eof".into()).is_not_found());
        let s = serde_json::to_value(ApiStatus::invalid("bad")).unwrap();
        assert_eq!(s, json!({ "status": "Failure", "message": "bad", "reason": "Invalid", "code": 422 }));
    }
}
