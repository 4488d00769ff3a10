//! In-process cluster used by `--dry-run` and by tests.
//!
//! Resource names are derived from kinds, every kind resolves unless marked
//! unserved, and namespaced objects need their namespace to exist first.
//! `default` and `kube-system` exist from the start.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::{json, Value as Json};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use kest_core::{merge_json, ObjectExt};

use crate::{gvk_display, gvk_of, ApiStatus, ClientError, ClusterClient, PatchStrategy, Resource, WatchDelta};

const CLUSTER_SCOPED: &[&str] = &[
    "APIService",
    "CSIDriver",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
    "VolumeAttachment",
];

const NAMESPACES: &str = "v1/namespaces";

/// Lowercase English plural of a kind, the way the API server names resources.
pub fn plural_for(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with("endpoints") {
        lower
    } else if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y').filter(|s| !s.ends_with(['a', 'e', 'i', 'o', 'u'])) {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

type ObjKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjKey, Json>,
    resources: BTreeMap<String, Resource>,
    unserved: HashSet<String>,
    next_rv: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn of_resource(&self, key: &str) -> Vec<Json> {
        self.objects.iter().filter(|((k, _, _), _)| k == key).map(|(_, v)| v.clone()).collect()
    }
}

pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<(String, WatchDelta)>,
    creates: AtomicUsize,
    patches: AtomicUsize,
    deletes: AtomicUsize,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let cluster = Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
            creates: AtomicUsize::new(0),
            patches: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        };
        {
            let mut st = cluster.lock();
            for ns in ["default", "kube-system"] {
                let res = resource_for(&GroupVersionKind::gvk("", "v1", "Namespace"));
                let mut obj = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": ns } });
                stamp_new(&mut st, &mut obj);
                st.resources.insert(res.key(), res);
                st.objects.insert((NAMESPACES.to_string(), String::new(), ns.to_string()), obj);
            }
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, key: &str, delta: WatchDelta) {
        // No receivers just means nothing is watching yet.
        let _ = self.events.send((key.to_string(), delta));
    }

    /// Makes `kind` fail to resolve, like a CRD that is not installed.
    pub fn unserve(&self, kind: &str) {
        self.lock().unserved.insert(kind.to_string());
    }

    pub fn creates(&self) -> usize { self.creates.load(Ordering::SeqCst) }
    pub fn patches(&self) -> usize { self.patches.load(Ordering::SeqCst) }
    pub fn deletes(&self) -> usize { self.deletes.load(Ordering::SeqCst) }

    /// Every stored object, ordered by resource, namespace and name.
    pub fn objects(&self) -> Vec<Json> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn get(&self, res: &Resource, namespace: Option<&str>, name: &str) -> Option<Json> {
        self.lock().objects.get(&obj_key(res, namespace, name)).cloned()
    }
}

fn resource_for(gvk: &GroupVersionKind) -> Resource {
    Resource {
        api: ApiResource::from_gvk_with_plural(gvk, &plural_for(&gvk.kind)),
        namespaced: !CLUSTER_SCOPED.contains(&gvk.kind.as_str()),
    }
}

fn obj_key(res: &Resource, namespace: Option<&str>, name: &str) -> ObjKey {
    let ns = if res.namespaced { namespace.unwrap_or_default() } else { "" };
    (res.key(), ns.to_string(), name.to_string())
}

fn stamp_new(st: &mut State, obj: &mut Json) {
    let rv = st.bump();
    if let Some(meta) = obj.metadata_mut() {
        meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
        meta.insert("resourceVersion".into(), Json::String(rv));
        meta.insert("generation".into(), json!(1));
        meta.insert("creationTimestamp".into(), Json::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
}

/// Object content that drives `metadata.generation`.
fn spec_of(obj: &Json) -> Json {
    let mut v = obj.clone();
    if let Some(m) = v.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    v
}

/// Label selector matching for `k=v`, `k==v`, `k!=v`, `k` and `!k` terms.
pub fn selector_matches(selector: &str, obj: &Json) -> bool {
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            obj.label(k.trim()) != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            obj.label(k.trim()) == Some(v.trim())
        } else if let Some(k) = term.strip_prefix('!') {
            obj.label(k.trim()).is_none()
        } else {
            obj.label(term).is_some()
        }
    })
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Resource, ClientError> {
        if gvk.version.is_empty() || gvk.kind.is_empty() || self.lock().unserved.contains(&gvk.kind) {
            return Err(ClientError::Unresolved(gvk_display(gvk)));
        }
        Ok(resource_for(gvk))
    }

    async fn resources(&self) -> Result<Vec<Resource>, ClientError> {
        Ok(self.lock().resources.values().cloned().collect())
    }

    async fn create(&self, res: &Resource, obj: &Json) -> Result<Json, ClientError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut obj = obj.clone();
        let namespace = obj.namespace().map(str::to_string);
        if res.namespaced && namespace.as_deref().map_or(true, str::is_empty) {
            return Err(ApiStatus::invalid("metadata.namespace: Required value").into());
        }
        let name = match (obj.name(), obj.generate_name()) {
            (Some(n), _) if !n.is_empty() => n.to_string(),
            (_, Some(prefix)) if !prefix.is_empty() => {
                let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
                format!("{prefix}{suffix}")
            }
            _ => return Err(ApiStatus::invalid("metadata.name: Required value").into()),
        };
        obj.set_name(&name);

        let mut st = self.lock();
        if res.namespaced {
            let ns = namespace.unwrap_or_default();
            if !st.objects.contains_key(&(NAMESPACES.to_string(), String::new(), ns.clone())) {
                return Err(ApiStatus::not_found(format!("namespaces \"{ns}\" not found")).into());
            }
        }
        let key = obj_key(res, obj.namespace(), &name);
        if st.objects.contains_key(&key) {
            return Err(ApiStatus::already_exists(format!("{} \"{}\" already exists", res.plural(), name)).into());
        }
        stamp_new(&mut st, &mut obj);
        st.objects.insert(key, obj.clone());
        st.resources.entry(res.key()).or_insert_with(|| res.clone());
        debug!(resource = %res.key(), name = %name, "created");
        self.emit(&res.key(), WatchDelta::Applied(obj.clone()));
        Ok(obj)
    }

    async fn patch(
        &self,
        res: &Resource,
        namespace: Option<&str>,
        name: &str,
        patch: &Json,
        _strategy: PatchStrategy,
    ) -> Result<Json, ClientError> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        let key = obj_key(res, namespace, name);
        let Some(current) = st.objects.get(&key).cloned() else {
            return Err(ApiStatus::not_found(format!("{} \"{}\" not found", res.plural(), name)).into());
        };
        let mut next = current.clone();
        merge_json(&mut next, patch);
        for field in ["uid", "name", "namespace", "creationTimestamp", "resourceVersion", "generation"] {
            if let (Some(meta), Some(v)) = (next.metadata_mut(), current.get("metadata").and_then(|m| m.get(field))) {
                meta.insert(field.into(), v.clone());
            }
        }
        if next != current {
            let generation = current.get("metadata").and_then(|m| m.get("generation")).and_then(Json::as_u64).unwrap_or(1);
            let bump_generation = spec_of(&next) != spec_of(&current);
            let rv = st.bump();
            if let Some(meta) = next.metadata_mut() {
                meta.insert("resourceVersion".into(), Json::String(rv));
                if bump_generation {
                    meta.insert("generation".into(), json!(generation + 1));
                }
            }
            st.objects.insert(key, next.clone());
            self.emit(&res.key(), WatchDelta::Applied(next.clone()));
        }
        Ok(next)
    }

    async fn delete(&self, res: &Resource, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        let key = obj_key(res, namespace, name);
        let Some(removed) = st.objects.remove(&key) else {
            return Err(ApiStatus::not_found(format!("{} \"{}\" not found", res.plural(), name)).into());
        };
        if res.key() == NAMESPACES {
            let contained: Vec<ObjKey> = st.objects.keys().filter(|(_, ns, _)| ns == name).cloned().collect();
            for k in contained {
                if let Some(obj) = st.objects.remove(&k) {
                    self.emit(&k.0, WatchDelta::Deleted(obj));
                }
            }
        }
        self.emit(&res.key(), WatchDelta::Deleted(removed));
        Ok(())
    }

    async fn list(&self, res: &Resource, label_selector: &str) -> Result<Vec<Json>, ClientError> {
        let st = self.lock();
        Ok(st.of_resource(&res.key()).into_iter().filter(|o| selector_matches(label_selector, o)).collect())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClientError> {
        Ok(self.lock().objects.contains_key(&(NAMESPACES.to_string(), String::new(), name.to_string())))
    }

    fn watch(&self, res: &Resource) -> BoxStream<'static, Result<WatchDelta, ClientError>> {
        let key = res.key();
        let rx = self.events.subscribe();
        let initial = self.lock().of_resource(&key);
        let state = self.state.clone();
        let updates = stream::unfold(rx, move |mut rx| {
            let key = key.clone();
            let state = state.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((k, delta)) if k == key => return Some((Ok(delta), rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(resource = %key, missed = n, "watch lagged, relisting");
                            let list = state.lock().unwrap_or_else(|e| e.into_inner()).of_resource(&key);
                            return Some((Ok(WatchDelta::Restarted(list)), rx));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        stream::once(async move { Ok(WatchDelta::Restarted(initial)) }).chain(updates).boxed()
    }
}

/// Resolves the resource of an unstructured object against `client`.
pub async fn resolve_object(client: &dyn ClusterClient, obj: &Json) -> Result<Resource, ClientError> {
    let gvk = gvk_of(obj).ok_or_else(|| ClientError::Unresolved("object without apiVersion/kind".into()))?;
    client.resolve(&gvk).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map(name: &str) -> Json {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default", "labels": { "app": "web" } },
            "data": { "k": "v" }
        })
    }

    #[test]
    fn plurals() {
        assert_eq!(plural_for("Pod"), "pods");
        assert_eq!(plural_for("Ingress"), "ingresses");
        assert_eq!(plural_for("NetworkPolicy"), "networkpolicies");
        assert_eq!(plural_for("Gateway"), "gateways");
        assert_eq!(plural_for("Endpoints"), "endpoints");
    }

    #[test]
    fn selectors() {
        let o = config_map("a");
        assert!(selector_matches("app=web", &o));
        assert!(selector_matches("app==web,app", &o));
        assert!(!selector_matches("app!=web", &o));
        assert!(selector_matches("!tier", &o));
        assert!(selector_matches("", &o));
    }

    #[tokio::test]
    async fn create_conflict_and_patch() {
        let c = MemoryCluster::new();
        let res = resolve_object(&c, &config_map("a")).await.unwrap();
        assert!(res.namespaced);

        let created = c.create(&res, &config_map("a")).await.unwrap();
        assert_eq!(created.revision(), Some(3));
        let err = c.create(&res, &config_map("a")).await.unwrap_err();
        assert!(err.api_status().unwrap().is_already_exists());

        let patched = c
            .patch(&res, Some("default"), "a", &json!({ "data": { "k": "w" } }), PatchStrategy::Strategic)
            .await
            .unwrap();
        assert_eq!(patched["data"]["k"], "w");
        assert_eq!(patched["metadata"]["generation"], 2);
        assert!(patched.revision() > created.revision());
        assert_eq!((c.creates(), c.patches()), (2, 1));
    }

    #[tokio::test]
    async fn namespaced_objects_need_their_namespace() {
        let c = MemoryCluster::new();
        let mut cm = config_map("a");
        cm.set_namespace("team");
        let res = resolve_object(&c, &cm).await.unwrap();
        assert!(c.create(&res, &cm).await.unwrap_err().is_not_found());

        let ns = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "team" } });
        let ns_res = resolve_object(&c, &ns).await.unwrap();
        assert!(!ns_res.namespaced);
        c.create(&ns_res, &ns).await.unwrap();
        assert!(c.namespace_exists("team").await.unwrap());
        c.create(&res, &cm).await.unwrap();

        c.delete(&ns_res, None, "team").await.unwrap();
        assert!(c.get(&res, Some("team"), "a").is_none());
    }

    #[tokio::test]
    async fn watch_replays_then_follows() {
        let c = MemoryCluster::new();
        let res = resolve_object(&c, &config_map("a")).await.unwrap();
        c.create(&res, &config_map("a")).await.unwrap();

        let mut w = c.watch(&res);
        match w.next().await.unwrap().unwrap() {
            WatchDelta::Restarted(list) => assert_eq!(list.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        c.create(&res, &config_map("b")).await.unwrap();
        c.delete(&res, Some("default"), "a").await.unwrap();
        assert!(matches!(w.next().await.unwrap().unwrap(), WatchDelta::Applied(o) if o.name() == Some("b")));
        assert!(matches!(w.next().await.unwrap().unwrap(), WatchDelta::Deleted(o) if o.name() == Some("a")));
    }

    #[tokio::test]
    async fn generate_name_and_unserved_kinds() {
        let c = MemoryCluster::new();
        let obj = json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "generateName": "web-", "namespace": "default" } });
        let res = resolve_object(&c, &obj).await.unwrap();
        let created = c.create(&res, &obj).await.unwrap();
        assert!(created.name().unwrap().starts_with("web-"));
        assert_eq!(created.name().unwrap().len(), "web-".len() + 5);

        c.unserve("Widget");
        let w = json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "x" } });
        assert!(matches!(resolve_object(&c, &w).await, Err(ClientError::Unresolved(_))));
    }
}
