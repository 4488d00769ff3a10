//! Kest object driver.
//!
//! The driver owns every object a run touches. It applies objects with
//! create-or-patch semantics, watches each resource kind it has applied,
//! keeps an adoption pool of the objects this run owns, and fans watch
//! events out to subscribers.
//!
//! Locking: the pool, the subscriber list and the informer table each have
//! their own mutex. No code path holds two of them at once.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::{json, Value as Json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kest_core::{Environment, ObjectExt, ObjectReference, DEFAULT_NAMESPACE, LABEL_MANAGED_BY};
use kest_doc::{Fragment, FragmentError};
use kest_kubehub::{gvk_display, gvk_of, ApiStatus, ClientError, ClusterClient, Resource, WatchDelta};

pub mod fixture;
pub mod hydrate;

pub use fixture::{FixtureError, FixtureKey, FixtureSet};
pub use hydrate::{HydrateError, Hydrator, Object, Operation};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("object has no apiVersion or kind")]
    MissingKind,
    #[error("object {0} has no name")]
    MissingName(String),
    #[error("cannot resolve {kind}: {source}")]
    Resolution {
        kind: String,
        #[source]
        source: ClientError,
    },
    #[error(transparent)]
    Client(ClientError),
    #[error("object driver used after done()")]
    Done,
}

/// Outcome of an apply or delete. API rejections land in `error`; only
/// plumbing failures are returned as [`DriverError`].
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<Json>,
    pub target: ObjectReference,
}

impl OperationResult {
    pub fn succeeded(&self) -> bool { self.error.is_none() }
}

/// Identity of an object in the adoption pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(res: &Resource, obj: &Json) -> Self {
        Self {
            resource: res.key(),
            namespace: if res.namespaced { obj.namespace_or_default().to_string() } else { String::new() },
            name: obj.name().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub resource: Resource,
    pub object: Json,
    pub revision: Option<u64>,
}

/// Latest observed snapshot of every object the run owns.
#[derive(Debug, Default)]
pub struct AdoptionPool {
    entries: FxHashMap<ObjectKey, PoolEntry>,
}

impl AdoptionPool {
    /// Stores `object` unless the pool already holds a newer or equal
    /// revision of it. Returns whether the entry changed.
    pub fn fold(&mut self, resource: &Resource, object: Json) -> bool {
        let key = ObjectKey::new(resource, &object);
        let revision = object.revision();
        let newer = match (self.entries.get(&key).map(|e| e.revision), revision) {
            (None, _) => true,
            (Some(Some(held)), Some(seen)) => seen > held,
            (Some(None), _) => true,
            (Some(Some(_)), None) => false,
        };
        if newer {
            self.entries.insert(key, PoolEntry { resource: resource.clone(), object, revision });
        }
        newer
    }

    pub fn remove(&mut self, key: &ObjectKey) -> Option<PoolEntry> { self.entries.remove(key) }
    pub fn get(&self, key: &ObjectKey) -> Option<&PoolEntry> { self.entries.get(key) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn clear(&mut self) { self.entries.clear() }

    /// Entries ordered by key.
    pub fn entries(&self) -> Vec<(ObjectKey, PoolEntry)> {
        let mut v: Vec<_> = self.entries.iter().map(|(k, e)| (k.clone(), e.clone())).collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

/// A watch event delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ObjectEvent {
    pub kind: EventKind,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
    pub object: Json,
}

pub type EventHandler = Arc<dyn Fn(&ObjectEvent) + Send + Sync>;

#[derive(Default)]
struct Watchers {
    next: u64,
    handlers: Vec<(u64, EventHandler)>,
}

/// Registration returned by [`ObjectDriver::watch`]. Dropping it cancels.
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Removes the handler. Waits for any delivery in progress, so it must
    /// not be called from inside the handler itself.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.watchers).handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Summary of [`ObjectDriver::delete_all`].
#[derive(Debug, Default)]
pub struct Cleanup {
    pub deleted: Vec<ObjectKey>,
    pub failed: Vec<(ObjectKey, ClientError)>,
}

/// Object lifecycle operations the runner is written against.
#[async_trait]
pub trait ObjectDriver: Send + Sync {
    /// Creates the object, or patches it if it already exists.
    async fn apply(&self, obj: &Json) -> Result<OperationResult, DriverError>;

    async fn delete(&self, obj: &Json) -> Result<OperationResult, DriverError>;

    /// Deletes every adopted object with foreground propagation,
    /// namespaced objects before cluster-scoped ones.
    async fn delete_all(&self) -> Result<Cleanup, DriverError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, DriverError>;

    /// For an object without a name: the live object of the same kind,
    /// namespace and labels that this run owns, if any. Only the object's
    /// own labels select; an object with `generateName` or without labels
    /// of its own matches nothing and is created fresh.
    async fn select_owned(&self, obj: &Json) -> Result<Option<Json>, DriverError>;

    /// Registers `handler` for events on every watched resource.
    fn watch(&self, handler: EventHandler) -> Subscription;

    /// Current adoption pool contents.
    fn adopted(&self) -> Vec<(ObjectKey, PoolEntry)>;

    /// Stops every informer and drops pool and subscriber state.
    fn done(&self);
}

struct Shared {
    env: Environment,
    pool: Mutex<AdoptionPool>,
    watchers: Mutex<Watchers>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn publish(&self, ev: &ObjectEvent) {
        let watchers = lock(&self.watchers);
        for (_, handler) in &watchers.handlers {
            handler(ev);
        }
    }

    fn observe(&self, res: &Resource, seen: &mut FxHashSet<ObjectKey>, obj: Json) {
        let key = ObjectKey::new(res, &obj);
        let kind = if seen.insert(key) { EventKind::Added } else { EventKind::Updated };
        if self.env.owns(&obj) {
            lock(&self.pool).fold(res, obj.clone());
        }
        self.publish(&ObjectEvent { kind, resource: res.plural().to_string(), object: obj });
    }

    fn forget(&self, res: &Resource, seen: &mut FxHashSet<ObjectKey>, obj: Json) {
        let key = ObjectKey::new(res, &obj);
        seen.remove(&key);
        lock(&self.pool).remove(&key);
        self.publish(&ObjectEvent { kind: EventKind::Deleted, resource: res.plural().to_string(), object: obj });
    }
}

async fn run_informer(shared: Weak<Shared>, res: Resource, mut stream: BoxStream<'static, Result<WatchDelta, ClientError>>) {
    let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
    let mut last: FxHashMap<ObjectKey, Json> = FxHashMap::default();
    while let Some(item) = stream.next().await {
        let Some(shared) = shared.upgrade() else { break };
        match item {
            Ok(WatchDelta::Applied(obj)) => {
                last.insert(ObjectKey::new(&res, &obj), obj.clone());
                shared.observe(&res, &mut seen, obj);
            }
            Ok(WatchDelta::Deleted(obj)) => {
                last.remove(&ObjectKey::new(&res, &obj));
                shared.forget(&res, &mut seen, obj);
            }
            Ok(WatchDelta::Restarted(list)) => {
                debug!(resource = %res.key(), count = list.len(), "watch relisted");
                let current: FxHashSet<ObjectKey> = list.iter().map(|o| ObjectKey::new(&res, o)).collect();
                let gone: Vec<ObjectKey> = last.keys().filter(|k| !current.contains(*k)).cloned().collect();
                for key in gone {
                    if let Some(obj) = last.remove(&key) {
                        shared.forget(&res, &mut seen, obj);
                    }
                }
                for obj in list {
                    last.insert(ObjectKey::new(&res, &obj), obj.clone());
                    shared.observe(&res, &mut seen, obj);
                }
            }
            Err(e) => warn!(resource = %res.key(), error = %e, "watch error"),
        }
    }
    debug!(resource = %res.key(), "informer stopped");
}

/// [`ObjectDriver`] backed by a [`ClusterClient`]: a live API server, or the
/// in-memory cluster for dry runs.
pub struct ClusterObjectDriver {
    client: Arc<dyn ClusterClient>,
    shared: Arc<Shared>,
    informers: Mutex<FxHashMap<String, JoinHandle<()>>>,
    done: AtomicBool,
}

impl ClusterObjectDriver {
    pub fn new(client: Arc<dyn ClusterClient>, env: Environment) -> Self {
        Self {
            client,
            shared: Arc::new(Shared {
                env,
                pool: Mutex::new(AdoptionPool::default()),
                watchers: Mutex::new(Watchers::default()),
            }),
            informers: Mutex::new(FxHashMap::default()),
            done: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> { &self.client }

    fn ensure_live(&self) -> Result<(), DriverError> {
        if self.done.load(Ordering::SeqCst) { Err(DriverError::Done) } else { Ok(()) }
    }

    async fn resolve(&self, obj: &Json) -> Result<Resource, DriverError> {
        let gvk = gvk_of(obj).ok_or(DriverError::MissingKind)?;
        self.client.resolve(&gvk).await.map_err(|source| match source {
            ClientError::Transport(_) => DriverError::Client(source),
            _ => DriverError::Resolution { kind: gvk_display(&gvk), source },
        })
    }

    /// Starts the informer for `res` unless one is already running.
    fn ensure_informer(&self, res: &Resource) {
        let mut informers = lock(&self.informers);
        let key = res.key();
        if informers.contains_key(&key) {
            return;
        }
        info!(resource = %key, "starting informer");
        let stream = self.client.watch(res);
        let handle = tokio::spawn(run_informer(Arc::downgrade(&self.shared), res.clone(), stream));
        informers.insert(key, handle);
    }

    async fn patch(&self, res: &Resource, target: &Json) -> Result<Json, ClientError> {
        let name = target.name().unwrap_or_default();
        debug!(resource = %res.key(), name, "patching");
        self.client.patch(res, namespace_arg(res, target), name, target, res.patch_strategy()).await
    }

    /// Creates `target`; if it already exists, patches it instead.
    async fn create_or_patch(&self, res: &Resource, target: &Json) -> Result<Json, ClientError> {
        match self.client.create(res, target).await {
            Err(ClientError::Api(status)) if status.is_already_exists() => self.patch(res, target).await,
            other => other,
        }
    }

    fn target(res: &Resource, obj: &Json) -> Json {
        let mut target = obj.clone();
        if res.namespaced && target.namespace().map_or(true, str::is_empty) {
            target.set_namespace(DEFAULT_NAMESPACE);
        }
        target
    }
}

fn namespace_arg<'a>(res: &Resource, obj: &'a Json) -> Option<&'a str> {
    if res.namespaced { Some(obj.namespace_or_default()) } else { None }
}

#[async_trait]
impl ObjectDriver for ClusterObjectDriver {
    async fn apply(&self, obj: &Json) -> Result<OperationResult, DriverError> {
        self.ensure_live()?;
        let res = self.resolve(obj).await?;
        let target = Self::target(&res, obj);
        self.ensure_informer(&res);

        counter!("objects_applied", 1u64);
        let adopted = target.name().is_some() && lock(&self.shared.pool).get(&ObjectKey::new(&res, &target)).is_some();
        let outcome = if adopted {
            match self.patch(&res, &target).await {
                Err(e) if e.is_not_found() => self.create_or_patch(&res, &target).await,
                other => other,
            }
        } else {
            self.create_or_patch(&res, &target).await
        };

        let reference = ObjectReference::from_object(&target);
        match outcome {
            Ok(latest) => {
                lock(&self.shared.pool).fold(&res, latest.clone());
                Ok(OperationResult { error: None, latest: Some(latest), target: reference })
            }
            Err(ClientError::Api(status)) => {
                debug!(target = %reference, error = %status, "apply rejected");
                Ok(OperationResult { error: Some(status), latest: None, target: reference })
            }
            Err(e) => Err(DriverError::Client(e)),
        }
    }

    async fn delete(&self, obj: &Json) -> Result<OperationResult, DriverError> {
        self.ensure_live()?;
        let res = self.resolve(obj).await?;
        let target = Self::target(&res, obj);
        let reference = ObjectReference::from_object(&target);
        let name = target.name().ok_or_else(|| DriverError::MissingName(reference.to_string()))?;
        self.ensure_informer(&res);

        counter!("objects_deleted", 1u64);
        match self.client.delete(&res, namespace_arg(&res, &target), name).await {
            Ok(()) => {
                lock(&self.shared.pool).remove(&ObjectKey::new(&res, &target));
                Ok(OperationResult { error: None, latest: None, target: reference })
            }
            Err(ClientError::Api(status)) => Ok(OperationResult { error: Some(status), latest: None, target: reference }),
            Err(e) => Err(DriverError::Client(e)),
        }
    }

    async fn delete_all(&self) -> Result<Cleanup, DriverError> {
        self.ensure_live()?;
        let mut entries = lock(&self.shared.pool).entries();
        entries.sort_by_key(|(k, e)| (!e.resource.namespaced, k.clone()));

        let mut cleanup = Cleanup::default();
        for (key, entry) in entries {
            let ns = entry.resource.namespaced.then_some(key.namespace.as_str());
            match self.client.delete(&entry.resource, ns, &key.name).await {
                Ok(()) => cleanup.deleted.push(key.clone()),
                Err(e) if e.is_not_found() => debug!(object = ?key, "already gone"),
                Err(e) => {
                    warn!(object = ?key, error = %e, "cleanup delete failed");
                    cleanup.failed.push((key.clone(), e));
                }
            }
            lock(&self.shared.pool).remove(&key);
        }
        info!(deleted = cleanup.deleted.len(), failed = cleanup.failed.len(), "adopted objects cleaned up");
        Ok(cleanup)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, DriverError> {
        self.client.namespace_exists(name).await.map_err(DriverError::Client)
    }

    async fn select_owned(&self, obj: &Json) -> Result<Option<Json>, DriverError> {
        if obj.generate_name().is_some_and(|prefix| !prefix.is_empty()) {
            return Ok(None);
        }
        // Every owned object carries the manager label, so it cannot tell them apart.
        let labels: Vec<String> = obj
            .labels()
            .into_iter()
            .filter(|(k, _)| k != LABEL_MANAGED_BY)
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if labels.is_empty() {
            return Ok(None);
        }
        let selector = labels.join(",");
        let res = self.resolve(obj).await?;
        let namespace = res.namespaced.then(|| obj.namespace_or_default().to_string());
        let mut candidates: Vec<Json> = self
            .client
            .list(&res, &selector)
            .await
            .map_err(DriverError::Client)?
            .into_iter()
            .filter(|o| self.shared.env.owns(o))
            .filter(|o| namespace.as_deref().map_or(true, |ns| o.namespace_or_default() == ns))
            .collect();
        candidates.sort_by(|a, b| a.name().cmp(&b.name()));
        if candidates.len() > 1 {
            warn!(resource = %res.key(), selector = %selector, matches = candidates.len(), "several owned objects match, using the first");
        }
        Ok(candidates.into_iter().next())
    }

    fn watch(&self, handler: EventHandler) -> Subscription {
        let mut watchers = lock(&self.shared.watchers);
        let id = watchers.next;
        watchers.next += 1;
        watchers.handlers.push((id, handler));
        Subscription { id, shared: Arc::downgrade(&self.shared) }
    }

    fn adopted(&self) -> Vec<(ObjectKey, PoolEntry)> {
        lock(&self.shared.pool).entries()
    }

    fn done(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, handle) in lock(&self.informers).drain() {
            handle.abort();
        }
        lock(&self.shared.watchers).handlers.clear();
        lock(&self.shared.pool).clear();
    }
}

impl Drop for ClusterObjectDriver {
    fn drop(&mut self) {
        for (_, handle) in lock(&self.informers).drain() {
            handle.abort();
        }
    }
}

const UPDATE_CHECK: &str = include_str!("builtin/update.rego");
const DELETE_CHECK: &str = include_str!("builtin/delete.rego");

/// Check run after an object operation whose fragment has no `$check`.
pub fn default_check(op: Operation) -> Result<Fragment, FragmentError> {
    Fragment::policy(match op {
        Operation::Update => UPDATE_CHECK,
        Operation::Delete => DELETE_CHECK,
    })
}

/// A namespace object named `name`.
pub fn namespace_object(name: &str) -> Json {
    json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": name } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kest_kubehub::memory::MemoryCluster;
    use proptest::prelude::*;
    use std::time::Duration;

    fn pods() -> Resource {
        Resource::from_parts("", "v1", "Pod", "pods", true)
    }

    fn pod(rv: Option<u64>) -> Json {
        let mut p = json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p", "namespace": "default" } });
        if let Some(rv) = rv {
            p["metadata"]["resourceVersion"] = Json::String(rv.to_string());
        }
        p
    }

    fn config_map(data: &str, env: &Environment) -> Json {
        let mut cm = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cm" }, "data": { "k": data } });
        hydrate::inject_metadata(&mut cm, env);
        cm
    }

    fn driver(env: &Environment) -> (Arc<MemoryCluster>, ClusterObjectDriver) {
        let cluster = Arc::new(MemoryCluster::new());
        let d = ClusterObjectDriver::new(cluster.clone(), env.clone());
        (cluster, d)
    }

    proptest! {
        #[test]
        fn pool_never_regresses(revs in proptest::collection::vec(proptest::option::of(1u64..50), 1..40)) {
            let mut pool = AdoptionPool::default();
            let res = pods();
            let key = ObjectKey::new(&res, &pod(None));
            let mut best: Option<u64> = None;
            for rv in revs {
                pool.fold(&res, pod(rv));
                if let Some(rv) = rv {
                    best = Some(best.map_or(rv, |b| b.max(rv)));
                }
                let held = pool.get(&key).map(|e| e.revision);
                prop_assert_eq!(held, Some(best));
            }
            prop_assert_eq!(pool.len(), 1);
        }
    }

    #[test]
    fn pool_ignores_stale_revisions() {
        let mut pool = AdoptionPool::default();
        assert!(pool.fold(&pods(), pod(Some(5))));
        assert!(!pool.fold(&pods(), pod(Some(5))));
        assert!(!pool.fold(&pods(), pod(Some(3))));
        assert!(!pool.fold(&pods(), pod(None)));
        assert!(pool.fold(&pods(), pod(Some(6))));
        assert_eq!(pool.entries()[0].1.revision, Some(6));
    }

    #[tokio::test]
    async fn apply_twice_creates_then_patches() {
        let env = Environment::with_run_id("run-a");
        let (cluster, d) = driver(&env);

        let first = d.apply(&config_map("one", &env)).await.unwrap();
        assert!(first.succeeded());
        assert_eq!(first.target.namespace, "default");
        let second = d.apply(&config_map("two", &env)).await.unwrap();
        assert!(second.succeeded());
        assert_eq!(second.latest.as_ref().unwrap()["data"]["k"], "two");

        assert_eq!((cluster.creates(), cluster.patches()), (1, 1));
        let adopted = d.adopted();
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].0, ObjectKey { resource: "v1/configmaps".into(), namespace: "default".into(), name: "cm".into() });
        assert_eq!(adopted[0].1.object["data"]["k"], "two");
        d.done();
    }

    #[tokio::test]
    async fn preexisting_objects_are_patched_after_conflict() {
        let env = Environment::with_run_id("run-c");
        let (cluster, d) = driver(&env);
        let mut seed = config_map("old", &env);
        seed.set_namespace("default");
        let res = kest_kubehub::memory::resolve_object(cluster.as_ref(), &seed).await.unwrap();
        cluster.create(&res, &seed).await.unwrap();

        let r = d.apply(&config_map("new", &env)).await.unwrap();
        assert!(r.succeeded());
        assert_eq!((cluster.creates(), cluster.patches()), (2, 1));
        assert_eq!(cluster.get(&res, Some("default"), "cm").unwrap()["data"]["k"], "new");
        d.done();
    }

    #[tokio::test]
    async fn api_rejections_are_results_not_errors() {
        let env = Environment::with_run_id("run-b");
        let (_cluster, d) = driver(&env);
        let mut cm = config_map("x", &env);
        cm.set_namespace("missing");
        let r = d.apply(&cm).await.unwrap();
        assert!(!r.succeeded());
        assert!(r.error.unwrap().is_not_found());

        let r = d.delete(&config_map("x", &env)).await.unwrap();
        assert_eq!(r.error.map(|s| s.code), Some(404));
    }

    #[tokio::test]
    async fn unresolvable_kinds_fail() {
        let env = Environment::with_run_id("run-c");
        let (cluster, d) = driver(&env);
        cluster.unserve("Widget");
        let w = json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" } });
        assert!(matches!(d.apply(&w).await, Err(DriverError::Resolution { .. })));
        assert!(matches!(d.apply(&json!({ "metadata": {} })).await, Err(DriverError::MissingKind)));
    }

    #[tokio::test]
    async fn watchers_see_events_until_cancelled() {
        let env = Environment::with_run_id("run-d");
        let (_cluster, d) = driver(&env);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = d.watch(Arc::new(move |ev: &ObjectEvent| {
            let _ = tx.send((ev.kind, ev.resource.clone(), ev.object.name().map(str::to_string)));
        }));

        d.apply(&config_map("one", &env)).await.unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev, (EventKind::Added, "configmaps".to_string(), Some("cm".to_string())));

        d.delete(&config_map("one", &env)).await.unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.0, EventKind::Deleted);
        assert!(d.adopted().is_empty());

        sub.cancel();
        d.apply(&config_map("two", &env)).await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        d.done();
    }

    #[tokio::test]
    async fn delete_all_removes_namespaced_objects_first() {
        let env = Environment::with_run_id("run-e");
        let (cluster, d) = driver(&env);
        let mut ns = namespace_object("team");
        hydrate::inject_metadata(&mut ns, &env);
        d.apply(&ns).await.unwrap();
        let mut cm = config_map("x", &env);
        cm.set_namespace("team");
        d.apply(&cm).await.unwrap();

        let cleanup = d.delete_all().await.unwrap();
        assert!(cleanup.failed.is_empty());
        let names: Vec<&str> = cleanup.deleted.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["cm", "team"]);
        assert!(!cluster.namespace_exists("team").await.unwrap());
        assert!(d.adopted().is_empty());
    }

    #[tokio::test]
    async fn owned_children_are_adopted_and_selectable() {
        let env = Environment::with_run_id("run-f");
        let (cluster, d) = driver(&env);
        d.apply(&config_map("x", &env)).await.unwrap();

        // A controller creating a child that carries the run annotation.
        let mut child = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "generateName": "cm-", "namespace": "default", "labels": { "app": "child" } }
        });
        hydrate::inject_metadata(&mut child, &env);
        let res = kest_kubehub::memory::resolve_object(cluster.as_ref(), &child).await.unwrap();
        let created = cluster.create(&res, &child).await.unwrap();

        let mut adopted = 0;
        for _ in 0..50 {
            adopted = d.adopted().len();
            if adopted == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(adopted, 2);

        let mut unnamed = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "labels": { "app": "child" } } });
        hydrate::inject_metadata(&mut unnamed, &env);
        let found = d.select_owned(&unnamed).await.unwrap().unwrap();
        assert_eq!(found.name(), created.name());

        let other = ClusterObjectDriver::new(cluster.clone(), Environment::with_run_id("someone-else"));
        assert!(other.select_owned(&unnamed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_user_labels_select_owned_objects() {
        let env = Environment::with_run_id("run-i");
        let (_cluster, d) = driver(&env);
        d.apply(&config_map("x", &env)).await.unwrap();

        let mut bare = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} });
        hydrate::inject_metadata(&mut bare, &env);
        assert!(d.select_owned(&bare).await.unwrap().is_none());

        let mut generated = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "generateName": "job-", "labels": { "app": "child" } }
        });
        hydrate::inject_metadata(&mut generated, &env);
        assert!(d.select_owned(&generated).await.unwrap().is_none());
        d.done();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_waits_for_deliveries_in_flight() {
        use std::sync::atomic::AtomicUsize;

        let env = Environment::with_run_id("run-h");
        let (_cluster, d) = driver(&env);
        let cancelled = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = {
            let (cancelled, late, calls) = (cancelled.clone(), late.clone(), calls.clone());
            d.watch(Arc::new(move |_: &ObjectEvent| {
                if cancelled.load(Ordering::SeqCst) {
                    late.store(true, Ordering::SeqCst);
                }
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
                if cancelled.load(Ordering::SeqCst) {
                    late.store(true, Ordering::SeqCst);
                }
            }))
        };

        let stop = Arc::new(AtomicBool::new(false));
        let publishers: Vec<_> = (0..3)
            .map(|_| {
                let (shared, stop) = (d.shared.clone(), stop.clone());
                tokio::task::spawn_blocking(move || {
                    let ev = ObjectEvent {
                        kind: EventKind::Updated,
                        resource: "configmaps".into(),
                        object: json!({ "metadata": { "name": "cm", "namespace": "default" } }),
                    };
                    while !stop.load(Ordering::SeqCst) {
                        shared.publish(&ev);
                        std::thread::sleep(Duration::from_micros(200));
                    }
                })
            })
            .collect();

        while calls.load(Ordering::SeqCst) < 20 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        sub.cancel();
        cancelled.store(true, Ordering::SeqCst);
        let delivered = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(true, Ordering::SeqCst);
        for p in publishers {
            p.await.unwrap();
        }
        assert!(!late.load(Ordering::SeqCst), "handler ran after cancel returned");
        assert_eq!(calls.load(Ordering::SeqCst), delivered);
        d.done();
    }

    #[tokio::test]
    async fn done_is_final() {
        let env = Environment::with_run_id("run-g");
        let (_cluster, d) = driver(&env);
        d.done();
        d.done();
        assert!(matches!(d.apply(&config_map("x", &env)).await, Err(DriverError::Done)));
    }

    #[test]
    fn default_checks_compile() {
        for op in [Operation::Update, Operation::Delete] {
            let f = default_check(op).unwrap();
            assert_eq!(f.module().unwrap().rules(), ["error"]);
        }
    }
}
