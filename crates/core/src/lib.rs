//! Kest core types shared by every component of the harness.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use uuid::Uuid;

/// Label marking an object as managed by the test harness.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Annotation carrying the unique id of the run that applied an object.
pub const ANNOTATION_RUN_ID: &str = "kest/run-id";
/// Annotation carrying the harness version that applied an object.
pub const ANNOTATION_VERSION: &str = "kest/version";
/// Value of [`LABEL_MANAGED_BY`] for objects this harness creates.
pub const MANAGER_NAME: &str = "kest";
/// Namespace assumed for namespaced objects that do not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

pub mod prelude {
    pub use super::{merge_json, CheckResult, Environment, ObjectExt, ObjectReference, Severity};
}

/// How serious a recorded result is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Severity {
    #[default]
    None,
    Warn,
    Error,
    Fatal,
    Skip,
}

impl Severity {
    /// True if a result of this severity fails the test.
    pub fn is_failure(self) -> bool {
        matches!(self, Severity::Error | Severity::Fatal)
    }

    /// True if a result of this severity ends the current document.
    pub fn is_terminal(self) -> bool {
        matches!(self, Severity::Fatal | Severity::Skip)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::None => "None",
            Severity::Warn => "Warn",
            Severity::Error => "Error",
            Severity::Fatal => "Fatal",
            Severity::Skip => "Skip",
        };
        f.write_str(s)
    }
}

/// A single finding produced by evaluating a check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckResult {
    pub severity: Severity,
    /// Name of the rule that produced the finding.
    pub rule: String,
    /// Message extracted from the rule value; empty for boolean rules.
    pub message: String,
}

impl CheckResult {
    /// The message, or a description of the rule when it carried none.
    pub fn describe(&self) -> String {
        if self.message.is_empty() {
            format!("rule {:?} matched", self.rule)
        } else {
            self.message.clone()
        }
    }
}

/// Per-invocation context shared by the runner, hydrator and object driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    run_id: String,
    manager: String,
}

impl Environment {
    pub fn new() -> Self {
        Self { run_id: Uuid::new_v4().to_string(), manager: MANAGER_NAME.to_string() }
    }

    /// Environment with a fixed run id (tests, replays).
    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), manager: MANAGER_NAME.to_string() }
    }

    pub fn run_id(&self) -> &str { &self.run_id }
    pub fn manager(&self) -> &str { &self.manager }

    /// True if the object carries this run's id annotation.
    pub fn owns(&self, obj: &Json) -> bool {
        obj.annotation(ANNOTATION_RUN_ID) == Some(self.run_id.as_str())
    }
}

impl Default for Environment {
    fn default() -> Self { Self::new() }
}

/// Reference uniquely naming an object in the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub name: String,
    pub namespace: String,
    pub meta: KindMeta,
}

/// Group/version/kind, lowercased field names so policies can address them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KindMeta {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ObjectReference {
    pub fn from_object(obj: &Json) -> Self {
        let (group, version) = obj.group_version();
        Self {
            name: obj.name().unwrap_or_default().to_string(),
            namespace: obj.namespace().unwrap_or_default().to_string(),
            meta: KindMeta { group, version, kind: obj.kind().unwrap_or_default().to_string() },
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.meta.kind.to_lowercase();
        if self.namespace.is_empty() {
            write!(f, "{}/{}", kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.namespace, kind, self.name)
        }
    }
}

/// Accessors for the conventional Kubernetes fields of an unstructured object.
pub trait ObjectExt {
    fn api_version(&self) -> Option<&str>;
    fn kind(&self) -> Option<&str>;
    fn name(&self) -> Option<&str>;
    fn generate_name(&self) -> Option<&str>;
    fn namespace(&self) -> Option<&str>;
    fn uid(&self) -> Option<&str>;
    fn label(&self, key: &str) -> Option<&str>;
    fn annotation(&self, key: &str) -> Option<&str>;
    fn labels(&self) -> Vec<(String, String)>;

    /// `(group, version)` split out of `apiVersion`; the core group is empty.
    fn group_version(&self) -> (String, String);

    /// Namespace, or `"default"` when the object names none.
    fn namespace_or_default(&self) -> &str {
        match self.namespace() {
            Some(ns) if !ns.is_empty() => ns,
            _ => DEFAULT_NAMESPACE,
        }
    }

    /// Monotonic revision used to order observations of the same object.
    /// `metadata.resourceVersion` when numeric, otherwise `metadata.generation`.
    ///
    /// `generation` only moves when `.spec` changes, so status and
    /// metadata updates would never pass a generation gate and the pool
    /// would keep a stale snapshot. The resource version moves on every
    /// write. It is opaque by contract but numeric on etcd-backed servers
    /// and in the in-memory cluster. Generation remains the fallback for
    /// objects whose resource version does not parse.
    fn revision(&self) -> Option<u64>;

    /// `metadata`, created as an empty map if missing.
    fn metadata_mut(&mut self) -> Option<&mut Map<String, Json>>;
    fn set_name(&mut self, name: &str);
    fn set_namespace(&mut self, namespace: &str);
}

fn meta_str<'a>(v: &'a Json, key: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

fn meta_map_str<'a>(v: &'a Json, map: &str, key: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(map)).and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

impl ObjectExt for Json {
    fn api_version(&self) -> Option<&str> { self.get("apiVersion").and_then(|v| v.as_str()) }
    fn kind(&self) -> Option<&str> { self.get("kind").and_then(|v| v.as_str()) }
    fn name(&self) -> Option<&str> { meta_str(self, "name") }
    fn generate_name(&self) -> Option<&str> { meta_str(self, "generateName") }
    fn namespace(&self) -> Option<&str> { meta_str(self, "namespace") }
    fn uid(&self) -> Option<&str> { meta_str(self, "uid") }
    fn label(&self, key: &str) -> Option<&str> { meta_map_str(self, "labels", key) }
    fn annotation(&self, key: &str) -> Option<&str> { meta_map_str(self, "annotations", key) }

    fn labels(&self) -> Vec<(String, String)> {
        self.get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|l| {
                l.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn group_version(&self) -> (String, String) {
        let av = self.api_version().unwrap_or_default();
        match av.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), av.to_string()),
        }
    }

    fn revision(&self) -> Option<u64> {
        let meta = self.get("metadata")?;
        meta.get("resourceVersion")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| meta.get("generation").and_then(|g| g.as_u64()))
    }

    fn metadata_mut(&mut self) -> Option<&mut Map<String, Json>> {
        self.as_object_mut()?
            .entry("metadata")
            .or_insert_with(|| Json::Object(Map::new()))
            .as_object_mut()
    }

    fn set_name(&mut self, name: &str) {
        if let Some(meta) = self.metadata_mut() {
            meta.insert("name".into(), Json::String(name.to_string()));
        }
    }

    fn set_namespace(&mut self, namespace: &str) {
        if let Some(meta) = self.metadata_mut() {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
        }
    }
}

/// Merges `overlay` into `base` with JSON merge-patch rules: objects merge
/// key by key, `null` removes a key, anything else replaces.
pub fn merge_json(base: &mut Json, overlay: &Json) {
    let Json::Object(patch) = overlay else {
        *base = overlay.clone();
        return;
    };
    if !base.is_object() {
        *base = Json::Object(Map::new());
    }
    if let Json::Object(target) = base {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge_json(target.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}
