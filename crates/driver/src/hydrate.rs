//! Turning raw object fragments into [`Object`]s ready to apply.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::warn;

use kest_core::{merge_json, Environment, ObjectExt, ANNOTATION_RUN_ID, ANNOTATION_VERSION, LABEL_MANAGED_BY};
use kest_doc::{Fragment, FragmentError};

use crate::fixture::FixtureSet;

/// Top-level keys starting with this are instructions to the harness.
pub const PSEUDO_FIELD_SIGIL: char = '$';
pub const APPLY_FIELD: &str = "$apply";
pub const CHECK_FIELD: &str = "$check";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation {other:?}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HydrateError {
    #[error("object fragment does not decode: {0}")]
    Decode(String),
    #[error("object fragment is not a mapping")]
    NotAMapping,
    #[error("$check must be a string holding a policy module")]
    CheckNotText,
    #[error("$check: {0}")]
    Check(#[source] FragmentError),
}

/// A hydrated object fragment.
#[derive(Debug, Clone)]
pub struct Object {
    pub target: Json,
    pub check: Option<Fragment>,
    pub operation: Operation,
}

/// Builds [`Object`]s for one run.
#[derive(Debug, Clone)]
pub struct Hydrator {
    env: Environment,
    fixtures: Arc<FixtureSet>,
}

impl Hydrator {
    pub fn new(env: Environment, fixtures: Arc<FixtureSet>) -> Self {
        Self { env, fixtures }
    }

    pub fn environment(&self) -> &Environment { &self.env }

    pub fn hydrate(&self, bytes: &[u8]) -> Result<Object, HydrateError> {
        let yaml: serde_yaml::Value = serde_yaml::from_slice(bytes).map_err(|e| HydrateError::Decode(e.to_string()))?;
        let mut target = serde_json::to_value(yaml).map_err(|e| HydrateError::Decode(e.to_string()))?;
        if !target.is_object() {
            return Err(HydrateError::NotAMapping);
        }

        let ops = strip_pseudo_fields(&mut target);

        if let Some(fixture) = self.fixtures.matching(&target) {
            let mut base = fixture.clone();
            merge_json(&mut base, &target);
            target = base;
        }

        inject_metadata(&mut target, &self.env);

        let mut operation = Operation::Update;
        let mut check = None;
        for (key, value) in &ops {
            match key.as_str() {
                APPLY_FIELD => {
                    operation = match value.as_str().map(str::parse::<Operation>) {
                        Some(Ok(op)) => op,
                        Some(Err(e)) => {
                            warn!(field = APPLY_FIELD, error = %e, "defaulting to update");
                            Operation::Update
                        }
                        None => {
                            warn!(field = APPLY_FIELD, value = %value, "not a string, defaulting to update");
                            Operation::Update
                        }
                    }
                }
                CHECK_FIELD => {
                    let text = value.as_str().ok_or(HydrateError::CheckNotText)?;
                    check = Some(Fragment::policy(text).map_err(HydrateError::Check)?);
                }
                other => warn!(field = other, "ignoring unknown pseudo-field"),
            }
        }

        Ok(Object { target, check, operation })
    }
}

/// Removes every top-level pseudo-field and returns them by key.
pub fn strip_pseudo_fields(obj: &mut Json) -> BTreeMap<String, Json> {
    let mut ops = BTreeMap::new();
    if let Some(m) = obj.as_object_mut() {
        let keys: Vec<String> = m.keys().filter(|k| k.starts_with(PSEUDO_FIELD_SIGIL)).cloned().collect();
        for k in keys {
            if let Some(v) = m.remove(&k) {
                ops.insert(k, v);
            }
        }
    }
    ops
}

fn map_at<'a>(v: &'a mut Json, path: &[&str], create: bool) -> Option<&'a mut Map<String, Json>> {
    let mut node = v;
    for seg in path {
        let m = node.as_object_mut()?;
        node = if create {
            m.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()))
        } else {
            m.get_mut(*seg)?
        };
    }
    node.as_object_mut()
}

fn set(map: Option<&mut Map<String, Json>>, key: &str, value: &str) {
    if let Some(m) = map {
        m.insert(key.to_string(), Json::String(value.to_string()));
    }
}

/// Marks `obj` as owned by this run. Workloads with a pod template get the
/// marks on the template as well so their pods can be traced back.
pub fn inject_metadata(obj: &mut Json, env: &Environment) {
    set(map_at(obj, &["metadata", "labels"], true), LABEL_MANAGED_BY, env.manager());
    set(map_at(obj, &["spec", "template", "metadata", "labels"], false), LABEL_MANAGED_BY, env.manager());

    set(map_at(obj, &["metadata", "annotations"], true), ANNOTATION_RUN_ID, env.run_id());
    set(map_at(obj, &["metadata", "annotations"], true), ANNOTATION_VERSION, env!("CARGO_PKG_VERSION"));

    let has_containers = obj.pointer("/spec/template/spec/containers").is_some();
    if has_containers {
        set(map_at(obj, &["spec", "template", "metadata", "annotations"], true), ANNOTATION_RUN_ID, env.run_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hydrator() -> Hydrator {
        Hydrator::new(Environment::with_run_id("run-1"), Arc::new(FixtureSet::new()))
    }

    #[test]
    fn strips_pseudo_fields_and_injects_ownership() {
        let obj = hydrator()
            .hydrate(
                b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n$apply: Delete\n$check: |\n  error[m] { m := \"x\" }\n",
            )
            .unwrap();
        assert_eq!(obj.operation, Operation::Delete);
        assert!(obj.target.get("$apply").is_none() && obj.target.get("$check").is_none());
        assert_eq!(obj.target.label(LABEL_MANAGED_BY), Some("kest"));
        assert_eq!(obj.target.annotation(ANNOTATION_RUN_ID), Some("run-1"));
        assert_eq!(obj.check.as_ref().and_then(|c| c.module()).unwrap().rules(), ["error"]);
        assert_eq!(obj.target.namespace(), None);
    }

    #[test]
    fn pod_templates_are_marked() {
        let obj = hydrator()
            .hydrate(
                b"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  template:\n    metadata:\n      labels:\n        app: web\n    spec:\n      containers:\n      - name: c\n        image: nginx\n",
            )
            .unwrap();
        let tmpl = &obj.target["spec"]["template"]["metadata"];
        assert_eq!(tmpl["labels"][LABEL_MANAGED_BY], "kest");
        assert_eq!(tmpl["labels"]["app"], "web");
        assert_eq!(tmpl["annotations"][ANNOTATION_RUN_ID], "run-1");
    }

    #[test]
    fn templates_without_containers_only_get_existing_labels() {
        let mut obj = json!({ "spec": { "template": { "metadata": {} } } });
        inject_metadata(&mut obj, &Environment::with_run_id("r"));
        assert_eq!(obj["spec"]["template"]["metadata"], json!({}));
    }

    #[test]
    fn unknown_apply_values_default_to_update() {
        let obj = hydrator().hydrate(b"apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n$apply: replace\n").unwrap();
        assert_eq!(obj.operation, Operation::Update);
    }

    #[test]
    fn broken_checks_fail_hydration() {
        let err = hydrator()
            .hydrate(b"apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n$check: \"error[m] { m := }\"\n")
            .unwrap_err();
        assert!(matches!(err, HydrateError::Check(_)));
        let err = hydrator().hydrate(b"apiVersion: v1\nkind: Pod\n$check: [1]\n").unwrap_err();
        assert!(matches!(err, HydrateError::CheckNotText));
        assert!(matches!(hydrator().hydrate(b"- a\n- b\n").unwrap_err(), HydrateError::NotAMapping));
    }

    #[test]
    fn fragments_extend_matching_fixtures() {
        let mut fixtures = FixtureSet::new();
        fixtures.insert(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "cm", "labels": { "tier": "base" } },
            "data": { "a": "1", "b": "2" }
        }));
        let h = Hydrator::new(Environment::with_run_id("r"), Arc::new(fixtures));
        let obj = h.hydrate(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\ndata:\n  b: \"3\"\n").unwrap();
        assert_eq!(obj.target["data"], json!({ "a": "1", "b": "3" }));
        assert_eq!(obj.target.label("tier"), Some("base"));
        assert_eq!(obj.target.label(LABEL_MANAGED_BY), Some("kest"));
    }
}
