//! Fixtures: reusable object bodies that test fragments extend.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

use kest_core::ObjectExt;
use kest_doc::{Document, DocError, FragmentError, FragmentType};

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error("{document}: fragment {index} at {location}: {source}")]
    Fragment {
        document: String,
        index: usize,
        location: kest_doc::Location,
        #[source]
        source: FragmentError,
    },
}

/// Identity a fragment must share with a fixture to extend it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FixtureKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl FixtureKey {
    pub fn for_object(obj: &Json) -> Self {
        Self {
            api_version: obj.api_version().unwrap_or_default().to_string(),
            kind: obj.kind().unwrap_or_default().to_string(),
            namespace: obj.namespace().unwrap_or_default().to_string(),
            name: obj.name().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixtureSet {
    fixtures: FxHashMap<FixtureKey, Json>,
}

impl FixtureSet {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.fixtures.len() }
    pub fn is_empty(&self) -> bool { self.fixtures.is_empty() }

    /// Adds or replaces the fixture keyed by `obj`'s identity.
    pub fn insert(&mut self, mut obj: Json) {
        if let Some(m) = obj.as_object_mut() {
            m.retain(|k, _| !k.starts_with('$'));
        }
        self.fixtures.insert(FixtureKey::for_object(&obj), obj);
    }

    pub fn matching(&self, obj: &Json) -> Option<&Json> {
        self.fixtures.get(&FixtureKey::for_object(obj))
    }

    /// Adds every object fragment of `doc`. Policy and unknown fragments
    /// are skipped; invalid fragments fail the load.
    pub fn add_document(&mut self, doc: &Document) -> Result<usize, FixtureError> {
        let mut added = 0;
        for (index, part) in doc.parts.iter().enumerate() {
            let kind = part.classify().map_err(|source| FixtureError::Fragment {
                document: doc.name.clone(),
                index: index + 1,
                location: part.location(),
                source,
            })?;
            if kind != FragmentType::Object {
                continue;
            }
            if let Some(obj) = part.object() {
                self.insert(obj.clone());
                added += 1;
            }
        }
        debug!(document = %doc.name, fixtures = added, "fixtures loaded");
        Ok(added)
    }

    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<usize, FixtureError> {
        let doc = kest_doc::read_file(path)?;
        self.add_document(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn loads_object_fragments_only() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: base\ndata:\n  a: \"1\"\n---\nerror[m] {{ m := \"x\" }}\n---\njust text\n"
        )
        .unwrap();

        let mut set = FixtureSet::new();
        assert_eq!(set.add_file(f.path()).unwrap(), 1);
        let lookup = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "base" } });
        assert_eq!(set.matching(&lookup).unwrap()["data"]["a"], "1");

        let other = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "base", "namespace": "x" } });
        assert!(set.matching(&other).is_none());
    }

    #[test]
    fn invalid_fragments_fail_the_load() {
        let doc = kest_doc::read_document("bad", "error[m] { m := }\n".as_bytes()).unwrap();
        let err = FixtureSet::new().add_document(&doc).unwrap_err();
        assert!(matches!(err, FixtureError::Fragment { index: 1, .. }));
    }

    #[test]
    fn pseudo_fields_are_not_part_of_fixtures() {
        let mut set = FixtureSet::new();
        set.insert(json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "s" }, "$apply": "delete" }));
        let lookup = json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "s" } });
        assert!(set.matching(&lookup).unwrap().get("$apply").is_none());
    }
}
