//! Kest check evaluator.
//!
//! Checks are Rego modules. Rules whose names follow the severity naming
//! convention (`warn`, `error`, `fatal`, `skip`, optionally with a `_suffix`)
//! are queried against a hierarchical data document that holds the cluster
//! state observed so far. A check passes when none of those rules produce a
//! value.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use kest_core::{CheckResult, Severity};
use kest_doc::PolicyModule;
use metrics::counter;
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store path {0:?}")]
    InvalidPath(String),
    #[error("store path {0:?} not found")]
    NotFound(String),
    #[error("store path {0:?} traverses a non-object value")]
    NotAnObject(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("evaluating rule {rule:?}: {message}")]
    Eval { rule: String, message: String },
    #[error("loading check module: {0}")]
    Load(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn parse_path(path: &str) -> Result<Vec<&str>, StoreError> {
    let rest = path.strip_prefix('/').ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let segs: Vec<&str> = rest.split('/').collect();
    if segs.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

/// Walks to the object holding the last path segment.
fn parent_mut<'a>(root: &'a mut Json, segs: &[&str], path: &str) -> Result<&'a mut Map<String, Json>, StoreError> {
    let mut node = root;
    for seg in &segs[..segs.len().saturating_sub(1)] {
        node = node
            .as_object_mut()
            .ok_or_else(|| StoreError::NotAnObject(path.to_string()))?
            .get_mut(*seg)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
    }
    node.as_object_mut().ok_or_else(|| StoreError::NotAnObject(path.to_string()))
}

/// Path-addressed JSON document with transactional writes.
///
/// Each write runs against a private copy of the document which is either
/// published as a whole (commit) or dropped (abort), so readers never see
/// a partial update.
pub struct DataStore {
    root: ArcSwap<Json>,
    writer: Mutex<()>,
}

impl Default for DataStore {
    fn default() -> Self { Self::new() }
}

impl DataStore {
    pub fn new() -> Self {
        Self { root: ArcSwap::from_pointee(Json::Object(Map::new())), writer: Mutex::new(()) }
    }

    /// Consistent view of the whole document.
    pub fn snapshot(&self) -> Arc<Json> { self.root.load_full() }

    pub fn read(&self, path: &str) -> Result<Json, StoreError> {
        let segs = parse_path(path)?;
        let snap = self.snapshot();
        let mut node: &Json = &snap;
        for seg in segs {
            node = node.get(seg).ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        }
        Ok(node.clone())
    }

    fn transaction<T>(&self, f: impl FnOnce(&mut Json) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut working = (*self.root.load_full()).clone();
        let out = f(&mut working)?;
        self.root.store(Arc::new(working));
        Ok(out)
    }

    fn write(&self, path: &str, value: &Json) -> Result<(), StoreError> {
        let segs = parse_path(path)?;
        self.transaction(|root| {
            let Some(last) = segs.last() else {
                if !value.is_object() {
                    return Err(StoreError::NotAnObject(path.to_string()));
                }
                *root = value.clone();
                return Ok(());
            };
            parent_mut(root, &segs, path)?.insert((*last).to_string(), value.clone());
            Ok(())
        })
    }

    /// Creates or replaces the value at `path`. Missing intermediate
    /// objects are created and the write retried.
    pub fn store_item(&self, path: &str, value: &Json) -> Result<(), StoreError> {
        match self.write(path, value) {
            Err(e) if e.is_not_found() => {
                self.store_path(path)?;
                self.write(path, value)
            }
            other => other,
        }
    }

    /// Creates every missing object along `path`. Existing values are left alone.
    pub fn store_path(&self, path: &str) -> Result<(), StoreError> {
        let segs = parse_path(path)?;
        self.transaction(|root| {
            let mut node = root;
            for seg in &segs {
                node = node
                    .as_object_mut()
                    .ok_or_else(|| StoreError::NotAnObject(path.to_string()))?
                    .entry(seg.to_string())
                    .or_insert_with(|| Json::Object(Map::new()));
            }
            Ok(())
        })
    }

    /// Removes the value at `path`; [`StoreError::NotFound`] if there is none.
    pub fn remove_path(&self, path: &str) -> Result<(), StoreError> {
        let segs = parse_path(path)?;
        let Some(last) = segs.last() else {
            return Err(StoreError::InvalidPath(path.to_string()));
        };
        self.transaction(|root| {
            parent_mut(root, &segs, path)?
                .remove(*last)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(path.to_string()))
        })
    }
}

struct RuleClass {
    name: &'static str,
    prefix: &'static str,
    severity: Severity,
}

const RULE_CLASSES: &[RuleClass] = &[
    RuleClass { name: "warn", prefix: "warn_", severity: Severity::Warn },
    RuleClass { name: "error", prefix: "error_", severity: Severity::Error },
    RuleClass { name: "fatal", prefix: "fatal_", severity: Severity::Fatal },
    RuleClass { name: "skip", prefix: "skip_", severity: Severity::Skip },
];

/// Severity implied by a rule name, matched exactly or by prefix.
pub fn severity_for_rule(name: &str) -> Option<Severity> {
    RULE_CLASSES
        .iter()
        .find(|c| name == c.name || name.starts_with(c.prefix))
        .map(|c| c.severity)
}

/// The rules of a module that carry a severity, in source order.
pub fn assertion_rules(module: &PolicyModule) -> Vec<&str> {
    module
        .rules()
        .iter()
        .map(String::as_str)
        .filter(|r| severity_for_rule(r).is_some())
        .collect()
}

/// Pulls messages out of a rule value. Recognized shapes are `true`, a
/// string, or a list of strings and `{"msg": string}` objects. Anything
/// else yields no message and is logged.
pub fn result_messages(rule: &str, value: &Json) -> Vec<String> {
    match value {
        Json::Null | Json::Bool(false) => Vec::new(),
        Json::Bool(true) => vec![String::new()],
        Json::String(s) => vec![s.clone()],
        Json::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Json::String(s) => Some(s.clone()),
                Json::Object(m) => match m.get("msg") {
                    Some(Json::String(s)) => Some(s.clone()),
                    _ => {
                        warn!(rule, value = %item, "rule result object has no string msg field");
                        None
                    }
                },
                other => {
                    warn!(rule, value = %other, "unhandled rule result element");
                    None
                }
            })
            .collect(),
        other => {
            warn!(rule, value = %other, "unhandled rule result value");
            Vec::new()
        }
    }
}

fn to_rego(v: &Json) -> Result<regorus::Value, String> {
    regorus::Value::from_json_str(&v.to_string()).map_err(|e| format!("{e:#}"))
}

fn from_rego(v: &regorus::Value) -> Result<Json, String> {
    if *v == regorus::Value::Undefined {
        return Ok(Json::Null);
    }
    let s = v.to_json_str().map_err(|e| format!("{e:#}"))?;
    serde_json::from_str(&s).map_err(|e| e.to_string())
}

/// Evaluates check modules against a shared [`DataStore`].
#[derive(Clone)]
pub struct CheckDriver {
    store: Arc<DataStore>,
    trace: bool,
}

impl Default for CheckDriver {
    fn default() -> Self { Self::new(Arc::new(DataStore::new())) }
}

impl CheckDriver {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store, trace: false }
    }

    /// Logs every query with its input and raw value at debug level.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn store(&self) -> &Arc<DataStore> { &self.store }

    pub fn store_item(&self, path: &str, value: &Json) -> Result<(), StoreError> { self.store.store_item(path, value) }
    pub fn store_path(&self, path: &str) -> Result<(), StoreError> { self.store.store_path(path) }
    pub fn remove_path(&self, path: &str) -> Result<(), StoreError> { self.store.remove_path(path) }

    /// Queries every severity rule of `module` once and collects the findings.
    /// A rule that fails while evaluating, such as a builtin rejecting its
    /// argument, yields an Error finding carrying the failure and the other
    /// rules are still queried. Only loading the module, data or input is
    /// an `Err`.
    pub fn eval(&self, module: &PolicyModule, input: Option<&Json>) -> Result<Vec<CheckResult>, CheckError> {
        counter!("check_evals", 1u64);
        let rules = assertion_rules(module);
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let mut engine = regorus::Engine::new();
        engine.set_rego_v0(true);
        engine
            .add_policy(format!("{}.rego", module.package()), module.source().to_string())
            .map_err(|e| CheckError::Load(format!("{e:#}")))?;
        engine
            .add_data(to_rego(&self.store.snapshot()).map_err(CheckError::Load)?)
            .map_err(|e| CheckError::Load(format!("{e:#}")))?;
        if let Some(input) = input {
            engine.set_input(to_rego(input).map_err(CheckError::Load)?);
        }

        let mut out = Vec::new();
        for rule in rules {
            let Some(severity) = severity_for_rule(rule) else { continue };
            let query = format!("data.{}.{}", module.package(), rule);
            let results = match engine.eval_query(query.clone(), false) {
                Ok(results) => results,
                Err(e) => {
                    let message = format!("{e:#}");
                    debug!(query = %query, error = %message, "rule failed to evaluate");
                    out.push(CheckResult { severity: Severity::Error, rule: rule.to_string(), message });
                    continue;
                }
            };

            for result in results.result {
                for expr in result.expressions {
                    let value = from_rego(&expr.value)
                        .map_err(|message| CheckError::Eval { rule: rule.to_string(), message })?;
                    if self.trace {
                        debug!(query = %query, input = ?input, value = %value, "check query");
                    }
                    for message in result_messages(rule, &value) {
                        out.push(CheckResult { severity, rule: rule.to_string(), message });
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Poll settings for [`run_check`].
#[derive(Debug, Clone, Copy)]
pub struct Polling {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for Polling {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), interval: Duration::from_millis(500) }
    }
}

/// Evaluates `module` until it produces no findings or `polling.timeout`
/// elapses. Returns the findings of the last evaluation, which are empty
/// when the check passed. Evaluates at least once.
pub async fn run_check(
    driver: &CheckDriver,
    module: &PolicyModule,
    input: Option<&Json>,
    polling: Polling,
) -> Result<Vec<CheckResult>, CheckError> {
    let start = tokio::time::Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let results = driver.eval(module, input)?;
        if results.is_empty() {
            debug!(attempts, "check passed");
            return Ok(results);
        }
        if start.elapsed() >= polling.timeout {
            debug!(attempts, findings = results.len(), "check timed out");
            counter!("check_timeouts", 1u64);
            return Ok(results);
        }
        tokio::time::sleep(polling.interval).await;
    }
}
