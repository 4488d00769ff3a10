//! Kest runner.
//!
//! Executes test documents fragment by fragment. Each fragment runs in its
//! own recorder step; once a step records a Fatal or Skip the remaining
//! steps of the document are marked and skipped. Objects applied during a
//! document are cleaned up when it ends unless the run preserves them.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use kest_check::{run_check, CheckDriver, DataStore, Polling};
use kest_core::{Environment, ObjectExt, ObjectReference, Severity, DEFAULT_NAMESPACE};
use kest_doc::{Document, Fragment, FragmentType, PolicyModule};
use kest_driver::hydrate::{inject_metadata, APPLY_FIELD};
use kest_driver::{
    default_check, namespace_object, ClusterObjectDriver, DriverError, EventKind, FixtureSet, Hydrator, ObjectDriver,
    ObjectEvent, OperationResult, Operation,
};
use kest_kubehub::ClusterClient;
use kest_recorder::{Recorder, StackRecorder, StateRecorder, TapWriter, TreeWriter};

/// Store path of the most recent apply result.
pub const LAST_APPLIED_PATH: &str = "/resources/applied/last";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Tree,
    Tap,
}

impl OutputFormat {
    /// A recorder rendering this format to stdout.
    pub fn stdout(self) -> Box<dyn Recorder> {
        match self {
            OutputFormat::Tree => Box::new(TreeWriter::stdout()),
            OutputFormat::Tap => Box::new(TapWriter::stdout()),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Tree => "tree",
            OutputFormat::Tap => "tap",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tree" => Ok(OutputFormat::Tree),
            "tap" => Ok(OutputFormat::Tap),
            other => Err(format!("unknown output format {other:?} (expected tree or tap)")),
        }
    }
}

/// Options for one `kest run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Keep adopted objects when a document ends.
    pub preserve: bool,
    /// Run against the in-memory cluster.
    pub dry_run: bool,
    pub check_timeout: Duration,
    pub check_interval: Duration,
    pub format: OutputFormat,
    pub trace_rego: bool,
    /// Documents whose object fragments become the run's fixtures.
    pub fixtures: Vec<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        let polling = Polling::default();
        Self {
            preserve: false,
            dry_run: false,
            check_timeout: polling.timeout,
            check_interval: polling.interval,
            format: OutputFormat::default(),
            trace_rego: false,
            fixtures: Vec::new(),
        }
    }
}

impl RunOptions {
    pub fn polling(&self) -> Polling {
        Polling { timeout: self.check_timeout, interval: self.check_interval }
    }

    /// Loads every fixture document named in the options.
    pub fn load_fixtures(&self) -> anyhow::Result<FixtureSet> {
        let mut set = FixtureSet::new();
        for path in &self.fixtures {
            let n = set.add_file(path).with_context(|| format!("loading fixtures from {}", path.display()))?;
            info!(path = %path.display(), fixtures = n, "fixtures loaded");
        }
        Ok(set)
    }
}

/// Builds a fresh object driver for each document.
pub type DriverFactory = Arc<dyn Fn() -> Arc<dyn ObjectDriver> + Send + Sync>;

/// Driver factory producing [`ClusterObjectDriver`]s over `client`.
pub fn cluster_drivers(client: Arc<dyn ClusterClient>, env: Environment) -> DriverFactory {
    Arc::new(move || Arc::new(ClusterObjectDriver::new(client.clone(), env.clone())) as Arc<dyn ObjectDriver>)
}

pub struct Runner {
    options: RunOptions,
    hydrator: Hydrator,
    drivers: DriverFactory,
    state: Arc<StateRecorder>,
    recorder: StackRecorder,
}

impl Runner {
    /// `output` renders results; the runner keeps its own state recorder
    /// underneath it.
    pub fn new(
        options: RunOptions,
        env: Environment,
        fixtures: Arc<FixtureSet>,
        drivers: DriverFactory,
        output: Box<dyn Recorder>,
    ) -> Self {
        let state = Arc::new(StateRecorder::new());
        let recorder = StackRecorder::new(Box::new(state.clone()), output);
        Self { options, hydrator: Hydrator::new(env, fixtures), drivers, state, recorder }
    }

    pub fn options(&self) -> &RunOptions { &self.options }
    pub fn environment(&self) -> &Environment { self.hydrator.environment() }
    pub fn state(&self) -> &StateRecorder { &self.state }

    pub fn failed(&self) -> bool { self.recorder.failed() }

    /// Runs every document in order and returns whether any failed.
    pub async fn run(&self, documents: &[Document]) -> bool {
        for doc in documents {
            self.run_document(doc).await;
        }
        self.failed()
    }

    pub async fn run_document(&self, doc: &Document) {
        let rec: &dyn Recorder = &self.recorder;
        let scope = kest_recorder::document(rec, &doc.name);
        info!(document = %doc.name, run_id = self.environment().run_id(), fragments = doc.parts.len(), "running document");
        counter!("documents_run", 1u64);

        self.decode(doc);

        let driver = (self.drivers)();
        let checks = CheckDriver::new(Arc::new(DataStore::new())).with_trace(self.options.trace_rego);
        let store = checks.store().clone();
        let subscription = driver.watch(Arc::new(move |ev: &ObjectEvent| record_event(&store, ev)));

        for part in &doc.parts {
            let description = describe(part);
            self.step(&description, self.run_fragment(driver.as_ref(), &checks, part)).await;
        }

        if self.options.preserve {
            info!(document = %doc.name, adopted = driver.adopted().len(), "preserving objects");
        } else {
            self.cleanup(driver.as_ref()).await;
        }

        subscription.cancel();
        driver.done();
        scope.close();
    }

    /// Classifies every fragment up front so a malformed check halts the
    /// document before anything is applied.
    fn decode(&self, doc: &Document) {
        let invalid: Vec<_> = doc
            .parts
            .iter()
            .filter_map(|p| p.classify().err().map(|e| (p.location(), e)))
            .collect();
        if invalid.is_empty() {
            return;
        }
        let rec: &dyn Recorder = &self.recorder;
        let _step = kest_recorder::step(rec, "decode");
        for (location, e) in invalid {
            rec.error(Severity::Fatal, &format!("{location}: {e}"));
        }
    }

    /// Runs `body` inside a step unless the document has already halted.
    async fn step(&self, description: &str, body: impl Future<Output = ()>) {
        let rec: &dyn Recorder = &self.recorder;
        let _step = kest_recorder::step(rec, description);
        if rec.should_continue() {
            body.await;
            return;
        }
        match self.state.halted_by() {
            Some(Severity::Skip) => rec.error(Severity::Skip, "skipping"),
            _ => rec.error(Severity::Error, "skipping"),
        }
    }

    async fn run_fragment(&self, driver: &dyn ObjectDriver, checks: &CheckDriver, part: &Fragment) {
        match part.fragment_type() {
            FragmentType::Object => self.run_object(driver, checks, part).await,
            FragmentType::Policy => {
                if let Some(module) = part.module() {
                    debug!(location = %part.location(), "running policy fragment");
                    self.check(checks, module, None, self.options.polling()).await;
                }
            }
            FragmentType::Unknown => self.recorder.message("ignoring fragment that is neither an object nor a policy"),
            FragmentType::Invalid => {}
        }
    }

    async fn run_object(&self, driver: &dyn ObjectDriver, checks: &CheckDriver, part: &Fragment) {
        let rec: &dyn Recorder = &self.recorder;
        let obj = match self.hydrator.hydrate(part.bytes()) {
            Ok(o) => o,
            Err(e) => return rec.error(Severity::Fatal, &format!("failed to hydrate object: {e}")),
        };
        let mut target = obj.target;

        if target.name().map_or(true, str::is_empty) {
            match driver.select_owned(&target).await {
                Ok(Some(live)) => {
                    let name = live.name().unwrap_or_default().to_string();
                    rec.message(&format!("matched {}", ObjectReference::from_object(&live)));
                    target.set_name(&name);
                }
                Ok(None) => debug!(kind = target.kind().unwrap_or_default(), "no owned object matches"),
                Err(e) => return rec.error(Severity::Fatal, &format!("failed to match unnamed object: {e}")),
            }
        }

        let outcome = match obj.operation {
            Operation::Update => self.apply(driver, &target).await,
            Operation::Delete => driver.delete(&target).await,
        };
        let result = match outcome {
            Ok(r) => r,
            Err(e) => {
                let reference = ObjectReference::from_object(&target);
                return rec.error(Severity::Fatal, &format!("unable to {} {reference}: {e}", obj.operation));
            }
        };

        if let Some(latest) = &result.latest {
            if let Err(e) = checks.store_item(LAST_APPLIED_PATH, latest) {
                return rec.error(Severity::Fatal, &format!("failed to store {LAST_APPLIED_PATH}: {e}"));
            }
        }

        let input = match operation_input(&result) {
            Ok(v) => v,
            Err(e) => return rec.error(Severity::Fatal, &format!("failed to encode operation result: {e}")),
        };

        // Built-in checks only look at the operation result, so one
        // evaluation settles them.
        let (check, polling) = match obj.check {
            Some(check) => (check, self.options.polling()),
            None => match default_check(obj.operation) {
                Ok(check) => (check, Polling { timeout: Duration::ZERO, ..self.options.polling() }),
                Err(e) => return rec.error(Severity::Fatal, &format!("built-in {} check: {e}", obj.operation)),
            },
        };
        if let Some(module) = check.module() {
            self.check(checks, module, Some(&input), polling).await;
        }
    }

    /// Applies `obj`, first creating its namespace if that does not exist.
    async fn apply(&self, driver: &dyn ObjectDriver, obj: &Json) -> Result<OperationResult, DriverError> {
        if let Some(ns) = obj.namespace().filter(|ns| !ns.is_empty()) {
            if !driver.namespace_exists(ns).await? {
                info!(namespace = ns, "creating implicit namespace");
                let mut namespace = namespace_object(ns);
                inject_metadata(&mut namespace, self.environment());
                let result = driver.apply(&namespace).await?;
                if !result.succeeded() {
                    return Ok(result);
                }
            }
        }
        driver.apply(obj).await
    }

    async fn check(&self, checks: &CheckDriver, module: &PolicyModule, input: Option<&Json>, polling: Polling) {
        let rec: &dyn Recorder = &self.recorder;
        match run_check(checks, module, input, polling).await {
            Ok(results) => {
                for r in results {
                    rec.error(r.severity, &r.describe());
                }
            }
            Err(e) => rec.error(Severity::Fatal, &format!("check failed to evaluate: {e}")),
        }
    }

    async fn cleanup(&self, driver: &dyn ObjectDriver) {
        let rec: &dyn Recorder = &self.recorder;
        match driver.delete_all().await {
            Ok(cleanup) => {
                for (key, e) in cleanup.failed {
                    rec.message(&format!("failed to delete {}/{}/{}: {e}", key.resource, key.namespace, key.name));
                }
            }
            Err(e) => {
                warn!(error = %e, "cleanup skipped");
                rec.message(&format!("cleanup skipped: {e}"));
            }
        }
    }
}

fn operation_input(result: &OperationResult) -> Result<Json, serde_json::Error> {
    serde_json::to_value(result)
}

/// Step description for a fragment, from what can be read before hydration.
fn describe(part: &Fragment) -> String {
    let location = part.location();
    match (part.fragment_type(), part.object()) {
        (FragmentType::Object, Some(obj)) => {
            let op = obj
                .get(APPLY_FIELD)
                .and_then(Json::as_str)
                .and_then(|s| s.parse::<Operation>().ok())
                .unwrap_or_default();
            let kind = obj.kind().unwrap_or_default();
            match obj.name().filter(|n| !n.is_empty()) {
                Some(name) => format!("{op} {kind} {name} ({location})"),
                None => format!("{op} {kind} ({location})"),
            }
        }
        (FragmentType::Policy, _) => format!("check ({location})"),
        _ => format!("fragment ({location})"),
    }
}

/// Where a watched object lives in the check data store.
pub fn resource_path(resource: &str, obj: &Json) -> Option<String> {
    let name = obj.name().filter(|n| !n.is_empty())?;
    Some(match obj.namespace() {
        None | Some("") | Some(DEFAULT_NAMESPACE) => format!("/resources/{resource}/{name}"),
        Some(ns) => format!("/resources/{ns}/{resource}/{name}"),
    })
}

/// Mirrors a watch event into the store. Runs on an informer task with no
/// caller to report to, so a failed write aborts the process.
fn record_event(store: &DataStore, ev: &ObjectEvent) {
    let Some(path) = resource_path(&ev.resource, &ev.object) else {
        return;
    };
    let outcome = match ev.kind {
        EventKind::Added | EventKind::Updated => store.store_item(&path, &ev.object),
        EventKind::Deleted => match store.remove_path(&path) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        },
    };
    if let Err(e) = outcome {
        error!(path = %path, error = %e, "failed to record watched object");
        std::process::abort();
    }
}
