//! Kest recorder: hierarchical test results.
//!
//! A run is a sequence of documents, each a sequence of steps. Messages and
//! errors land in the innermost open scope. Recorders can be stacked so one
//! keeps state while another renders output.
//!
//! Scope misuse (opening a document inside a step, recording an error with
//! no open step, closing what is not open) is a bug in the caller and panics.

#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Local, Timelike};
use serde::Serialize;
use tracing::{trace, warn};

use kest_core::Severity;

pub trait Recorder: Send + Sync {
    /// False once the open document has recorded a Fatal or Skip.
    fn should_continue(&self) -> bool;
    /// True if any document recorded an Error or Fatal.
    fn failed(&self) -> bool;

    fn open_document(&self, description: &str);
    fn close_document(&self);
    fn open_step(&self, description: &str);
    fn close_step(&self);

    fn message(&self, message: &str);
    fn error(&self, severity: Severity, message: &str);
}

impl<R: Recorder + ?Sized> Recorder for Arc<R> {
    fn should_continue(&self) -> bool { (**self).should_continue() }
    fn failed(&self) -> bool { (**self).failed() }
    fn open_document(&self, d: &str) { (**self).open_document(d) }
    fn close_document(&self) { (**self).close_document() }
    fn open_step(&self, d: &str) { (**self).open_step(d) }
    fn close_step(&self) { (**self).close_step() }
    fn message(&self, m: &str) { (**self).message(m) }
    fn error(&self, s: Severity, m: &str) { (**self).error(s, m) }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Document,
    Step,
}

/// Open document or step, closed when dropped.
#[must_use = "the scope closes as soon as it is dropped"]
pub struct Scope<'a> {
    recorder: &'a dyn Recorder,
    kind: ScopeKind,
}

impl Scope<'_> {
    pub fn close(self) {}
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        match self.kind {
            ScopeKind::Document => self.recorder.close_document(),
            ScopeKind::Step => self.recorder.close_step(),
        }
    }
}

pub fn document<'a>(recorder: &'a dyn Recorder, description: &str) -> Scope<'a> {
    recorder.open_document(description);
    Scope { recorder, kind: ScopeKind::Document }
}

pub fn step<'a>(recorder: &'a dyn Recorder, description: &str) -> Scope<'a> {
    recorder.open_step(description);
    Scope { recorder, kind: ScopeKind::Step }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepRecord {
    pub description: String,
    pub messages: Vec<String>,
    pub errors: Vec<Finding>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentRecord {
    pub description: String,
    pub messages: Vec<String>,
    pub steps: Vec<StepRecord>,
}

impl DocumentRecord {
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.steps.iter().flat_map(|s| s.errors.iter())
    }

    pub fn halted(&self) -> bool {
        self.halted_by().is_some()
    }

    /// Severity of the first finding that halted this document.
    pub fn halted_by(&self) -> Option<Severity> {
        self.errors().map(|f| f.severity).find(|s| s.is_terminal())
    }

    pub fn failed(&self) -> bool {
        self.errors().any(|f| f.severity.is_failure())
    }
}

#[derive(Debug, Default)]
struct History {
    documents: Vec<DocumentRecord>,
    document_open: bool,
    step_open: bool,
}

impl History {
    fn current(&mut self) -> &mut DocumentRecord {
        assert!(self.document_open, "no open document");
        let last = self.documents.len() - 1;
        &mut self.documents[last]
    }

    fn current_step(&mut self) -> &mut StepRecord {
        assert!(self.step_open, "no open step");
        let doc = self.current();
        let last = doc.steps.len() - 1;
        &mut doc.steps[last]
    }
}

/// Keeps every result in memory and answers `should_continue` and `failed`.
#[derive(Debug, Default)]
pub struct StateRecorder {
    history: Mutex<History>,
}

impl StateRecorder {
    pub fn new() -> Self { Self::default() }

    pub fn documents(&self) -> Vec<DocumentRecord> {
        lock(&self.history).documents.clone()
    }

    /// What halted the open document, if anything did.
    pub fn halted_by(&self) -> Option<Severity> {
        let h = lock(&self.history);
        if !h.document_open {
            return None;
        }
        h.documents.last().and_then(DocumentRecord::halted_by)
    }
}

impl Recorder for StateRecorder {
    fn should_continue(&self) -> bool {
        let h = lock(&self.history);
        !(h.document_open && h.documents.last().is_some_and(DocumentRecord::halted))
    }

    fn failed(&self) -> bool {
        lock(&self.history).documents.iter().any(DocumentRecord::failed)
    }

    fn open_document(&self, description: &str) {
        let mut h = lock(&self.history);
        assert!(!h.step_open, "document opened inside a step");
        h.documents.push(DocumentRecord { description: description.to_string(), ..Default::default() });
        h.document_open = true;
        trace!(document = description, "document opened");
    }

    fn close_document(&self) {
        let mut h = lock(&self.history);
        assert!(!h.step_open, "document closed with a step open");
        assert!(h.document_open, "no open document");
        h.document_open = false;
    }

    fn open_step(&self, description: &str) {
        let mut h = lock(&self.history);
        assert!(!h.step_open, "step opened inside a step");
        h.current().steps.push(StepRecord { description: description.to_string(), ..Default::default() });
        h.step_open = true;
    }

    fn close_step(&self) {
        let mut h = lock(&self.history);
        assert!(h.step_open, "no open step");
        h.step_open = false;
    }

    fn message(&self, message: &str) {
        let mut h = lock(&self.history);
        if h.step_open {
            h.current_step().messages.push(message.to_string());
        } else {
            h.current().messages.push(message.to_string());
        }
    }

    fn error(&self, severity: Severity, message: &str) {
        let mut h = lock(&self.history);
        h.current_step().errors.push(Finding { severity, message: message.to_string() });
    }
}

/// Forwards every call to two recorders. `should_continue` holds only if
/// both agree; `failed` holds if either reports it.
pub struct StackRecorder {
    top: Box<dyn Recorder>,
    next: Box<dyn Recorder>,
}

impl StackRecorder {
    pub fn new(top: Box<dyn Recorder>, next: Box<dyn Recorder>) -> Self {
        Self { top, next }
    }
}

impl Recorder for StackRecorder {
    fn should_continue(&self) -> bool {
        let top = self.top.should_continue();
        let next = self.next.should_continue();
        top && next
    }

    fn failed(&self) -> bool {
        let top = self.top.failed();
        let next = self.next.failed();
        top || next
    }

    fn open_document(&self, d: &str) {
        self.top.open_document(d);
        self.next.open_document(d);
    }

    fn close_document(&self) {
        self.top.close_document();
        self.next.close_document();
    }

    fn open_step(&self, d: &str) {
        self.top.open_step(d);
        self.next.open_step(d);
    }

    fn close_step(&self) {
        self.top.close_step();
        self.next.close_step();
    }

    fn message(&self, m: &str) {
        self.top.message(m);
        self.next.message(m);
    }

    fn error(&self, s: Severity, m: &str) {
        self.top.error(s, m);
        self.next.error(s, m);
    }
}

type Sink = Box<dyn Write + Send>;

fn emit(out: &mut Sink, line: &str) {
    if let Err(e) = writeln!(out, "{line}") {
        warn!(error = %e, "writing results failed");
    }
}

const BRANCH: &str = "├─ ";
const ELBOW: &str = "└─ ";
const VERTICAL: &str = "│ ";

fn failure_count(errors: &[Finding]) -> usize {
    errors.iter().filter(|f| f.severity.is_failure()).count()
}

fn plural_errors(n: usize) -> &'static str {
    if n == 1 { "error" } else { "errors" }
}

struct TreeState {
    out: Sink,
    timestamps: bool,
    indent: usize,
    documents: usize,
    steps: usize,
    step_errors: Vec<Finding>,
    document_failures: usize,
}

impl TreeState {
    fn line(&mut self, leader: &str, text: &str) {
        let stamp = if self.timestamps {
            let now = Local::now();
            format!("{}.{:04}\t", now.format("%H:%M:%S"), now.nanosecond() % 1_000_000_000 / 100_000)
        } else {
            String::new()
        };
        for (n, part) in text.split('\n').enumerate() {
            let l = if n == 0 {
                format!("{stamp}{}{leader}{part}", VERTICAL.repeat(self.indent))
            } else {
                format!("{stamp}{} {part}", VERTICAL.repeat(self.indent + 1))
            };
            emit(&mut self.out, &l);
        }
    }
}

/// Human readable indented tree.
pub struct TreeWriter {
    state: Mutex<TreeState>,
}

impl TreeWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(TreeState {
                out,
                timestamps: true,
                indent: 0,
                documents: 0,
                steps: 0,
                step_errors: Vec::new(),
                document_failures: 0,
            }),
        }
    }

    pub fn stdout() -> Self { Self::new(Box::new(std::io::stdout())) }

    pub fn without_timestamps(self) -> Self {
        lock(&self.state).timestamps = false;
        self
    }
}

impl Recorder for TreeWriter {
    fn should_continue(&self) -> bool { true }
    fn failed(&self) -> bool { false }

    fn open_document(&self, description: &str) {
        let mut st = lock(&self.state);
        if st.documents > 0 {
            emit(&mut st.out, "");
        }
        st.documents += 1;
        st.steps = 0;
        st.document_failures = 0;
        st.line("", &format!("Running: {description}"));
    }

    fn close_document(&self) {
        let mut st = lock(&self.state);
        let text = match st.document_failures {
            0 => format!("Pass with {} steps OK", st.steps),
            n => format!("Failed with {n} {}", plural_errors(n)),
        };
        st.line(ELBOW, &text);
        let _ = st.out.flush();
    }

    fn open_step(&self, description: &str) {
        let mut st = lock(&self.state);
        st.steps += 1;
        let n = st.steps;
        st.line(BRANCH, &format!("Step {n}: {description}"));
        st.indent += 1;
        st.step_errors.clear();
    }

    fn close_step(&self) {
        let mut st = lock(&self.state);
        let n = failure_count(&st.step_errors);
        let text = if n == 0 { "Pass".to_string() } else { format!("Failed with {n} {}", plural_errors(n)) };
        st.line(ELBOW, &text);
        st.indent = st.indent.saturating_sub(1);
        st.document_failures += n;
    }

    fn message(&self, message: &str) {
        lock(&self.state).line(BRANCH, message);
    }

    fn error(&self, severity: Severity, message: &str) {
        let mut st = lock(&self.state);
        st.line(BRANCH, &format!("{}: {message}", severity.to_string().to_uppercase()));
        st.step_errors.push(Finding { severity, message: message.to_string() });
    }
}

struct TapState {
    out: Sink,
    documents: usize,
    steps: usize,
    step: String,
    step_errors: Vec<Finding>,
}

/// Test Anything Protocol, version 13.
pub struct TapWriter {
    state: Mutex<TapState>,
}

impl TapWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(TapState { out, documents: 0, steps: 0, step: String::new(), step_errors: Vec::new() }),
        }
    }

    pub fn stdout() -> Self { Self::new(Box::new(std::io::stdout())) }
}

impl Recorder for TapWriter {
    fn should_continue(&self) -> bool { true }
    fn failed(&self) -> bool { false }

    fn open_document(&self, _description: &str) {
        let mut st = lock(&self.state);
        if st.documents > 0 {
            emit(&mut st.out, "");
        }
        emit(&mut st.out, "TAP version 13");
        st.documents += 1;
        st.steps = 0;
    }

    fn close_document(&self) {
        let mut st = lock(&self.state);
        let plan = format!("1..{}", st.steps);
        emit(&mut st.out, &plan);
        let _ = st.out.flush();
    }

    fn open_step(&self, description: &str) {
        let mut st = lock(&self.state);
        st.steps += 1;
        st.step = description.to_string();
        st.step_errors.clear();
    }

    fn close_step(&self) {
        let mut st = lock(&self.state);
        let n = st.steps;
        let failed = st.step_errors.iter().any(|f| f.severity.is_failure());
        let skip = st.step_errors.iter().find(|f| f.severity == Severity::Skip).map(|f| f.message.clone());
        let status = if failed { "not ok" } else { "ok" };
        let line = match skip {
            Some(reason) if !failed => format!("{status} {n} - {} # SKIP {reason}", st.step),
            _ => format!("{status} {n} - {}", st.step),
        };
        emit(&mut st.out, &line);

        if !st.step_errors.is_empty() {
            let body = serde_yaml::to_string(&st.step_errors).unwrap_or_else(|e| format!("# unserializable: {e}\n"));
            emit(&mut st.out, "  ---");
            for l in body.lines() {
                emit(&mut st.out, &format!("  {l}"));
            }
            emit(&mut st.out, "  ...");
        }
    }

    fn message(&self, message: &str) {
        let mut st = lock(&self.state);
        for l in message.split('\n') {
            emit(&mut st.out, &format!("# {l}"));
        }
    }

    fn error(&self, severity: Severity, message: &str) {
        let mut st = lock(&self.state);
        for l in message.split('\n') {
            emit(&mut st.out, &format!("# {severity} - {l}"));
        }
        st.step_errors.push(Finding { severity, message: message.to_string() });
    }
}
