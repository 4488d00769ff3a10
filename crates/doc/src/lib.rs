//! Kest test documents.
//!
//! A test document is a stream of fragments separated by YAML document
//! separator lines (`---`). The contents of a fragment are opaque until
//! it is classified: a fragment is either a Kubernetes object, a Rego
//! policy module, or unknown. Classification happens at most once per
//! fragment and is memoized.

#![forbid(unsafe_code)]

use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// Package given to policy fragments that do not declare one.
pub const DEFAULT_PACKAGE: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("reading {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a fragment could not be decoded as the type it claims to be.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("invalid {kind} fragment: {message}")]
    Invalid { kind: FragmentType, message: String },
    #[error("fragment contains no policy rules")]
    NoRules,
}

/// The parsed content type of a fragment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum FragmentType {
    #[default]
    Unknown,
    Invalid,
    Object,
    Policy,
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FragmentType::Object => "Kubernetes",
            FragmentType::Policy => "Rego",
            FragmentType::Invalid => "invalid",
            FragmentType::Unknown => "unknown",
        })
    }
}

/// 1-based, inclusive line range of a fragment within its document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Location {
    pub start: usize,
    pub end: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "line {}", self.start)
        } else {
            write!(f, "lines {}-{}", self.start, self.end)
        }
    }
}

/// A compiled Rego module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyModule {
    source: String,
    package: String,
    rules: Vec<String>,
}

impl PolicyModule {
    /// Compiles policy text. Text without a `package` clause is placed
    /// in [`DEFAULT_PACKAGE`]. Fails with [`FragmentError::NoRules`] when
    /// the module declares no rules, or when the text is YAML or JSON data
    /// rather than Rego.
    pub fn compile(text: &str) -> Result<Self, FragmentError> {
        let source = if declares_package(text) {
            text.to_string()
        } else {
            format!("package {DEFAULT_PACKAGE}\n{text}")
        };

        let mut engine = regorus::Engine::new();
        engine.set_rego_v0(true);
        if let Err(e) = engine.add_policy("fragment.rego".to_string(), source.clone()) {
            if is_structured_data(text) {
                return Err(FragmentError::NoRules);
            }
            return Err(invalid_policy(format!("{e:#}")));
        }

        let (package, rules) = module_heads(&engine)?;
        if rules.is_empty() {
            return Err(FragmentError::NoRules);
        }
        Ok(Self { source, package, rules })
    }

    /// Full module source, including the package clause.
    pub fn source(&self) -> &str { &self.source }
    /// Dotted package name, e.g. `main`.
    pub fn package(&self) -> &str { &self.package }
    /// Names of every rule head found in the module, deduplicated, in source order.
    pub fn rules(&self) -> &[String] { &self.rules }
}

fn invalid_policy(message: impl Into<String>) -> FragmentError {
    FragmentError::Invalid { kind: FragmentType::Policy, message: message.into() }
}

fn declares_package(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .is_some_and(|l| l.starts_with("package "))
}

/// Whether text that does not parse as Rego is a YAML or JSON collection.
fn is_structured_data(text: &str) -> bool {
    matches!(
        serde_yaml::from_str::<serde_yaml::Value>(text),
        Ok(serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_))
    )
}

/// Package path and rule names of the single module loaded in `engine`,
/// read from the parsed module.
fn module_heads(engine: &regorus::Engine) -> Result<(String, Vec<String>), FragmentError> {
    let ast = engine.get_ast_as_json().map_err(|e| invalid_policy(format!("{e:#}")))?;
    let policies: Json = serde_json::from_str(&ast).map_err(|e| invalid_policy(e.to_string()))?;
    let module = &policies[0]["ast"];

    let package = ref_path(&module["package"]["refr"])
        .map(|p| p.join("."))
        .ok_or_else(|| invalid_policy("module has no package"))?;

    let mut rules: Vec<String> = Vec::new();
    for name in module["rules"].as_array().into_iter().flatten().filter_map(rule_name) {
        if !rules.contains(&name) {
            rules.push(name);
        }
    }
    Ok((package, rules))
}

/// Name of a rule: the first segment of its head reference. Functions
/// are not rules a check can query and yield `None`.
fn rule_name(rule: &Json) -> Option<String> {
    let refr = if let Some(spec) = rule.get("Spec") {
        let (kind, head) = spec.get("head")?.as_object()?.iter().next()?;
        if kind == "Func" {
            return None;
        }
        head.get("refr")?
    } else {
        let default = rule.get("Default")?;
        if default.get("args").and_then(Json::as_array).is_some_and(|a| !a.is_empty()) {
            return None;
        }
        default.get("refr")?
    };
    ref_path(refr)?.into_iter().next()
}

/// Segments of a reference expression such as `a.b["c"]`. Non-string
/// brackets end the path.
fn ref_path(expr: &Json) -> Option<Vec<String>> {
    let (tag, node) = expr.as_object()?.iter().next()?;
    let segment = |v: &Json| v.get(1).and_then(Json::as_str).map(str::to_string);
    match tag.as_str() {
        "Var" => Some(vec![segment(node)?]),
        "RefDot" => {
            let mut path = ref_path(node.get("refr")?)?;
            path.push(segment(node.get("field")?)?);
            Some(path)
        }
        "RefBrack" => {
            let mut path = ref_path(node.get("refr")?)?;
            path.extend(node.get("index").and_then(|i| i.get("String")).and_then(segment));
            Some(path)
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Decoded {
    Unknown,
    Invalid(FragmentError),
    Object(Json),
    Policy(PolicyModule),
}

/// A parseable portion of a [`Document`].
#[derive(Debug, Clone)]
pub struct Fragment {
    bytes: Vec<u8>,
    location: Location,
    decoded: OnceLock<Decoded>,
}

impl Fragment {
    pub fn new(bytes: impl Into<Vec<u8>>, location: Location) -> Self {
        Self { bytes: bytes.into(), location, decoded: OnceLock::new() }
    }

    /// Builds a fragment that must hold a policy module, compiling it now.
    pub fn policy(text: &str) -> Result<Self, FragmentError> {
        let module = PolicyModule::compile(text)?;
        let f = Self::new(text.as_bytes().to_vec(), Location::default());
        let _ = f.decoded.set(Decoded::Policy(module));
        Ok(f)
    }

    pub fn bytes(&self) -> &[u8] { &self.bytes }
    pub fn location(&self) -> Location { self.location }

    /// The fragment type if it has been classified, otherwise `Unknown`.
    pub fn fragment_type(&self) -> FragmentType {
        match self.decoded.get() {
            Some(Decoded::Object(_)) => FragmentType::Object,
            Some(Decoded::Policy(_)) => FragmentType::Policy,
            Some(Decoded::Invalid(_)) => FragmentType::Invalid,
            Some(Decoded::Unknown) | None => FragmentType::Unknown,
        }
    }

    /// Classifies the fragment. The first call decodes; later calls
    /// return the memoized outcome. An error means the type is `Invalid`.
    pub fn classify(&self) -> Result<FragmentType, FragmentError> {
        match self.decoded.get_or_init(|| decode(&self.bytes)) {
            Decoded::Invalid(e) => Err(e.clone()),
            _ => Ok(self.fragment_type()),
        }
    }

    /// The decoded object, for object fragments.
    pub fn object(&self) -> Option<&Json> {
        match self.decoded.get() {
            Some(Decoded::Object(o)) => Some(o),
            _ => None,
        }
    }

    /// The compiled module, for policy fragments.
    pub fn module(&self) -> Option<&PolicyModule> {
        match self.decoded.get() {
            Some(Decoded::Policy(m)) => Some(m),
            _ => None,
        }
    }
}

fn decode_object(data: &[u8]) -> Option<Json> {
    let val: serde_yaml::Value = serde_yaml::from_slice(data).ok()?;
    let json = serde_json::to_value(val).ok()?;
    let has = |k: &str| json.get(k).and_then(|v| v.as_str()).map(|s| !s.is_empty()).unwrap_or(false);
    (has("apiVersion") && has("kind")).then_some(json)
}

fn decode(data: &[u8]) -> Decoded {
    if let Some(obj) = decode_object(data) {
        return Decoded::Object(obj);
    }

    let text = String::from_utf8_lossy(data);
    match PolicyModule::compile(&text) {
        Ok(m) => Decoded::Policy(m),
        Err(FragmentError::NoRules) => Decoded::Unknown,
        Err(e) => {
            debug!(error = %e, "policy fragment failed to compile");
            Decoded::Invalid(e)
        }
    }
}

/// An ordered collection of fragments read from one input.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub name: String,
    pub parts: Vec<Fragment>,
}

fn is_separator(line: &str) -> bool {
    line.strip_prefix("---")
        .map(|rest| rest.chars().all(|c| matches!(c, ' ' | '\t' | '\r' | '\x0c')))
        .unwrap_or(false)
}

/// Reads a stream of fragments separated by line-anchored `---` lines.
/// Separator lines are not part of any fragment. Blank lines before a
/// fragment's first content line are dropped, and so are empty fragments.
pub fn read_document<R: BufRead>(name: &str, input: R) -> Result<Document, DocError> {
    let mut doc = Document { name: name.to_string(), parts: Vec::new() };
    let mut buf = String::new();
    let mut start = 0usize;
    let mut current = 0usize;

    for line in input.lines() {
        let line = line.map_err(|source| DocError::Io { name: name.to_string(), source })?;
        current += 1;

        if is_separator(&line) {
            if !buf.is_empty() {
                buf.push('\n');
                doc.parts.push(Fragment::new(
                    std::mem::take(&mut buf).into_bytes(),
                    Location { start, end: current - 1 },
                ));
            }
            continue;
        }

        // A fragment starts at its first line with content.
        if buf.is_empty() {
            if line.trim().is_empty() {
                continue;
            }
            start = current;
        } else {
            // Restore the newline the line reader consumed.
            buf.push('\n');
        }
        buf.push_str(&line);
    }

    if !buf.is_empty() {
        doc.parts.push(Fragment::new(buf.into_bytes(), Location { start, end: current }));
    }

    Ok(doc)
}

/// Reads a document from a file; the document is named by its path.
pub fn read_file(path: impl AsRef<Path>) -> Result<Document, DocError> {
    let path = path.as_ref();
    let name = path.display().to_string();
    let fh = std::fs::File::open(path).map_err(|source| DocError::Io { name: name.clone(), source })?;
    read_document(&name, std::io::BufReader::new(fh))
}
