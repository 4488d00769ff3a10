use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value as Json;
use tokio::signal;
use tracing::{error, info, warn};

use kest_core::{Environment, ObjectExt, ANNOTATION_RUN_ID, LABEL_MANAGED_BY, MANAGER_NAME};
use kest_doc::{read_document, read_file, Document};
use kest_kubehub::memory::MemoryCluster;
use kest_kubehub::{list_selected, ClusterClient, KubeClient};
use kest_runner::{cluster_drivers, OutputFormat, RunOptions, Runner};

const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 64;
const EXIT_NO_INPUT: u8 = 66;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "kest", version, about = "Declarative Kubernetes tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run test documents
    Run(RunArgs),
    /// Show objects created by test runs
    Get {
        #[command(subcommand)]
        what: GetCommand,
    },
}

#[derive(Subcommand, Debug)]
enum GetCommand {
    /// Every object labeled as managed by kest
    Objects,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Test documents; "-" reads standard input
    #[arg(required = true)]
    documents: Vec<PathBuf>,

    /// Keep the objects a document created
    #[arg(long, env = "KEST_PRESERVE", action = ArgAction::SetTrue)]
    preserve: bool,

    /// Run against an in-memory cluster
    #[arg(long, env = "KEST_DRY_RUN", action = ArgAction::SetTrue)]
    dry_run: bool,

    /// How long a check may keep failing before its findings are recorded
    #[arg(long, env = "KEST_CHECK_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    check_timeout: Duration,

    /// Delay between check evaluations
    #[arg(long, env = "KEST_CHECK_INTERVAL", default_value = "500ms", value_parser = humantime::parse_duration)]
    check_interval: Duration,

    /// Result format: tree or tap
    #[arg(long, env = "KEST_FORMAT", default_value = "tree", value_parser = OutputFormat::from_str)]
    format: OutputFormat,

    /// Comma separated trace topics (rego)
    #[arg(long, env = "KEST_TRACE", value_delimiter = ',')]
    trace: Vec<String>,

    /// Document whose objects are used as fixtures (repeatable)
    #[arg(long = "fixtures", env = "KEST_FIXTURES", value_delimiter = ',')]
    fixtures: Vec<PathBuf>,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        for topic in self.trace.iter().filter(|t| t.as_str() != "rego") {
            warn!(topic = %topic, "unknown trace topic");
        }
        RunOptions {
            preserve: self.preserve,
            dry_run: self.dry_run,
            check_timeout: self.check_timeout,
            check_interval: self.check_interval,
            format: self.format,
            trace_rego: self.trace.iter().any(|t| t == "rego"),
            fixtures: self.fixtures.clone(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KEST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEST_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_documents(paths: &[PathBuf]) -> Result<Vec<Document>> {
    paths
        .iter()
        .map(|p| {
            if p.as_os_str() == "-" {
                read_document("stdin", std::io::stdin().lock()).context("reading standard input")
            } else {
                read_file(p).with_context(|| format!("reading {}", p.display()))
            }
        })
        .collect()
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let options = args.options();

    let documents = match load_documents(&args.documents) {
        Ok(docs) => docs,
        Err(e) => {
            eprintln!("kest: {e:#}");
            return Ok(ExitCode::from(EXIT_NO_INPUT));
        }
    };
    let fixtures = match options.load_fixtures() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("kest: {e:#}");
            return Ok(ExitCode::from(EXIT_NO_INPUT));
        }
    };

    let client: Arc<dyn ClusterClient> = if options.dry_run {
        info!("dry run against an in-memory cluster");
        Arc::new(MemoryCluster::new())
    } else {
        Arc::new(KubeClient::try_default().await?)
    };

    let env = Environment::new();
    info!(run_id = env.run_id(), documents = documents.len(), "starting run");
    let output = options.format.stdout();
    let runner = Runner::new(options, env.clone(), Arc::new(fixtures), cluster_drivers(client, env), output);

    tokio::select! {
        failed = runner.run(&documents) => {
            Ok(if failed { ExitCode::from(EXIT_FAILED) } else { ExitCode::SUCCESS })
        }
        _ = signal::ctrl_c() => {
            warn!("interrupted; objects from the current document are left in place");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
    }
}

async fn get_objects() -> Result<()> {
    let client = KubeClient::try_default().await?;
    let selector = format!("{LABEL_MANAGED_BY}={MANAGER_NAME}");
    let mut objects = list_selected(&client, &selector).await.context("listing managed objects")?;
    objects.sort_by(|a, b| (a.namespace(), a.kind(), a.name()).cmp(&(b.namespace(), b.kind(), b.name())));

    println!("{:<20} {:<48} {:<38} AGE", "NAMESPACE", "NAME", "RUN ID");
    let now = Utc::now();
    for obj in &objects {
        let (ns, name, run_id, age) = row(obj, now);
        println!("{ns:<20} {name:<48} {run_id:<38} {age}");
    }
    Ok(())
}

fn row(obj: &Json, now: DateTime<Utc>) -> (String, String, String, String) {
    let ns = obj.namespace().unwrap_or("-").to_string();
    let name = format!("{}/{}", obj.kind().unwrap_or_default().to_lowercase(), obj.name().unwrap_or_default());
    let run_id = obj.annotation(ANNOTATION_RUN_ID).unwrap_or("-").to_string();
    let created = obj
        .pointer("/metadata/creationTimestamp")
        .and_then(Json::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    (ns, name, run_id, created.map_or_else(|| "-".to_string(), |ts| render_age(now, ts)))
}

/// Age in its two largest units, like `kubectl get`.
fn render_age(now: DateTime<Utc>, created: DateTime<Utc>) -> String {
    let age = (now - created).num_seconds().max(0);
    let (days, hours, minutes) = (age / 86_400, age % 86_400 / 3_600, age % 3_600 / 60);
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{age}s"),
        (0, 0, m) => format!("{m}m"),
        (0, h, m) => format!("{h}h{m}m"),
        (d, h, _) => format!("{d}d{h}h"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_USAGE),
            };
            let _ = e.print();
            return code;
        }
    };
    init_tracing();
    init_metrics();

    let outcome = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Get { what: GetCommand::Objects } => get_objects().await.map(|()| ExitCode::SUCCESS),
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "kest failed");
            eprintln!("kest: {e:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "kest", "run", "a.yaml", "b.yaml", "--preserve", "--check-timeout", "2m", "--check-interval", "250ms",
            "--format", "tap", "--trace", "rego,http", "--fixtures", "f.yaml",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert_eq!(args.documents.len(), 2);
        let o = args.options();
        assert!(o.preserve && !o.dry_run && o.trace_rego);
        assert_eq!(o.check_timeout, Duration::from_secs(120));
        assert_eq!(o.check_interval, Duration::from_millis(250));
        assert_eq!(o.format, OutputFormat::Tap);
        assert_eq!(o.fixtures, [PathBuf::from("f.yaml")]);
    }

    #[test]
    fn run_requires_documents() {
        let err = Cli::try_parse_from(["kest", "run"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert!(Cli::try_parse_from(["kest", "run", "x", "--format", "json"]).is_err());
    }

    #[test]
    fn object_rows() {
        let now = DateTime::parse_from_rfc3339("2024-01-02T03:00:00Z").unwrap().with_timezone(&Utc);
        let obj = json!({
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm", "namespace": "team",
                "creationTimestamp": "2024-01-01T01:30:00Z",
                "annotations": { "kest/run-id": "r-1" }
            }
        });
        assert_eq!(row(&obj, now), ("team".into(), "configmap/cm".into(), "r-1".into(), "1d1h".into()));
        assert_eq!(row(&json!({ "kind": "Namespace", "metadata": { "name": "ns" } }), now).3, "-");
    }

    #[test]
    fn ages_use_the_two_largest_units() {
        let now = Utc::now();
        let ago = |secs: i64| render_age(now, now - chrono::Duration::seconds(secs));
        assert_eq!(ago(42), "42s");
        assert_eq!(ago(5 * 60 + 9), "5m");
        assert_eq!(ago(2 * 3_600 + 7 * 60), "2h7m");
        assert_eq!(ago(3 * 86_400 + 4 * 3_600 + 59), "3d4h");
        assert_eq!(render_age(now, now + chrono::Duration::seconds(30)), "0s");
    }

    #[test]
    fn missing_documents_are_reported() {
        assert!(load_documents(&[PathBuf::from("/nonexistent/kest.yaml")]).is_err());
    }
}
