#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kest_core::Environment;
use kest_kubehub::memory::MemoryCluster;
use kest_recorder::TapWriter;
use kest_runner::{cluster_drivers, RunOptions, Runner};

#[derive(Clone, Default)]
struct Buf(Arc<Mutex<Vec<u8>>>);

impl Write for Buf {
    fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(b);
        Ok(b.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

const DOCUMENT: &str = r#"# A config map and a check on its data.
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: tap
data:
  mode: fast
---
error[msg] {
  not data.resources.tap.configmaps.settings
  msg := "settings not observed yet"
}

error[msg] {
  data.resources.tap.configmaps.settings.data.mode != "slow"
  msg := "mode is not slow"
}
---
warn_later[msg] {
  msg := "advisory only"
}
"#;

#[tokio::test(start_paused = true)]
async fn tap_stream_for_a_file_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, DOCUMENT).unwrap();
    let doc = kest_doc::read_file(&path).unwrap();
    assert_eq!(doc.parts.len(), 3);

    let cluster = Arc::new(MemoryCluster::new());
    let env = Environment::with_run_id("tap-run");
    let buf = Buf::default();
    let options = RunOptions { check_timeout: Duration::from_secs(1), check_interval: Duration::from_millis(200), ..Default::default() };
    let runner = Runner::new(
        options,
        env.clone(),
        Arc::new(Default::default()),
        cluster_drivers(cluster.clone(), env),
        Box::new(TapWriter::new(Box::new(buf.clone()))),
    );

    assert!(runner.run(&[doc]).await);

    let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "TAP version 13");
    assert!(lines.iter().any(|l| l.starts_with("ok 1 - update ConfigMap settings")));
    assert!(lines.iter().any(|l| l.starts_with("not ok 2 - check")));
    assert!(lines.contains(&"# Error - mode is not slow"));
    assert!(!out.contains("settings not observed yet"));
    assert!(lines.iter().any(|l| l.starts_with("ok 3 - check")));
    assert!(lines.contains(&"# Warn - advisory only"));
    assert_eq!(lines.last(), Some(&"1..3"));

    // The implicit namespace and the config map are both gone.
    assert_eq!(cluster.deletes(), 2);
}
