use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wattscope::catalog::inventory::InventoryRecord;
use wattscope::catalog::Catalog;
use wattscope::health::HealthMetrics;
use wattscope::power::PowerEstimator;
use wattscope::sampler::{read_chunks, Chunk};
use wattscope::session::{self, pump, AttributedPower, Sample, SessionSpec};
use wattscope::sink::Sink;

fn record(name: &str, unit: &str) -> InventoryRecord {
    InventoryRecord {
        name: name.to_string(),
        unit: Some(unit.to_string()),
        kind: Some("Kernel PMU event".to_string()),
        encoding: None,
    }
}

fn test_catalog() -> Catalog {
    Catalog::build(&[
        record("power/energy-pkg/", "power"),
        record("instructions", "cpu_core"),
    ])
}

fn health() -> HealthMetrics {
    HealthMetrics::new(":0").expect("metrics")
}

/// Sink collecting records in memory for assertions.
#[derive(Default)]
struct MemorySink {
    samples: Vec<Sample>,
    powers: Vec<AttributedPower>,
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn record_sample(&mut self, sample: &Sample) -> Result<()> {
        self.samples.push(sample.clone());
        Ok(())
    }

    fn record_power(&mut self, power: &AttributedPower) -> Result<()> {
        self.powers.push(power.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Synthetic perf interval output for the system scope.
fn system_stream(intervals: usize) -> String {
    let mut out = String::from("# started on Tue Aug  4 2026\n");
    for i in 1..=intervals {
        out.push_str(&format!("{i}.000104     10.00 Joules power/energy-pkg/\n"));
        out.push_str(&format!("{i}.000104     1,000        instructions\n"));
    }
    out
}

/// Synthetic perf interval output for the cgroup scope.
fn cgroup_stream(intervals: usize) -> String {
    let mut out = String::new();
    for i in 1..=intervals {
        out.push_str(&format!("{i}.000099     250        instructions\n"));
    }
    out
}

async fn chunks_of(input: String, chunk_size: usize) -> mpsc::Receiver<Chunk> {
    let (tx, rx) = mpsc::channel(32);
    read_chunks(
        BufReader::new(std::io::Cursor::new(input.into_bytes())),
        chunk_size,
        CancellationToken::new(),
        tx,
        "test",
    )
    .await;
    rx
}

#[tokio::test]
async fn test_pipeline_text_to_attributed_power() {
    let resolved = test_catalog().resolve_events(0);
    let estimator = PowerEstimator::from_resolved(&resolved).expect("estimator");

    let sys_rx = chunks_of(system_stream(3), resolved.system.len()).await;
    let cg_rx = chunks_of(cgroup_stream(3), resolved.cgroup.len()).await;

    let mut sink = MemorySink::default();
    let metrics = health();

    let report = pump(sys_rx, Some(cg_rx), Some(&estimator), &mut sink, &metrics)
        .await
        .expect("pump");

    assert_eq!(report.samples, 3);
    assert_eq!(report.estimates, 3);
    assert_eq!(report.parse_errors, 0);

    for (i, power) in sink.powers.iter().enumerate() {
        assert_eq!(power.system_power_joules, 10.0);
        assert_eq!(power.cgroup_power_joules, 2.5);
        assert_eq!(power.timestamp, sink.samples[i].timestamp);
    }
}

#[tokio::test]
async fn test_pipeline_cgroup_stream_ending_early_leaves_scope_absent() {
    let resolved = test_catalog().resolve_events(0);
    let estimator = PowerEstimator::from_resolved(&resolved).expect("estimator");

    // Cgroup stream ends after interval 2 of 3.
    let sys_rx = chunks_of(system_stream(3), resolved.system.len()).await;
    let cg_rx = chunks_of(cgroup_stream(2), resolved.cgroup.len()).await;

    let mut sink = MemorySink::default();
    let metrics = health();

    let report = pump(sys_rx, Some(cg_rx), Some(&estimator), &mut sink, &metrics)
        .await
        .expect("pump");

    assert_eq!(report.samples, 3);
    assert_eq!(report.estimates, 2);

    assert!(sink.samples[2].system.is_some());
    assert!(sink.samples[2].cgroup.is_none());
    assert_eq!(sink.powers.len(), 2);
}

#[tokio::test]
async fn test_pipeline_uncounted_events_read_as_zero() {
    let input = "\
1.000104     <not counted> Joules power/energy-pkg/
1.000104     1,000        instructions
";
    let sys_rx = chunks_of(input.to_string(), 2).await;

    let mut sink = MemorySink::default();
    let metrics = health();

    pump(sys_rx, None, None, &mut sink, &metrics)
        .await
        .expect("pump");

    let system = sink.samples[0].system.as_ref().expect("system present");
    let expected: BTreeMap<String, f64> = [
        ("power/energy-pkg/".to_string(), 0.0),
        ("instructions".to_string(), 1000.0),
    ]
    .into_iter()
    .collect();
    assert_eq!(system, &expected);
}

/// Fake perf: emits interval lines on stderr, scoped output depending
/// on whether a cgroup target (-G) was requested.
fn fake_perf(dir: &std::path::Path, system_intervals: usize, cgroup_intervals: usize) -> PathBuf {
    let path = dir.join("fake-perf.sh");
    let mut script = std::fs::File::create(&path).expect("create script");

    write!(
        script,
        r#"#!/bin/sh
case "$*" in
  *-G*)
    i=1
    while [ $i -le {cgroup_intervals} ]; do
      echo "$i.000099     250        instructions" >&2
      i=$((i+1))
      sleep 0.05
    done
    ;;
  *)
    i=1
    while [ $i -le {system_intervals} ]; do
      echo "$i.000104     10.00 Joules power/energy-pkg/" >&2
      echo "$i.000104     1,000        instructions" >&2
      i=$((i+1))
      sleep 0.05
    done
    ;;
esac
"#,
    )
    .expect("write script");
    drop(script);

    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");

    path
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_with_subprocess_streams_writes_tailable_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let perf_bin = fake_perf(dir.path(), 3, 2);

    let resolved = test_catalog().resolve_events(0);

    let sink =
        wattscope::sink::jsonl::JsonlSink::create(dir.path(), chrono::Utc::now()).expect("sink");
    let output_path = sink.path().to_path_buf();

    let spec = SessionSpec {
        cgroup: Some("workload".to_string()),
        interval: Duration::from_millis(100),
        duration: Duration::from_secs(5),
        perf_bin: perf_bin.to_string_lossy().into_owned(),
    };

    let handle = session::start(
        spec,
        resolved,
        Box::new(sink),
        Arc::new(health()),
        CancellationToken::new(),
    );

    let report = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("session should end with its streams")
        .expect("session result");

    // Three system intervals, cgroup gone after two: the trailing
    // sample has no cgroup counters and no attributed power.
    assert_eq!(report.samples, 3);
    assert_eq!(report.estimates, 2);

    let content = std::fs::read_to_string(&output_path).expect("read output");
    let records: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();

    let samples: Vec<&serde_json::Value> =
        records.iter().filter(|r| r["kind"] == "sample").collect();
    let powers: Vec<&serde_json::Value> =
        records.iter().filter(|r| r["kind"] == "power").collect();

    assert_eq!(samples.len(), 3);
    assert_eq!(powers.len(), 2);

    assert_eq!(samples[0]["system"]["power/energy-pkg/"], 10.0);
    assert_eq!(samples[0]["cgroup"]["instructions"], 250.0);
    assert!(samples[2].get("cgroup").is_none());

    assert_eq!(powers[0]["cgroup_power_joules"], 2.5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_stop_terminates_streams_and_flushes() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Long-running fake perf; the stop must not wait for it.
    let perf_bin = fake_perf(dir.path(), 1000, 1000);

    let resolved = test_catalog().resolve_events(0);
    let sink =
        wattscope::sink::jsonl::JsonlSink::create(dir.path(), chrono::Utc::now()).expect("sink");

    let spec = SessionSpec {
        cgroup: Some("workload".to_string()),
        interval: Duration::from_millis(100),
        duration: Duration::from_secs(600),
        perf_bin: perf_bin.to_string_lossy().into_owned(),
    };

    let handle = session::start(
        spec,
        resolved,
        Box::new(sink),
        Arc::new(health()),
        CancellationToken::new(),
    );

    // Let a few intervals through, then request a stop.
    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.request_stop();

    let report = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("stop should complete promptly")
        .expect("session result");

    assert!(report.samples >= 1, "expected buffered chunks drained");
}
