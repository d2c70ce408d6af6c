//! JSON Lines file sink, one file per session activation.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::{AttributedPower, Sample};

use super::Sink;

/// One line of the output stream.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Sample(&'a Sample),
    Power(&'a AttributedPower),
}

/// Appends session records to a JSON Lines file, flushing per record so
/// partial results can be tailed while the session runs.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Create a sink writing to `dir/session-<start>.jsonl`.
    pub fn create(dir: &Path, started_at: DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;

        let name = format!("session-{}.jsonl", started_at.format("%Y%m%dT%H%M%S%.3fZ"));
        let path = dir.join(name);

        let file = File::create(&path)
            .with_context(|| format!("creating output file {}", path.display()))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the file this sink writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &Record<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .with_context(|| format!("writing record to {}", self.path.display()))?;
        self.writer.write_all(b"\n")?;
        // Flush per record so the file can be tailed mid-session.
        self.writer.flush()?;
        Ok(())
    }
}

impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn record_sample(&mut self, sample: &Sample) -> Result<()> {
        self.write_record(&Record::Sample(sample))
    }

    fn record_power(&mut self, power: &AttributedPower) -> Result<()> {
        self.write_record(&Record::Power(power))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn sample() -> Sample {
        let mut system = BTreeMap::new();
        system.insert("instructions".to_string(), 1000.0);

        Sample {
            timestamp: 1.0,
            system: Some(system),
            cgroup: None,
        }
    }

    #[test]
    fn test_records_are_tailable_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = JsonlSink::create(dir.path(), Utc::now()).expect("sink");

        sink.record_sample(&sample()).expect("sample");
        sink.record_power(&AttributedPower {
            timestamp: 1.0,
            system_power_joules: 10.0,
            cgroup_power_joules: 2.5,
        })
        .expect("power");

        // Readable without flush/close: every record is flushed.
        let content = std::fs::read_to_string(sink.path()).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["kind"], "sample");
        assert_eq!(first["system"]["instructions"], 1000.0);
        // Absent scope is omitted entirely, not zero-filled.
        assert!(first.get("cgroup").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert_eq!(second["kind"], "power");
        assert_eq!(second["cgroup_power_joules"], 2.5);
    }

    #[test]
    fn test_file_name_carries_session_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let started = DateTime::parse_from_rfc3339("2026-08-04T12:30:45.100Z")
            .expect("timestamp")
            .with_timezone(&Utc);

        let sink = JsonlSink::create(dir.path(), started).expect("sink");
        let name = sink.path().file_name().expect("name").to_string_lossy();
        assert_eq!(name, "session-20260804T123045.100Z.jsonl");
    }
}
