use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the wattscope daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Watched cgroup configuration.
    #[serde(default)]
    pub cgroup: CgroupConfig,

    /// Counter sampling configuration.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Event catalog location.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Measurement output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Watched cgroup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CgroupConfig {
    /// Filesystem path of the watched cgroup
    /// (e.g. "/sys/fs/cgroup/workload").
    #[serde(default)]
    pub path: String,

    /// Cgroup name passed to the measurement source. Default: the
    /// watched path relative to the cgroup filesystem root.
    #[serde(default)]
    pub name: String,

    /// How often to re-read the membership file. Default: 500ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Counter sampling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Counter read cadence. Default: 1s.
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on one session's length. Default: 60s.
    #[serde(default = "default_session_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Catalog detail level to sample at. Default: 1.
    #[serde(default = "default_detail_level")]
    pub detail_level: u32,

    /// Measurement tool binary. Default: "perf".
    #[serde(default = "default_perf_bin")]
    pub perf_bin: String,
}

/// Event catalog location.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Path of the persisted catalog file.
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

/// Measurement output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory session record files are written to.
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_session_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_detail_level() -> u32 {
    1
}

fn default_perf_bin() -> String {
    "perf".to_string()
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("/var/lib/wattscope/catalog.json")
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("/var/lib/wattscope/measurements")
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cgroup: CgroupConfig::default(),
            sampling: SamplingConfig::default(),
            catalog: CatalogConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            name: String::new(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: default_sample_interval(),
            duration: default_session_duration(),
            detail_level: default_detail_level(),
            perf_bin: default_perf_bin(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the fields a daemon or sampling run requires.
    pub fn validate(&self) -> Result<()> {
        if self.cgroup.path.is_empty() {
            bail!("cgroup.path is required");
        }

        if self.cgroup.poll_interval.is_zero() {
            bail!("cgroup.poll_interval must be positive");
        }

        if self.sampling.interval.is_zero() {
            bail!("sampling.interval must be positive");
        }

        if self.sampling.duration < self.sampling.interval {
            bail!("sampling.duration must be at least one sampling.interval");
        }

        if self.sampling.perf_bin.is_empty() {
            bail!("sampling.perf_bin must not be empty");
        }

        Ok(())
    }

    /// Cgroup name handed to the measurement source: the configured
    /// override, or the watched path relative to the cgroup filesystem
    /// root.
    pub fn perf_cgroup_target(&self) -> String {
        if !self.cgroup.name.is_empty() {
            return self.cgroup.name.clone();
        }

        self.cgroup
            .path
            .strip_prefix("/sys/fs/cgroup/")
            .unwrap_or(&self.cgroup.path)
            .trim_end_matches('/')
            .to_string()
    }
}
