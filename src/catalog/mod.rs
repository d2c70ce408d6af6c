pub mod inventory;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::inventory::InventoryRecord;

/// Errors from building, persisting, or loading the catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The inventory source could not be invoked or its payload decoded,
    /// or the built catalog could not be written out.
    #[error("building event catalog: {source}")]
    Build {
        #[source]
        source: anyhow::Error,
    },

    /// No usable catalog on disk; callers must rebuild before any
    /// session may start.
    #[error("event catalog unavailable at {path} (run `init` to build it)")]
    Unavailable { path: PathBuf },
}

/// PMU unit a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventUnit {
    Power,
    Msr,
    CpuCore,
    CpuAtom,
    Other,
}

impl EventUnit {
    /// Map the inventory source's unit string onto our partition.
    ///
    /// Non-hybrid machines report the core PMU as plain "cpu".
    fn from_inventory(unit: Option<&str>) -> Self {
        match unit {
            Some("power") => EventUnit::Power,
            Some("msr") => EventUnit::Msr,
            Some("cpu") | Some("cpu_core") => EventUnit::CpuCore,
            Some("cpu_atom") => EventUnit::CpuAtom,
            _ => EventUnit::Other,
        }
    }
}

/// One available counter, as reported by the inventory source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub name: String,
    pub unit: EventUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl EventDescriptor {
    fn from_record(record: &InventoryRecord) -> Self {
        Self {
            name: record.name.clone(),
            unit: EventUnit::from_inventory(record.unit.as_deref()),
            kind: record.kind.clone(),
            encoding: record.encoding.clone(),
        }
    }

    /// Whether this is the instructions-retired core counter the power
    /// estimator depends on.
    fn is_instructions(&self) -> bool {
        self.unit == EventUnit::CpuCore
            && (self.name == "instructions" || self.name.ends_with("/instructions/"))
    }

    /// Whether the inventory marked this as a kernel PMU counter.
    fn is_kernel_pmu(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case("kernel pmu event"))
    }
}

/// Events selected for one detail level, split by counting scope.
///
/// Cgroup scope carries only core/atom counters: RAPL energy and MSR
/// counters are package-wide and cannot be attributed to a cgroup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailLevel {
    pub level: u32,
    pub system_events: Vec<EventDescriptor>,
    pub cgroup_events: Vec<EventDescriptor>,
}

/// Event lists resolved for a session, union of levels `0..=max`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedEvents {
    pub system: Vec<EventDescriptor>,
    pub cgroup: Vec<EventDescriptor>,
}

impl ResolvedEvents {
    pub fn system_names(&self) -> Vec<String> {
        self.system.iter().map(|d| d.name.clone()).collect()
    }

    pub fn cgroup_names(&self) -> Vec<String> {
        self.cgroup.iter().map(|d| d.name.clone()).collect()
    }
}

/// Static model of available counters, partitioned into detail levels.
///
/// Built once from the event inventory and read-only afterwards;
/// rebuilt only by an explicit `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    levels: BTreeMap<u32, DetailLevel>,
}

impl Catalog {
    /// Partition an event inventory into detail levels.
    ///
    /// Level 0 holds energy counters plus the instructions counter the
    /// power estimator requires; level 1 adds MSR counters and kernel
    /// PMU core/atom counters. Anything else is left out.
    pub fn build(records: &[InventoryRecord]) -> Self {
        let mut level0 = DetailLevel {
            level: 0,
            ..Default::default()
        };
        let mut level1 = DetailLevel {
            level: 1,
            ..Default::default()
        };

        for record in records {
            let desc = EventDescriptor::from_record(record);

            match desc.unit {
                EventUnit::Power => {
                    level0.system_events.push(desc);
                }
                EventUnit::Msr => {
                    level1.system_events.push(desc);
                }
                EventUnit::CpuCore | EventUnit::CpuAtom => {
                    if desc.is_instructions() {
                        level0.system_events.push(desc.clone());
                        level0.cgroup_events.push(desc.clone());
                    }
                    if desc.is_kernel_pmu() {
                        level1.system_events.push(desc.clone());
                        level1.cgroup_events.push(desc);
                    }
                }
                EventUnit::Other => {}
            }
        }

        let mut levels = BTreeMap::new();
        levels.insert(0, level0);
        levels.insert(1, level1);

        Self { levels }
    }

    /// Total number of distinct level entries.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Union the event lists of levels `0..=max_level`, de-duplicated by
    /// name with first-seen order preserved. Ordering matters: perf
    /// emits counters in request order and the parser aligns by position.
    pub fn resolve_events(&self, max_level: u32) -> ResolvedEvents {
        let mut resolved = ResolvedEvents::default();
        let mut seen_system: HashSet<&str> = HashSet::new();
        let mut seen_cgroup: HashSet<&str> = HashSet::new();

        for (_, level) in self.levels.range(0..=max_level) {
            for desc in &level.system_events {
                if seen_system.insert(desc.name.as_str()) {
                    resolved.system.push(desc.clone());
                }
            }
            for desc in &level.cgroup_events {
                if seen_cgroup.insert(desc.name.as_str()) {
                    resolved.cgroup.push(desc.clone());
                }
            }
        }

        resolved
    }

    /// Write the catalog to its on-disk form.
    pub fn persist(&self, path: &Path) -> Result<(), CatalogError> {
        let write = || -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = serde_json::to_vec_pretty(self)?;
            std::fs::write(path, data)?;
            Ok(())
        };

        write().map_err(|source| CatalogError::Build { source })
    }

    /// Load a previously persisted catalog.
    ///
    /// Missing or undecodable files report `Unavailable`: either way the
    /// catalog must be rebuilt before a session may start.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let data = std::fs::read(path).map_err(|_| CatalogError::Unavailable {
            path: path.to_path_buf(),
        })?;

        serde_json::from_slice(&data).map_err(|_| CatalogError::Unavailable {
            path: path.to_path_buf(),
        })
    }
}
