use std::collections::BTreeMap;

use thiserror::Error;

use crate::catalog::{EventUnit, ResolvedEvents};
use crate::session::{AttributedPower, Sample};

/// Errors from estimating one sample. Per-sample and never fatal: the
/// session skips the estimate and continues.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EstimateError {
    #[error("counter {name:?} missing from {scope} counters")]
    MissingCounter { name: String, scope: &'static str },
}

/// Attributes a share of whole-machine power to the cgroup by the ratio
/// of instructions it retired versus the machine as a whole.
#[derive(Debug, Clone)]
pub struct PowerEstimator {
    power_event: String,
    instructions_event: String,
}

impl PowerEstimator {
    pub fn new(power_event: impl Into<String>, instructions_event: impl Into<String>) -> Self {
        Self {
            power_event: power_event.into(),
            instructions_event: instructions_event.into(),
        }
    }

    /// Pick the estimator's counters out of a session's resolved events:
    /// the first energy counter in the system list, and the instructions
    /// counter common to both scopes. `None` when the resolved set
    /// cannot support attribution.
    pub fn from_resolved(resolved: &ResolvedEvents) -> Option<Self> {
        let power = resolved
            .system
            .iter()
            .find(|d| d.unit == EventUnit::Power)?;

        let instructions = resolved
            .cgroup
            .iter()
            .find(|d| resolved.system.iter().any(|s| s.name == d.name))?;

        Some(Self::new(power.name.as_str(), instructions.name.as_str()))
    }

    /// Estimate the cgroup's share of system power for one sample.
    ///
    /// Zero system instructions yields a 0.0 estimate rather than an
    /// error: a workload contributed nothing to a machine that recorded
    /// no activity.
    pub fn estimate(&self, sample: &Sample) -> Result<AttributedPower, EstimateError> {
        let system_power = lookup(sample.system.as_ref(), "system", &self.power_event)?;
        let system_instructions = lookup(sample.system.as_ref(), "system", &self.instructions_event)?;
        let cgroup_instructions = lookup(sample.cgroup.as_ref(), "cgroup", &self.instructions_event)?;

        let cgroup_power_joules = if system_instructions == 0.0 {
            0.0
        } else {
            system_power * (cgroup_instructions / system_instructions)
        };

        Ok(AttributedPower {
            timestamp: sample.timestamp,
            system_power_joules: system_power,
            cgroup_power_joules,
        })
    }
}

/// Fetch one required counter from a scope's map, absent scope included.
fn lookup(
    counters: Option<&BTreeMap<String, f64>>,
    scope: &'static str,
    name: &str,
) -> Result<f64, EstimateError> {
    counters
        .and_then(|c| c.get(name))
        .copied()
        .ok_or_else(|| EstimateError::MissingCounter {
            name: name.to_string(),
            scope,
        })
}
