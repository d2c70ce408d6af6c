//! Event inventory via `perf list --json`.

use std::process::Command;

use anyhow::{anyhow, Context};
use serde::Deserialize;

use super::CatalogError;

/// One event descriptor as emitted by the inventory source.
///
/// Field names follow perf's JSON output; absent fields deserialize to
/// `None` rather than failing the whole inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryRecord {
    #[serde(rename = "EventName")]
    pub name: String,

    #[serde(rename = "Unit", default)]
    pub unit: Option<String>,

    #[serde(rename = "EventType", default)]
    pub kind: Option<String>,

    #[serde(rename = "Encoding", default)]
    pub encoding: Option<String>,
}

/// Run the inventory source and decode its payload.
pub fn fetch(perf_bin: &str) -> Result<Vec<InventoryRecord>, CatalogError> {
    let run = || -> anyhow::Result<Vec<InventoryRecord>> {
        let output = Command::new(perf_bin)
            .args(["list", "--json"])
            .output()
            .with_context(|| format!("invoking {perf_bin} list"))?;

        if !output.status.success() {
            return Err(anyhow!("{perf_bin} list exited with {}", output.status));
        }

        decode(&output.stdout)
    };

    run().map_err(|source| CatalogError::Build { source })
}

/// Decode the inventory JSON payload.
///
/// perf emits an array of event objects; entries without an EventName
/// (section headers on some versions) are dropped.
fn decode(payload: &[u8]) -> anyhow::Result<Vec<InventoryRecord>> {
    let raw: Vec<serde_json::Value> =
        serde_json::from_slice(payload).context("decoding event inventory JSON")?;

    let mut records = Vec::with_capacity(raw.len());

    for value in raw {
        match serde_json::from_value::<InventoryRecord>(value) {
            Ok(record) => records.push(record),
            Err(_) => continue,
        }
    }

    if records.is_empty() {
        return Err(anyhow!("event inventory is empty"));
    }

    Ok(records)
}
