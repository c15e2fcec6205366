//! The parsed payload descriptor produced by the download step (C5) and consumed by the
//! task executor (C6) to build the child command line.

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Closed record: only `command` and `relative_cwd` are recognized, matching the narrow schema
/// this worker relies on. Any other fields present in the manifest JSON are ignored.
#[derive(Debug, Clone, Deserialize)]
struct RawManifest {
    command: Vec<String>,
    #[serde(default)]
    relative_cwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedManifest {
    pub command: Vec<String>,
    pub relative_cwd: String,
}

impl IsolatedManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: RawManifest =
            serde_json::from_slice(bytes).context("parsing manifest JSON")?;
        anyhow::ensure!(!raw.command.is_empty(), "manifest `command` must be non-empty");
        Ok(Self {
            command: raw.command,
            relative_cwd: raw.relative_cwd,
        })
    }
}
