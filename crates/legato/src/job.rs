use anyhow::{Context, Result};
use legato_core::{EXTRUDERS, RequestedMove};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// A list of moves to feed through the planner, plus the live factors to
/// run it with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub speed_factor: Option<f64>,

    /// One entry per extruder
    #[serde(default)]
    pub extrusion_factors: Option<[f64; EXTRUDERS]>,

    #[serde(default)]
    pub moves: Vec<RequestedMove>,
}

impl Job {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path.display()))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_json(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse job as TOML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse job as JSON")
    }
}
