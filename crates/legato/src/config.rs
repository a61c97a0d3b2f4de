use anyhow::{Context, Result};
use legato_core::{
    MachineConfig, TransformState,
    transform::{MAX_PROBE_POINTS, SkewPlane},
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Configuration for the legato tools
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Drive limits and planner tuning
    #[serde(default)]
    pub machine: MachineConfig,

    /// Geometric corrections applied to every move
    #[serde(default)]
    pub compensation: CompensationConfig,
}

/// Bed and axis compensation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompensationConfig {
    /// Probed bed heights; 3, 4 or 5 points select the fitting mode
    #[serde(default)]
    pub probe_points: Vec<ProbePointConfig>,

    #[serde(default)]
    pub skew: SkewConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbePointConfig {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Axis skew as the tangent of the error angle in each plane
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SkewConfig {
    #[serde(default)]
    pub xy: f64,
    #[serde(default)]
    pub yz: f64,
    #[serde(default)]
    pub xz: f64,
}

impl Config {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config as TOML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config as JSON")
    }

    pub fn validate(&self) -> Result<()> {
        self.machine
            .validate()
            .context("invalid machine configuration")?;

        let points = self.compensation.probe_points.len();
        if points > MAX_PROBE_POINTS {
            anyhow::bail!(
                "compensation.probe_points holds {points} points, at most {MAX_PROBE_POINTS} are supported"
            );
        }
        if (1..3).contains(&points) {
            anyhow::bail!("compensation.probe_points needs at least 3 points, got {points}");
        }

        Ok(())
    }

    /// Build the coordinate transform this configuration describes
    pub fn transform(&self) -> Result<TransformState> {
        let mut transform = TransformState::new();
        let skew = self.compensation.skew;
        transform.set_axis_skew(SkewPlane::XY, skew.xy);
        transform.set_axis_skew(SkewPlane::YZ, skew.yz);
        transform.set_axis_skew(SkewPlane::XZ, skew.xz);

        if !self.compensation.probe_points.is_empty() {
            for (index, point) in self.compensation.probe_points.iter().enumerate() {
                transform
                    .set_probe_point(index, point.x, point.y, point.z)
                    .with_context(|| format!("invalid probe point {index}"))?;
            }
            transform
                .set_probed_bed_equation()
                .context("failed to fit bed compensation")?;
        }

        Ok(transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legato_core::transform::BedCompensation;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[machine.planner]
look_ahead_depth = 10
motion_ring_capacity = 8

[[compensation.probe_points]]
x = 0.0
y = 0.0
z = 0.0

[[compensation.probe_points]]
x = 100.0
y = 0.0
z = 1.0

[[compensation.probe_points]]
x = 0.0
y = 100.0
z = 2.0

[compensation.skew]
xy = 0.001
"#;

        let config = Config::from_toml(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.machine.planner.look_ahead_depth, 10);
        assert_eq!(config.machine.planner.look_ahead_capacity, 30);
        assert_eq!(config.compensation.probe_points.len(), 3);

        let transform = config.transform().unwrap();
        assert!(matches!(transform.bed(), BedCompensation::Plane { .. }));
        assert_eq!(transform.skew().tan_xy, 0.001);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "machine": {
                "axes": [
                    { "min": -10.0, "max": 300.0 },
                    { "min": 0.0, "max": 300.0 },
                    { "min": 0.0, "max": 250.0 }
                ]
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.machine.axes[0].min, -10.0);
        assert_eq!(config.machine.drives[0].steps_per_unit, 80.0);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.machine, MachineConfig::default());
        assert!(matches!(
            config.transform().unwrap().bed(),
            BedCompensation::Identity
        ));
    }

    #[test]
    fn test_rejects_two_probe_points() {
        let mut config = Config::default();
        config.compensation.probe_points = vec![
            ProbePointConfig {
                x: 0.0,
                y: 0.0,
                z: 0.0
            };
            2
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_machine() {
        let mut config = Config::default();
        config.machine.drives[2].steps_per_unit = -1.0;
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("steps_per_unit"));
    }
}
