//! Machine limits and planner tuning.
//!
//! Everything the core needs from the hardware collaborator that is a
//! plain number lives here. Units are millimetres and seconds throughout.

use crate::{AXES, DRIVES, error::ConfigError};
use serde::{Deserialize, Serialize};

/// Kinematic limits of a single drive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Microsteps per millimetre of travel (or of filament for extruders)
    pub steps_per_unit: f64,
    /// Maximum speed in mm/s
    pub max_feedrate: f64,
    /// Acceleration in mm/s²
    pub acceleration: f64,
    /// Speed the drive can jump to or from instantaneously, in mm/s
    pub instant_dv: f64,
}

/// Travel limits of a linear axis, used when an endstop is hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub min: f64,
    pub max: f64,
}

/// Planner tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Number of slots in the look-ahead ring
    #[serde(default = "default_look_ahead_capacity")]
    pub look_ahead_capacity: usize,

    /// Pending entries required before the smoothing sweeps run while more
    /// moves are still expected
    #[serde(default = "default_look_ahead_depth")]
    pub look_ahead_depth: usize,

    /// Number of slots in the motion ring feeding the step interrupt
    #[serde(default = "default_motion_ring_capacity")]
    pub motion_ring_capacity: usize,

    /// Interrupt period in seconds while no segment is executing
    #[serde(default = "default_standby_interval")]
    pub standby_interval: f64,

    /// Moves are only split at the centre probe point when both halves
    /// are longer than this (mm)
    #[serde(default = "default_min_split_distance")]
    pub min_split_distance: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            look_ahead_capacity: default_look_ahead_capacity(),
            look_ahead_depth: default_look_ahead_depth(),
            motion_ring_capacity: default_motion_ring_capacity(),
            standby_interval: default_standby_interval(),
            min_split_distance: default_min_split_distance(),
        }
    }
}

fn default_look_ahead_capacity() -> usize {
    30
}

fn default_look_ahead_depth() -> usize {
    20
}

fn default_motion_ring_capacity() -> usize {
    5
}

fn default_standby_interval() -> f64 {
    2.0e-4
}

fn default_min_split_distance() -> f64 {
    0.1
}

fn default_drives() -> [DriveConfig; DRIVES] {
    const STEPS_PER_UNIT: [f64; DRIVES] = [80.0, 80.0, 4000.0, 420.0, 420.0];
    const MAX_FEEDRATES: [f64; DRIVES] = [50.0, 50.0, 3.0, 20.0, 20.0];
    const ACCELERATIONS: [f64; DRIVES] = [800.0, 800.0, 10.0, 250.0, 250.0];
    const INSTANT_DVS: [f64; DRIVES] = [15.0, 15.0, 0.2, 2.0, 2.0];

    std::array::from_fn(|drive| DriveConfig {
        steps_per_unit: STEPS_PER_UNIT[drive],
        max_feedrate: MAX_FEEDRATES[drive],
        acceleration: ACCELERATIONS[drive],
        instant_dv: INSTANT_DVS[drive],
    })
}

fn default_axes() -> [AxisConfig; AXES] {
    [
        AxisConfig { min: 0.0, max: 220.0 },
        AxisConfig { min: 0.0, max: 200.0 },
        AxisConfig { min: 0.0, max: 200.0 },
    ]
}

/// Complete description of the machine as seen by the motion core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Axes first, then extruders
    #[serde(default = "default_drives")]
    pub drives: [DriveConfig; DRIVES],

    #[serde(default = "default_axes")]
    pub axes: [AxisConfig; AXES],
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            drives: default_drives(),
            axes: default_axes(),
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (drive, d) in self.drives.iter().enumerate() {
            for (field, value) in [
                ("steps_per_unit", d.steps_per_unit),
                ("max_feedrate", d.max_feedrate),
                ("acceleration", d.acceleration),
                ("instant_dv", d.instant_dv),
            ] {
                if !(value > 0.0) {
                    return Err(ConfigError::NonPositive {
                        drive,
                        field,
                        value,
                    });
                }
            }
        }

        for (axis, a) in self.axes.iter().enumerate() {
            if !(a.min < a.max) {
                return Err(ConfigError::AxisRange {
                    axis,
                    min: a.min,
                    max: a.max,
                });
            }
        }

        let p = &self.planner;
        if p.look_ahead_capacity < 4 {
            return Err(ConfigError::TooSmall {
                field: "planner.look_ahead_capacity",
                value: p.look_ahead_capacity,
                min: 4,
            });
        }
        if p.motion_ring_capacity < 3 {
            return Err(ConfigError::TooSmall {
                field: "planner.motion_ring_capacity",
                value: p.motion_ring_capacity,
                min: 3,
            });
        }
        // The sweeps must be able to trigger before the ring reports full
        if p.look_ahead_depth + 2 >= p.look_ahead_capacity {
            return Err(ConfigError::LookAheadDepth {
                depth: p.look_ahead_depth,
                capacity: p.look_ahead_capacity,
            });
        }
        if !(p.standby_interval > 0.0) {
            return Err(ConfigError::NonPositivePlanner {
                field: "planner.standby_interval",
                value: p.standby_interval,
            });
        }
        if p.min_split_distance < 0.0 {
            return Err(ConfigError::NonPositivePlanner {
                field: "planner.min_split_distance",
                value: p.min_split_distance,
            });
        }

        Ok(())
    }

    pub fn drive_table(&self) -> DriveTable {
        DriveTable {
            steps_per_unit: self.drives.map(|d| d.steps_per_unit),
            max_feedrate: self.drives.map(|d| d.max_feedrate),
            acceleration: self.drives.map(|d| d.acceleration),
            instant_dv: self.drives.map(|d| d.instant_dv),
            axis_min: self.axes.map(|a| a.min),
            axis_max: self.axes.map(|a| a.max),
        }
    }
}

/// Per-drive limits laid out as flat arrays for the vector helpers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveTable {
    pub steps_per_unit: [f64; DRIVES],
    pub max_feedrate: [f64; DRIVES],
    pub acceleration: [f64; DRIVES],
    pub instant_dv: [f64; DRIVES],
    pub axis_min: [f64; AXES],
    pub axis_max: [f64; AXES],
}

impl DriveTable {
    /// Instantaneous dv of the slowest drive; the speed every stop ends at.
    pub fn slowest_instant_dv(&self) -> f64 {
        self.instant_dv.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn to_steps(&self, drive: usize, units: f64) -> i64 {
        (units * self.steps_per_unit[drive]).round() as i64
    }

    pub fn to_units(&self, drive: usize, steps: i64) -> f64 {
        steps as f64 / self.steps_per_unit[drive]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MachineConfig::default().validate().unwrap();
    }

    #[test]
    fn slowest_drive_is_z() {
        let table = MachineConfig::default().drive_table();
        assert_eq!(table.slowest_instant_dv(), 0.2);
    }

    #[test]
    fn steps_round_trip() {
        let table = MachineConfig::default().drive_table();
        assert_eq!(table.to_steps(0, 10.0), 800);
        assert_eq!(table.to_units(0, 800), 10.0);
        assert_eq!(table.to_steps(2, -0.00012), 0);
    }

    #[test]
    fn rejects_zero_acceleration() {
        let mut config = MachineConfig::default();
        config.drives[1].acceleration = 0.0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonPositive {
                drive: 1,
                field: "acceleration",
                value: 0.0
            })
        );
    }

    #[test]
    fn rejects_depth_without_headroom() {
        let mut config = MachineConfig::default();
        config.planner.look_ahead_depth = 28;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LookAheadDepth { .. })
        ));
    }

    #[test]
    fn rejects_inverted_axis() {
        let mut config = MachineConfig::default();
        config.axes[2] = AxisConfig { min: 5.0, max: 5.0 };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AxisRange { axis: 2, .. })
        ));
    }
}
