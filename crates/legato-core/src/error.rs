use thiserror::Error;

/// Faults raised on the planning path.
///
/// None of these ever cross into the interrupt context; callers log them
/// and recover locally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("look-ahead ring is full")]
    RingFull,
    #[error("look-ahead slot {index} is still in use (state {state})")]
    SlotNotReleased { index: usize, state: &'static str },
    #[error("attempt to normalise a zero-length move")]
    ZeroLengthMove,
    #[error("point ({x}, {y}) is outside all compensation triangles")]
    OutsideTriangles { x: f64, y: f64 },
    #[error("bed compensation needs at least 3 probe points, {recorded} recorded")]
    ProbePointsIncomplete { recorded: usize },
    #[error("{points} probe points do not span an area of the bed")]
    DegenerateProbePoints { points: usize },
    #[error("probe point index {index} out of range (max {max})")]
    ProbeIndex { index: usize, max: usize },
    #[error("motion ring is full while a transfer was expected to succeed")]
    MotionRingFull,
    #[error("motion ring slot {index} is still active")]
    MotionSlotBusy { index: usize },
}

pub type Result<T, E = MotionError> = std::result::Result<T, E>;

/// Invalid machine configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("drive {drive}: {field} must be positive, got {value}")]
    NonPositive {
        drive: usize,
        field: &'static str,
        value: f64,
    },
    #[error("axis {axis}: minimum {min} is not below maximum {max}")]
    AxisRange { axis: usize, min: f64, max: f64 },
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        value: usize,
        min: usize,
    },
    #[error("look-ahead depth {depth} leaves no headroom in a ring of {capacity}")]
    LookAheadDepth { depth: usize, capacity: usize },
    #[error("{field} must be positive, got {value}")]
    NonPositivePlanner { field: &'static str, value: f64 },
}
