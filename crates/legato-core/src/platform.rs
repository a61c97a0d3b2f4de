//! Interfaces to the collaborators around the motion core.

use crate::{AXES, DRIVES, X_AXIS, Y_AXIS, Z_AXIS};
use serde::{Deserialize, Serialize};

/// State of an endstop as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndstopHit {
    NoStop,
    LowHit,
    HighHit,
    /// Close to the low stop; informational only
    ApproachingLow,
}

/// Which axes a move must check endstops on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndstopMask(u8);

impl EndstopMask {
    const PROBE: u8 = 1 << 7;

    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn with_axis(mut self, axis: usize) -> Self {
        self.0 |= 1 << axis;
        self
    }

    pub const fn with_x(self) -> Self {
        self.with_axis(X_AXIS)
    }

    pub const fn with_y(self) -> Self {
        self.with_axis(Y_AXIS)
    }

    pub const fn with_z(self) -> Self {
        self.with_axis(Z_AXIS)
    }

    /// Treat a low Z hit as a probe trigger instead of homing
    pub const fn probing(mut self) -> Self {
        self.0 |= Self::PROBE;
        self
    }

    pub const fn has_axis(&self, axis: usize) -> bool {
        axis < AXES && self.0 & (1 << axis) != 0
    }

    pub const fn is_probing(&self) -> bool {
        self.0 & Self::PROBE != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 & !Self::PROBE == 0
    }
}

/// A move as requested by the command front end, in user coordinates.
///
/// Axis entries are absolute positions; extruder entries are relative
/// amounts of filament for this move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestedMove {
    pub position: [f64; DRIVES],
    /// mm/s
    pub feed_rate: f64,
    #[serde(default)]
    pub endstops: EndstopMask,
}

impl RequestedMove {
    pub fn new(position: [f64; DRIVES], feed_rate: f64) -> Self {
        Self {
            position,
            feed_rate,
            endstops: EndstopMask::new(),
        }
    }

    pub fn with_endstops(mut self, endstops: EndstopMask) -> Self {
        self.endstops = endstops;
        self
    }
}

/// The command front end, polled once per spin.
pub trait MoveSource {
    fn try_read_next_move(&mut self) -> Option<RequestedMove>;

    /// `false` once the source is drained, so the planner must get ready to
    /// stop at the end of what it already has.
    fn more_moves_expected(&self) -> bool;

    /// A requested move has been accepted into the plan.
    fn move_queued(&mut self) {}

    /// A requested move has finished executing.
    fn move_completed(&mut self) {}
}

/// Pin- and timer-level hardware primitives used from interrupt context.
///
/// Implementations must not allocate or block.
pub trait StepDriver {
    fn set_direction(&mut self, drive: usize, forward: bool);

    fn step(&mut self, drive: usize);

    fn endstop(&mut self, drive: usize) -> EndstopHit;

    /// Extruders may be held back, e.g. by a cold-extrusion guard.
    fn extrusion_permitted(&self, _drive: usize) -> bool {
        true
    }

    /// Drives the output coupled to extrusion (typically a cooling fan).
    fn set_extruding(&mut self, _extruding: bool) {}

    /// Request the next step interrupt `seconds` from now.
    fn schedule_interrupt(&mut self, seconds: f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endstop_mask_axes() {
        let mask = EndstopMask::new().with_x().with_z();
        assert!(mask.has_axis(X_AXIS));
        assert!(!mask.has_axis(Y_AXIS));
        assert!(mask.has_axis(Z_AXIS));
        assert!(!mask.has_axis(3));
        assert!(!mask.is_probing());
        assert!(!mask.is_empty());
    }

    #[test]
    fn probe_flag_is_not_an_axis() {
        let mask = EndstopMask::new().probing();
        assert!(mask.is_probing());
        assert!(mask.is_empty());
        assert!(EndstopMask::new().with_z().probing().has_axis(Z_AXIS));
    }
}
