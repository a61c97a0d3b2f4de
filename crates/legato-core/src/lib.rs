//! Look-ahead motion planning and step generation.
//!
//! The crate is split along the two execution contexts of a motion
//! controller: [`controller::MoveController`] runs in the cooperative
//! spin loop and owns planning, while [`stepper::Stepper`] runs in the
//! periodic step interrupt and only ever touches the one segment it is
//! executing. The two halves share [`shared::MotionShared`].
//!
//! This crate intentionally avoids any transport- or MCU-specific
//! dependencies; hardware is reached through [`platform::StepDriver`].

pub mod config;
pub mod controller;
pub mod error;
pub mod look_ahead;
pub mod motion_ring;
pub mod platform;
pub mod segment;
pub mod shared;
pub mod sim;
pub mod stepper;
pub mod transform;
pub mod vector;

/// Linear axes with absolute positioning (X, Y, Z).
pub const AXES: usize = 3;
/// Extrusion drives with relative positioning.
pub const EXTRUDERS: usize = 2;
/// Every motor-driven degree of freedom: axes first, then extruders.
pub const DRIVES: usize = AXES + EXTRUDERS;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

pub use config::{DriveTable, MachineConfig};
pub use controller::{ControllerState, MoveController, UserPosition};
pub use error::{ConfigError, MotionError};
pub use platform::{EndstopHit, EndstopMask, MoveSource, RequestedMove, StepDriver};
pub use stepper::Stepper;
pub use transform::TransformState;
