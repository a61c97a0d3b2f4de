//! Step generation for a single planned move (a "DDA").
//!
//! A [`MotionSegment`] is initialised from a [`PlannedMove`] in the spin
//! loop, then handed to the step interrupt, which calls [`MotionSegment::step`]
//! once per tick. Every axis is advanced with a multi-dimensional
//! Bresenham accumulator against the drive with the most steps, and the
//! tick period follows a trapezoidal (or triangular) velocity profile.

use crate::{
    AXES, DRIVES, EXTRUDERS,
    config::DriveTable,
    look_ahead::PlannedMove,
    platform::{EndstopHit, EndstopMask, RequestedMove, StepDriver},
};
use tracing::error;

/// Shape of the velocity profile computed for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Trapezoid: the feed rate is reached and held
    Moving,
    /// Triangle: peaks below the feed rate
    NoFlat,
    /// Triangle, and the entry or exit velocity had to be reduced to fit
    Changed,
    /// Nothing to step
    NoMove,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileOutcome {
    pub profile: Profile,
    pub entry: f64,
    pub exit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Running,
    Finished,
    /// Stopped early by an endstop; one entry per axis
    Endstop { hits: [EndstopHit; AXES] },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MotionSegment {
    delta: [i64; DRIVES],
    forward: [bool; DRIVES],
    counter: [i64; DRIVES],
    stepped: [i64; DRIVES],
    total_steps: i64,

    start: [i64; DRIVES],
    endpoint: [i64; DRIVES],
    distance: f64,
    acceleration: f64,
    feed_rate: f64,
    min_speed: f64,

    entry_velocity: f64,
    exit_velocity: f64,
    accel_distance: f64,
    accel_end_step: i64,
    decel_start_step: i64,

    velocity: f64,
    time_step: f64,
    step_index: i64,
    active: bool,
    pause_decelerating: bool,
    exit_change: Option<f64>,

    endstops: EndstopMask,
    raw_extrusion: [f64; EXTRUDERS],
    request: Option<RequestedMove>,
    report_completion: bool,
    isolated: bool,
}

impl MotionSegment {
    /// Prepare to execute `mv` starting from `start` (machine steps).
    ///
    /// `entry` and `exit` are the planned velocities at either end. If they
    /// cannot both be met over the move the returned outcome carries the
    /// reduced values and [`Profile::Changed`].
    pub fn init(
        &mut self,
        mv: &PlannedMove,
        start: &[i64; DRIVES],
        drives: &DriveTable,
        entry: f64,
        exit: f64,
    ) -> ProfileOutcome {
        self.active = false;
        self.pause_decelerating = false;
        self.exit_change = None;
        self.endstops = mv.endstops;
        self.raw_extrusion = mv.raw_extrusion;
        self.request = mv.request;
        self.report_completion = mv.report_completion;
        self.isolated = false;

        let mut total_steps = 0;
        let mut axis_distance = 0.0;
        let mut extruder_distance = 0.0;
        for drive in 0..DRIVES {
            let signed = if drive < AXES {
                self.start[drive] = start[drive];
                mv.endpoint[drive] - start[drive]
            } else {
                self.start[drive] = 0;
                mv.endpoint[drive]
            };
            self.endpoint[drive] = mv.endpoint[drive];

            let units = drives.to_units(drive, signed);
            if drive < AXES {
                axis_distance += units * units;
            } else {
                extruder_distance += units * units;
            }

            self.forward[drive] = signed >= 0;
            self.delta[drive] = signed.abs();
            total_steps = total_steps.max(self.delta[drive]);
        }

        self.total_steps = total_steps;
        if total_steps == 0 {
            return ProfileOutcome {
                profile: Profile::NoMove,
                entry,
                exit,
            };
        }

        self.counter = [-total_steps / 2; DRIVES];
        self.stepped = [0; DRIVES];
        self.step_index = 0;

        self.distance = axis_distance.sqrt();
        if self.distance <= 0.0 {
            // Extrude-only move
            self.distance = extruder_distance.sqrt();
        }
        self.acceleration = mv.acceleration;
        self.feed_rate = mv.feed_rate;
        self.min_speed = mv.min_speed;

        let outcome = self.acceleration_calculation(entry, exit);

        self.velocity = outcome.entry;
        if self.velocity <= 0.0 {
            error!(
                velocity = self.velocity,
                "segment entry velocity is not positive; substituting the slowest drive's instantaneous dv"
            );
            self.velocity = drives.slowest_instant_dv();
        }
        self.time_step = self.distance / (self.total_steps as f64 * self.velocity);

        outcome
    }

    /// Place the acceleration-end and deceleration-start steps for entry
    /// velocity `u` and exit velocity `v`.
    pub fn acceleration_calculation(&mut self, mut u: f64, mut v: f64) -> ProfileOutcome {
        let n = self.total_steps as f64;
        let a = self.acceleration;
        let f = self.feed_rate;
        let distance = self.distance;

        // d = (F² - u²) / 2a
        let d = 0.5 * (f * f - u * u) / a;
        let mut accel_end = (d * n / distance).round() as i64;
        self.accel_distance = d;

        // d = (v² - F²) / 2a, zero or negative
        let d = 0.5 * (v * v - f * f) / a;
        let mut decel_start = self.total_steps + (d * n / distance).round() as i64;

        let mut profile = Profile::Moving;
        if accel_end >= decel_start {
            profile = Profile::NoFlat;

            // Point at which to stop accelerating and start decelerating
            let mut crossing = 0.5 * (0.5 * (v * v - u * u) / a + distance);

            if crossing < 0.0 || crossing > distance {
                // u and v cannot both be met; reduce the larger so a single
                // ramp spans the distance exactly
                profile = Profile::Changed;
                let ramp = 2.0 * a * distance;
                if v > u {
                    v = (u * u + ramp).sqrt();
                    crossing = distance;
                } else {
                    u = (v * v + ramp).sqrt();
                    crossing = 0.0;
                }
            }

            accel_end = (crossing * n / distance) as i64;
            decel_start = accel_end + 1;
            self.accel_distance = crossing;
        }

        self.accel_end_step = accel_end;
        self.decel_start_step = decel_start;
        self.entry_velocity = u;
        self.exit_velocity = v;

        ProfileOutcome {
            profile,
            entry: u,
            exit: v,
        }
    }

    /// Commit directions and arm the first tick.
    pub fn start<D: StepDriver>(&mut self, driver: &mut D) {
        for drive in 0..DRIVES {
            driver.set_direction(drive, self.forward[drive]);
        }
        let extruding = self.delta[AXES..].iter().any(|&d| d > 0);
        driver.set_extruding(extruding);
        self.active = true;
        driver.schedule_interrupt(self.time_step);
    }

    /// One interrupt tick.
    pub fn step<D: StepDriver>(
        &mut self,
        driver: &mut D,
        pausing: bool,
        stop_velocity: f64,
    ) -> StepOutcome {
        if !self.active {
            return StepOutcome::Finished;
        }

        if pausing && !self.pause_decelerating {
            self.pause_decelerating = true;
            let previous_exit = self.exit_velocity;
            let outcome = self.acceleration_calculation(self.entry_velocity, stop_velocity);
            if outcome.exit != previous_exit {
                self.exit_change = Some(outcome.exit);
            }
        }

        let mut hits = [EndstopHit::NoStop; AXES];
        let mut stopped = false;
        for drive in 0..DRIVES {
            self.counter[drive] += self.delta[drive];
            if self.counter[drive] > 0 {
                if drive < AXES || driver.extrusion_permitted(drive) {
                    driver.step(drive);
                }
                self.counter[drive] -= self.total_steps;
                self.stepped[drive] += 1;

                if drive < AXES && self.endstops.has_axis(drive) {
                    let hit = driver.endstop(drive);
                    if matches!(hit, EndstopHit::LowHit | EndstopHit::HighHit) {
                        hits[drive] = hit;
                        stopped = true;
                    }
                }
            }
        }

        if stopped {
            self.freeze();
            return StepOutcome::Endstop { hits };
        }

        // Average distance per step rather than the reference axis' step
        // length, to keep the accumulated timing error down
        self.time_step = self.distance / (self.total_steps as f64 * self.velocity);
        if self.step_index < self.accel_end_step {
            self.velocity += self.acceleration * self.time_step;
            if self.velocity > self.feed_rate {
                self.velocity = self.feed_rate;
            }
        }
        if self.step_index >= self.decel_start_step {
            self.velocity -= self.acceleration * self.time_step;
            if self.velocity < self.min_speed {
                self.velocity = self.min_speed;
            }
        }
        self.step_index += 1;
        self.active = self.step_index < self.total_steps;

        if self.active {
            driver.schedule_interrupt(self.time_step);
            StepOutcome::Running
        } else {
            StepOutcome::Finished
        }
    }

    /// Stop where the segment is, keeping the steps already emitted.
    pub fn abort(&mut self) {
        if self.active {
            self.freeze();
        }
    }

    fn freeze(&mut self) {
        for drive in 0..DRIVES {
            let travelled = self.signed_stepped(drive);
            self.endpoint[drive] = self.start[drive] + travelled;
        }
        self.active = false;
    }

    fn signed_stepped(&self, drive: usize) -> i64 {
        if self.forward[drive] {
            self.stepped[drive]
        } else {
            -self.stepped[drive]
        }
    }

    /// Fraction of a drive's planned steps that were actually emitted.
    pub fn completed_fraction(&self, drive: usize) -> f64 {
        if self.delta[drive] == 0 {
            if self.step_index >= self.total_steps { 1.0 } else { 0.0 }
        } else {
            self.stepped[drive] as f64 / self.delta[drive] as f64
        }
    }

    /// Update the entry velocity of a segment that has not started yet.
    pub fn set_entry_velocity(&mut self, velocity: f64) {
        if self.active || self.step_index > 0 {
            return;
        }
        let exit = self.exit_velocity;
        let outcome = self.acceleration_calculation(velocity, exit);
        self.velocity = outcome.entry.max(self.min_speed);
        self.time_step = self.distance / (self.total_steps as f64 * self.velocity);
    }

    pub fn has_exit_change(&self) -> bool {
        self.exit_change.is_some()
    }

    pub fn take_exit_change(&mut self) -> Option<f64> {
        self.exit_change.take()
    }

    pub fn mark_isolated(&mut self) {
        self.isolated = true;
        self.report_completion = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub fn reports_completion(&self) -> bool {
        self.report_completion
    }

    pub fn total_steps(&self) -> i64 {
        self.total_steps
    }

    pub fn step_index(&self) -> i64 {
        self.step_index
    }

    pub fn accel_end_step(&self) -> i64 {
        self.accel_end_step
    }

    pub fn decel_start_step(&self) -> i64 {
        self.decel_start_step
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn feed_rate(&self) -> f64 {
        self.feed_rate
    }

    pub fn entry_velocity(&self) -> f64 {
        self.entry_velocity
    }

    pub fn exit_velocity(&self) -> f64 {
        self.exit_velocity
    }

    /// Highest velocity the profile reaches.
    pub fn peak_velocity(&self) -> f64 {
        let u = self.entry_velocity;
        (u * u + 2.0 * self.acceleration * self.accel_distance)
            .max(0.0)
            .sqrt()
    }

    /// Target in machine steps: absolute for axes, relative for extruders.
    /// Shortened to the travelled distance after an endstop hit or abort.
    pub fn endpoint(&self) -> &[i64; DRIVES] {
        &self.endpoint
    }

    pub fn delta(&self, drive: usize) -> i64 {
        self.delta[drive]
    }

    pub fn raw_extrusion(&self) -> &[f64; EXTRUDERS] {
        &self.raw_extrusion
    }

    pub fn request(&self) -> Option<RequestedMove> {
        self.request
    }

    /// Feed rate the move was requested at, before the speed factor.
    pub fn requested_feed_rate(&self) -> Option<f64> {
        self.request.map(|request| request.feed_rate)
    }

    pub fn endstops(&self) -> EndstopMask {
        self.endstops
    }
}
