//! In-memory collaborators and a discrete-event runner.
//!
//! [`Simulation`] alternates the spin loop and the step interrupt on a
//! simulated clock, advancing time by whatever interval the interrupt last
//! asked for. It is what the tests and the `simulate` command run on.

use crate::{
    AXES, DRIVES,
    config::MachineConfig,
    controller::MoveController,
    error::ConfigError,
    platform::{EndstopHit, MoveSource, RequestedMove, StepDriver},
    stepper::Stepper,
};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Trigger {
    position: i64,
    hit: EndstopHit,
}

/// A [`StepDriver`] that counts pulses instead of toggling pins.
#[derive(Debug, Clone, Default)]
pub struct RecordingDriver {
    pub pulses: [u64; DRIVES],
    /// Signed pulse count, following the last direction set
    pub position: [i64; DRIVES],
    pub forward: [bool; DRIVES],
    pub extruding: bool,
    /// Extruders refusing to move
    pub cold: [bool; DRIVES],
    pub last_interval: f64,
    /// Every scheduled interval, when `record_intervals` is set
    pub intervals: Vec<f64>,
    pub record_intervals: bool,
    triggers: [Option<Trigger>; AXES],
}

impl RecordingDriver {
    /// Report `hit` on `axis` once its position reaches `position` steps
    /// (from above for a low stop, from below for a high stop).
    pub fn trigger_at(&mut self, axis: usize, position: i64, hit: EndstopHit) {
        self.triggers[axis] = Some(Trigger { position, hit });
    }

    pub fn clear_triggers(&mut self) {
        self.triggers = [None; AXES];
    }
}

impl StepDriver for RecordingDriver {
    fn set_direction(&mut self, drive: usize, forward: bool) {
        self.forward[drive] = forward;
    }

    fn step(&mut self, drive: usize) {
        self.pulses[drive] += 1;
        self.position[drive] += if self.forward[drive] { 1 } else { -1 };
    }

    fn endstop(&mut self, drive: usize) -> EndstopHit {
        let Some(Some(trigger)) = self.triggers.get(drive) else {
            return EndstopHit::NoStop;
        };
        let position = self.position[drive];
        let triggered = match trigger.hit {
            EndstopHit::LowHit | EndstopHit::ApproachingLow => position <= trigger.position,
            EndstopHit::HighHit => position >= trigger.position,
            EndstopHit::NoStop => false,
        };
        if triggered { trigger.hit } else { EndstopHit::NoStop }
    }

    fn extrusion_permitted(&self, drive: usize) -> bool {
        !self.cold[drive]
    }

    fn set_extruding(&mut self, extruding: bool) {
        self.extruding = extruding;
    }

    fn schedule_interrupt(&mut self, seconds: f64) {
        self.last_interval = seconds;
        if self.record_intervals {
            self.intervals.push(seconds);
        }
    }
}

/// A [`MoveSource`] replaying a fixed list of moves.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    moves: VecDeque<RequestedMove>,
    pub queued: usize,
    pub completed: usize,
}

impl ScriptedSource {
    pub fn new(moves: impl IntoIterator<Item = RequestedMove>) -> Self {
        Self {
            moves: moves.into_iter().collect(),
            queued: 0,
            completed: 0,
        }
    }

    pub fn push(&mut self, mv: RequestedMove) {
        self.moves.push_back(mv);
    }

    pub fn remaining(&self) -> usize {
        self.moves.len()
    }
}

impl MoveSource for ScriptedSource {
    fn try_read_next_move(&mut self) -> Option<RequestedMove> {
        self.moves.pop_front()
    }

    fn more_moves_expected(&self) -> bool {
        !self.moves.is_empty()
    }

    fn move_queued(&mut self) {
        self.queued += 1;
    }

    fn move_completed(&mut self) {
        self.completed += 1;
    }
}

pub struct Simulation<S: MoveSource, D: StepDriver> {
    pub controller: MoveController<S>,
    pub stepper: Stepper<D>,
    /// Simulated seconds elapsed
    pub clock: f64,
    pub ticks: u64,
}

impl<S: MoveSource> Simulation<S, RecordingDriver> {
    pub fn new(
        config: MachineConfig,
        source: S,
        driver: RecordingDriver,
    ) -> Result<Self, ConfigError> {
        let (controller, stepper) = MoveController::new(config, source, driver)?;
        Ok(Self {
            controller,
            stepper,
            clock: 0.0,
            ticks: 0,
        })
    }

    /// One spin followed by one interrupt.
    pub fn tick(&mut self) {
        self.controller.spin();
        self.stepper.on_interrupt();
        self.clock += self.stepper.driver().last_interval;
        self.ticks += 1;
    }

    /// Run until everything has been executed. Returns `false` if
    /// `max_ticks` ran out first.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> bool {
        self.run_until(|controller| controller.is_idle(), max_ticks)
    }

    pub fn run_until(
        &mut self,
        mut done: impl FnMut(&MoveController<S>) -> bool,
        max_ticks: u64,
    ) -> bool {
        for _ in 0..max_ticks {
            self.tick();
            if done(&self.controller) && !self.stepper.is_active() {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_tracks_direction() {
        let mut driver = RecordingDriver::default();
        driver.set_direction(1, true);
        driver.step(1);
        driver.step(1);
        driver.set_direction(1, false);
        driver.step(1);
        assert_eq!(driver.pulses[1], 3);
        assert_eq!(driver.position[1], 1);
    }

    #[test]
    fn low_trigger_fires_at_position() {
        let mut driver = RecordingDriver::default();
        driver.trigger_at(0, -2, EndstopHit::LowHit);
        driver.step(0);
        assert_eq!(driver.endstop(0), EndstopHit::NoStop);
        driver.step(0);
        assert_eq!(driver.endstop(0), EndstopHit::LowHit);
        assert_eq!(driver.endstop(3), EndstopHit::NoStop);
    }

    #[test]
    fn source_reports_exhaustion() {
        let mut source = ScriptedSource::new([RequestedMove::new([1.0; DRIVES], 10.0)]);
        assert!(source.more_moves_expected());
        assert!(source.try_read_next_move().is_some());
        assert!(!source.more_moves_expected());
        assert!(source.try_read_next_move().is_none());
    }

    #[test]
    fn idle_simulation_stays_idle() {
        let mut sim = Simulation::new(
            MachineConfig::default(),
            ScriptedSource::default(),
            RecordingDriver::default(),
        )
        .unwrap();
        assert!(sim.run_until_idle(10));
        assert_eq!(sim.ticks, 1);
        assert_eq!(sim.stepper.driver().last_interval, 2.0e-4);
    }
}
