//! Interrupt side of the motion core.
//!
//! The platform calls [`Stepper::on_interrupt`] each time the interval
//! requested through [`StepDriver::schedule_interrupt`] elapses. Nothing on
//! this path allocates, blocks or logs.

use crate::{
    AXES, DRIVES, Z_AXIS,
    platform::{EndstopHit, StepDriver},
    segment::{MotionSegment, StepOutcome},
    shared::MotionShared,
};
use std::sync::Arc;

pub struct Stepper<D: StepDriver> {
    driver: D,
    shared: Arc<MotionShared>,
    current: MotionSegment,
}

impl<D: StepDriver> Stepper<D> {
    pub(crate) fn new(driver: D, shared: Arc<MotionShared>) -> Self {
        Self {
            driver,
            shared,
            current: MotionSegment::default(),
        }
    }

    pub fn on_interrupt(&mut self) {
        if self.current.is_active() {
            self.step_current();
        } else {
            self.idle();
        }
    }

    /// Whether a segment is being stepped right now.
    pub fn is_active(&self) -> bool {
        self.current.is_active()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn idle(&mut self) {
        let shared = Arc::clone(&self.shared);
        if shared.is_aborting() {
            self.standby();
            return;
        }

        if let Some(segment) = shared.try_take_isolated() {
            self.begin(segment);
            return;
        }

        if !shared.is_pausing()
            && let Some(guard) = shared.ring.try_lock()
            && let Some(segment) = guard.pop()
        {
            // Marked live before the ring unlocks so the spin loop never
            // sees an empty ring with nothing running mid-hand-off
            shared.set_segment_live(true);
            drop(guard);
            self.begin(segment);
            return;
        }

        self.standby();
    }

    fn begin(&mut self, segment: MotionSegment) {
        self.shared.set_segment_live(true);
        if let Some(feed_rate) = segment.requested_feed_rate() {
            self.shared.set_feed_rate(feed_rate);
        }
        self.current = segment;
        self.current.start(&mut self.driver);
        self.step_current();
    }

    fn step_current(&mut self) {
        if self.shared.is_aborting() {
            self.current.abort();
            self.finish(StepOutcome::Finished);
            return;
        }

        let outcome = self.current.step(
            &mut self.driver,
            self.shared.is_pausing(),
            self.shared.stop_velocity,
        );
        self.propagate_exit_change();

        if outcome != StepOutcome::Running {
            self.finish(outcome);
        }
    }

    /// Lower the next queued segment's entry to a reduced exit velocity.
    /// Stays pending while the spin loop holds the ring.
    fn propagate_exit_change(&mut self) {
        if !self.current.has_exit_change() {
            return;
        }
        let Some(guard) = self.shared.ring.try_lock() else {
            return;
        };
        if let Some(exit) = self.current.take_exit_change() {
            guard.with_front(|next| next.set_entry_velocity(exit));
        }
    }

    fn finish(&mut self, outcome: StepOutcome) {
        let shared = &self.shared;
        let segment = &self.current;
        let endpoint = segment.endpoint();

        for axis in 0..AXES {
            shared.set_live_axis(axis, endpoint[axis]);
        }
        for drive in AXES..DRIVES {
            shared.add_live_extrusion(drive, endpoint[drive]);
            let extruder = drive - AXES;
            let raw = segment.raw_extrusion()[extruder];
            if raw != 0.0 {
                shared.add_raw_extrusion(extruder, raw * segment.completed_fraction(drive));
            }
        }

        if let StepOutcome::Endstop { hits } = outcome {
            let probing = segment.endstops().is_probing();
            for (axis, hit) in hits.into_iter().enumerate() {
                match hit {
                    EndstopHit::LowHit if probing && axis == Z_AXIS => {
                        shared.record_probe(endpoint[axis]);
                    }
                    EndstopHit::LowHit => {
                        let min = shared.drives.axis_min[axis];
                        shared.set_live_axis(axis, shared.drives.to_steps(axis, min));
                        shared.mark_homed(axis);
                    }
                    EndstopHit::HighHit => {
                        let max = shared.drives.axis_max[axis];
                        shared.set_live_axis(axis, shared.drives.to_steps(axis, max));
                        shared.mark_homed(axis);
                    }
                    EndstopHit::NoStop | EndstopHit::ApproachingLow => {}
                }
            }
        }

        if segment.is_isolated() {
            shared.isolated_finished();
        } else if segment.reports_completion() && !shared.is_aborting() {
            shared.move_completed();
        }

        shared.set_segment_live(false);
        self.standby();
    }

    fn standby(&mut self) {
        self.driver.schedule_interrupt(self.shared.standby_interval);
    }
}
