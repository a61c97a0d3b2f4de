//! State shared between the spin loop and the step interrupt.
//!
//! Plain values are atomics; the only compound hand-offs are the motion
//! ring and the isolated-move slot, both of which are polled with
//! non-blocking locks.

use crate::{
    AXES, DRIVES, EXTRUDERS, Z_AXIS,
    config::{DriveTable, MachineConfig},
    motion_ring::MotionRing,
    segment::MotionSegment,
};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, Ordering};
use parking_lot::Mutex;
use portable_atomic::AtomicF64;

pub struct MotionShared {
    pub(crate) ring: MotionRing,

    /// Machine steps; axes absolute, extruders accumulated since reset
    live: [AtomicI64; DRIVES],
    feed_rate: AtomicF64,
    raw_extrusion: [AtomicF64; EXTRUDERS],

    segment_live: AtomicBool,
    pausing: AtomicBool,
    abort: AtomicBool,
    completed: AtomicU32,
    homed: AtomicU8,
    /// NaN until something is probed
    probe_height: AtomicF64,

    isolated: Mutex<MotionSegment>,
    isolated_ready: AtomicBool,
    isolated_busy: AtomicBool,

    pub(crate) drives: DriveTable,
    pub(crate) stop_velocity: f64,
    pub(crate) standby_interval: f64,
}

impl MotionShared {
    pub fn new(config: &MachineConfig) -> Self {
        let drives = config.drive_table();
        Self {
            ring: MotionRing::new(config.planner.motion_ring_capacity),
            live: core::array::from_fn(|_| AtomicI64::new(0)),
            feed_rate: AtomicF64::new(0.0),
            raw_extrusion: core::array::from_fn(|_| AtomicF64::new(0.0)),
            segment_live: AtomicBool::new(false),
            pausing: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            completed: AtomicU32::new(0),
            homed: AtomicU8::new(0),
            probe_height: AtomicF64::new(f64::NAN),
            isolated: Mutex::new(MotionSegment::default()),
            isolated_ready: AtomicBool::new(false),
            isolated_busy: AtomicBool::new(false),
            stop_velocity: drives.slowest_instant_dv(),
            standby_interval: config.planner.standby_interval,
            drives,
        }
    }

    pub fn live_steps(&self) -> [i64; DRIVES] {
        core::array::from_fn(|drive| self.live[drive].load(Ordering::Acquire))
    }

    pub(crate) fn set_live_axis(&self, axis: usize, steps: i64) {
        self.live[axis].store(steps, Ordering::Release);
    }

    pub(crate) fn add_live_extrusion(&self, drive: usize, steps: i64) {
        self.live[drive].fetch_add(steps, Ordering::AcqRel);
    }

    pub(crate) fn reset_extruders(&self) {
        for drive in AXES..DRIVES {
            self.live[drive].store(0, Ordering::Release);
        }
    }

    pub fn feed_rate(&self) -> f64 {
        self.feed_rate.load(Ordering::Acquire)
    }

    pub(crate) fn set_feed_rate(&self, feed_rate: f64) {
        self.feed_rate.store(feed_rate, Ordering::Release);
    }

    /// Total filament requested for an extruder, before extrusion factors.
    pub fn raw_extrusion(&self, extruder: usize) -> f64 {
        self.raw_extrusion[extruder].load(Ordering::Acquire)
    }

    pub(crate) fn add_raw_extrusion(&self, extruder: usize, mm: f64) {
        self.raw_extrusion[extruder].fetch_add(mm, Ordering::AcqRel);
    }

    pub fn is_segment_live(&self) -> bool {
        self.segment_live.load(Ordering::Acquire)
    }

    pub(crate) fn set_segment_live(&self, live: bool) {
        self.segment_live.store(live, Ordering::Release);
    }

    pub fn is_pausing(&self) -> bool {
        self.pausing.load(Ordering::Acquire)
    }

    pub(crate) fn set_pausing(&self, pausing: bool) {
        self.pausing.store(pausing, Ordering::Release);
    }

    pub fn is_aborting(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub(crate) fn set_abort(&self, abort: bool) {
        self.abort.store(abort, Ordering::Release);
    }

    pub(crate) fn move_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Completions since the last call.
    pub(crate) fn take_completed(&self) -> u32 {
        self.completed.swap(0, Ordering::AcqRel)
    }

    /// Completions reported by the interrupt but not yet forwarded.
    pub fn has_pending_completions(&self) -> bool {
        self.completed.load(Ordering::Acquire) > 0
    }

    pub fn is_homed(&self, axis: usize) -> bool {
        axis < AXES && self.homed.load(Ordering::Acquire) & (1 << axis) != 0
    }

    pub(crate) fn mark_homed(&self, axis: usize) {
        self.homed.fetch_or(1 << axis, Ordering::AcqRel);
    }

    /// Z height in mm at the last probe trigger.
    pub fn last_probe_height(&self) -> Option<f64> {
        let height = self.probe_height.load(Ordering::Acquire);
        (!height.is_nan()).then_some(height)
    }

    pub(crate) fn record_probe(&self, z_steps: i64) {
        let height = self.drives.to_units(Z_AXIS, z_steps);
        self.probe_height.store(height, Ordering::Release);
    }

    pub fn is_isolated_busy(&self) -> bool {
        self.isolated_busy.load(Ordering::Acquire)
    }

    /// Hand a segment to the interrupt outside the motion ring.
    pub(crate) fn try_submit_isolated(&self, segment: MotionSegment) -> bool {
        if self.is_isolated_busy() {
            return false;
        }
        let Some(mut slot) = self.isolated.try_lock() else {
            return false;
        };
        *slot = segment;
        self.isolated_busy.store(true, Ordering::Release);
        self.isolated_ready.store(true, Ordering::Release);
        true
    }

    pub(crate) fn try_take_isolated(&self) -> Option<MotionSegment> {
        if !self.isolated_ready.load(Ordering::Acquire) {
            return None;
        }
        let segment = *self.isolated.try_lock()?;
        self.isolated_ready.store(false, Ordering::Release);
        Some(segment)
    }

    /// Forget an isolated move that was submitted but never started.
    pub(crate) fn cancel_isolated(&self) {
        if self.isolated_ready.swap(false, Ordering::AcqRel) {
            self.isolated_busy.store(false, Ordering::Release);
        }
    }

    pub(crate) fn isolated_finished(&self) {
        self.isolated_busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_height_starts_unset() {
        let shared = MotionShared::new(&MachineConfig::default());
        assert_eq!(shared.last_probe_height(), None);
        shared.record_probe(6000);
        assert_eq!(shared.last_probe_height(), Some(1.5));
    }

    #[test]
    fn completions_are_counted_once() {
        let shared = MotionShared::new(&MachineConfig::default());
        assert!(!shared.has_pending_completions());
        shared.move_completed();
        shared.move_completed();
        assert!(shared.has_pending_completions());
        assert_eq!(shared.take_completed(), 2);
        assert_eq!(shared.take_completed(), 0);
        assert!(!shared.has_pending_completions());
    }

    #[test]
    fn isolated_slot_holds_one_move() {
        let shared = MotionShared::new(&MachineConfig::default());
        assert!(shared.try_submit_isolated(MotionSegment::default()));
        assert!(!shared.try_submit_isolated(MotionSegment::default()));
        assert!(shared.try_take_isolated().is_some());
        assert!(shared.try_take_isolated().is_none());
        assert!(shared.is_isolated_busy());
        shared.isolated_finished();
        assert!(shared.try_submit_isolated(MotionSegment::default()));
    }

    #[test]
    fn homing_marks_axes() {
        let shared = MotionShared::new(&MachineConfig::default());
        shared.mark_homed(Z_AXIS);
        assert!(shared.is_homed(Z_AXIS));
        assert!(!shared.is_homed(0));
        assert!(!shared.is_homed(7));
    }
}
