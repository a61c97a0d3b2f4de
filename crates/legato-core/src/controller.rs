//! Spin-loop side of the motion core.
//!
//! [`MoveController::spin`] is called repeatedly from the main loop. Each
//! call forwards completions reported by the interrupt, runs one planning
//! pass, hands at most one settled move to the motion ring and reads at
//! most one new move. Pause, resume and cancel are driven from here too.

use crate::{
    AXES, DRIVES, EXTRUDERS, X_AXIS, Y_AXIS,
    config::{DriveTable, MachineConfig, PlannerConfig},
    error::{ConfigError, MotionError, Result},
    look_ahead::{LookAheadRing, PlannedMove},
    platform::{MoveSource, RequestedMove, StepDriver},
    segment::{MotionSegment, Profile},
    shared::MotionShared,
    stepper::Stepper,
    transform::{BedCompensation, TransformState},
    vector,
};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    /// Waiting for the live segment to come to a stop
    Pausing,
    Paused,
    /// Waiting for the live segment to be abandoned
    Cancelled,
}

/// A position in user coordinates (mm) with the feed rate it was reached at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserPosition {
    pub coords: [f64; DRIVES],
    pub feed_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct PausePoint {
    machine: [i64; DRIVES],
    user: UserPosition,
}

/// A requested move waiting to be planned again after a pause.
#[derive(Debug, Clone, Copy)]
struct ReplayMove {
    request: RequestedMove,
    report_completion: bool,
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Source,
    Replay { report_completion: bool },
    SplitRemainder,
}

pub struct MoveController<S: MoveSource> {
    source: S,
    shared: Arc<MotionShared>,
    look_ahead: LookAheadRing,
    transform: TransformState,
    drives: DriveTable,
    planner: PlannerConfig,
    state: ControllerState,

    /// Axis target of the newest planned move, in user coordinates
    last_user: [f64; AXES],
    speed_factor: f64,
    extrusion_factors: [f64; EXTRUDERS],

    pending_split: Option<RequestedMove>,
    replay: VecDeque<ReplayMove>,
    pause_point: Option<PausePoint>,
    resume_requested: bool,
    /// An endstop-checked move is in the plan; the origin must be re-read
    /// from the live position once it finishes
    awaiting_endstop_move: bool,
}

impl<S: MoveSource> MoveController<S> {
    /// Build both halves of the motion core. The returned [`Stepper`] must
    /// be driven from the step interrupt.
    pub fn new<D: StepDriver>(
        config: MachineConfig,
        source: S,
        driver: D,
    ) -> core::result::Result<(Self, Stepper<D>), ConfigError> {
        config.validate()?;

        let shared = Arc::new(MotionShared::new(&config));
        let drives = shared.drives;
        let planner = config.planner;
        let look_ahead = LookAheadRing::new(
            planner.look_ahead_capacity,
            planner.look_ahead_depth,
            drives,
            [0; DRIVES],
        );

        let controller = Self {
            source,
            shared: shared.clone(),
            look_ahead,
            transform: TransformState::new(),
            drives,
            planner,
            state: ControllerState::Running,
            last_user: [0.0; AXES],
            speed_factor: 1.0,
            extrusion_factors: [1.0; EXTRUDERS],
            pending_split: None,
            replay: VecDeque::new(),
            pause_point: None,
            resume_requested: false,
            awaiting_endstop_move: false,
        };
        let stepper = Stepper::new(driver, shared);

        Ok((controller, stepper))
    }

    pub fn spin(&mut self) {
        for _ in 0..self.shared.take_completed() {
            self.source.move_completed();
        }

        match self.state {
            ControllerState::Running => self.spin_running(),
            ControllerState::Pausing => self.spin_pausing(),
            ControllerState::Paused => self.spin_paused(),
            ControllerState::Cancelled => self.spin_cancelled(),
        }
    }

    fn more_expected(&self) -> bool {
        !self.awaiting_endstop_move
            && (self.source.more_moves_expected() || !self.replay.is_empty())
    }

    fn spin_running(&mut self) {
        let more_expected = self.more_expected();
        let in_split = self.pending_split.is_some();
        self.look_ahead
            .run_planning_pass(more_expected, in_split, self.shared.stop_velocity);

        self.transfer_one();

        if self.awaiting_endstop_move && !self.resync_after_endstop_move() {
            return;
        }

        if !self.look_ahead.is_full() {
            self.read_one();
        }
    }

    /// Move one settled entry from the look-ahead ring to the motion ring.
    fn transfer_one(&mut self) {
        let Some(guard) = self.shared.ring.try_lock() else {
            return;
        };
        if guard.is_full() {
            return;
        }
        let Some(taken) = self.look_ahead.try_take_completed() else {
            return;
        };

        let mut segment = MotionSegment::default();
        let outcome = segment.init(
            &taken.planned,
            &taken.start,
            &self.drives,
            taken.entry_velocity,
            taken.planned.velocity(),
        );
        match outcome.profile {
            Profile::NoMove => {
                drop(guard);
                if taken.planned.report_completion {
                    self.source.move_completed();
                }
                return;
            }
            Profile::Changed => {
                debug!(
                    entry = outcome.entry,
                    exit = outcome.exit,
                    "velocities reduced at hand-off"
                );
            }
            Profile::Moving | Profile::NoFlat => {}
        }

        if let Err(err) = guard.try_push(|slot| *slot = segment) {
            error!(%err, "motion ring refused a segment it had room for");
        }
    }

    /// True once the endstop-checked move has finished and the plan origin
    /// has been taken from where the machine actually stopped.
    fn resync_after_endstop_move(&mut self) -> bool {
        if !self.look_ahead.is_empty() {
            return false;
        }
        let Some(guard) = self.shared.ring.try_lock() else {
            return false;
        };
        if !guard.is_empty() || self.shared.is_segment_live() {
            return false;
        }
        drop(guard);

        self.reset_origin_from_live();
        self.awaiting_endstop_move = false;
        debug!(position = ?self.last_user, "plan origin resynchronised after endstop move");
        true
    }

    fn reset_origin_from_live(&mut self) {
        let live = self.shared.live_steps();
        self.look_ahead.reset_origin(live);
        let user = self.live_user_position();
        self.last_user.copy_from_slice(&user.coords[..AXES]);
    }

    fn read_one(&mut self) {
        let (request, origin) = if let Some(remainder) = self.pending_split.take() {
            (remainder, Origin::SplitRemainder)
        } else if let Some(replay) = self.replay.pop_front() {
            (
                replay.request,
                Origin::Replay {
                    report_completion: replay.report_completion,
                },
            )
        } else if let Some(request) = self.source.try_read_next_move() {
            (request, Origin::Source)
        } else {
            return;
        };

        match origin {
            Origin::Source => {
                if let Some((first, second)) = self.split(&request) {
                    self.pending_split = Some(second);
                    self.append(first, false, true);
                } else {
                    self.append(request, true, true);
                }
            }
            Origin::Replay { report_completion } => {
                self.append(request, report_completion, false);
            }
            Origin::SplitRemainder => self.append(request, true, false),
        }
    }

    fn append(&mut self, request: RequestedMove, report_completion: bool, notify_queued: bool) {
        let planned = match self.plan(&request) {
            Ok(Some(planned)) => planned.with_request(request, report_completion),
            Ok(None) => {
                // Null movement: nothing to plan
                self.account_skipped(report_completion, notify_queued);
                return;
            }
            Err(err) => {
                warn!(%err, ?request, "move dropped");
                self.account_skipped(report_completion, notify_queued);
                return;
            }
        };

        let checks_endstops = !planned.endstops.is_empty();
        if let Err(err) = self.look_ahead.try_append(planned) {
            warn!(%err, "move not appended");
            return;
        }

        self.last_user.copy_from_slice(&request.position[..AXES]);
        if checks_endstops {
            self.awaiting_endstop_move = true;
        }
        if notify_queued {
            self.source.move_queued();
        }
    }

    fn account_skipped(&mut self, report_completion: bool, notify_queued: bool) {
        if notify_queued {
            self.source.move_queued();
        }
        if report_completion {
            self.source.move_completed();
        }
    }

    /// Turn a user-space request into a planned move from the current plan
    /// tail. `None` means the move rounds to no steps at all.
    fn plan(&self, request: &RequestedMove) -> Result<Option<PlannedMove>> {
        let mut position = request.position;
        for (extrusion, factor) in position[AXES..].iter_mut().zip(self.extrusion_factors) {
            *extrusion *= factor;
        }
        self.transform.transform(&mut position);

        let start = self.look_ahead.last_endpoint();
        let endpoint: [i64; DRIVES] =
            core::array::from_fn(|drive| self.drives.to_steps(drive, position[drive]));

        let null = (0..DRIVES).all(|drive| {
            if drive < AXES {
                endpoint[drive] == start[drive]
            } else {
                endpoint[drive] == 0
            }
        });
        if null {
            return Ok(None);
        }

        self.build(endpoint, &start, request.feed_rate * self.speed_factor, request)
            .map(Some)
    }

    fn build(
        &self,
        endpoint: [i64; DRIVES],
        start: &[i64; DRIVES],
        feed_rate: f64,
        request: &RequestedMove,
    ) -> Result<PlannedMove> {
        let mut direction: [f64; DRIVES] = core::array::from_fn(|drive| {
            let steps = if drive < AXES {
                endpoint[drive] - start[drive]
            } else {
                endpoint[drive]
            };
            self.drives.to_units(drive, steps)
        });
        if vector::normalise(&mut direction) <= 0.0 {
            return Err(MotionError::ZeroLengthMove);
        }
        vector::absolute(&mut direction);

        let min_speed = vector::box_intersection(&direction, &self.drives.instant_dv);
        let acceleration = vector::box_intersection(&direction, &self.drives.acceleration);
        let max_speed = vector::box_intersection(&direction, &self.drives.max_feedrate);

        let mut raw_extrusion = [0.0; EXTRUDERS];
        raw_extrusion.copy_from_slice(&request.position[AXES..]);

        Ok(PlannedMove::new(
            endpoint,
            feed_rate,
            min_speed,
            max_speed,
            acceleration,
            request.endstops,
        )
        .with_raw_extrusion(raw_extrusion))
    }

    /// Split a move at the centre probe point of a 5-point bed, so each half
    /// stays within one pair of compensation triangles.
    ///
    /// The crossing fraction is taken per axis and averaged when both X and
    /// Y cross, which only approximates the true crossing for diagonal moves.
    fn split(&self, request: &RequestedMove) -> Option<(RequestedMove, RequestedMove)> {
        if !matches!(self.transform.bed(), BedCompensation::Triangulated { .. }) {
            return None;
        }
        let (cx, cy) = self.transform.triangulation_centre()?;
        let min = self.planner.min_split_distance;

        let mut fractions = 0.0;
        let mut crossings = 0;
        for (axis, centre) in [(X_AXIS, cx), (Y_AXIS, cy)] {
            let from = self.last_user[axis];
            let to = request.position[axis];
            let before = centre - from;
            let after = to - centre;
            if before * after > 0.0 && before.abs() > min && after.abs() > min {
                fractions += before / (to - from);
                crossings += 1;
            }
        }
        if crossings == 0 {
            return None;
        }
        let fraction = fractions / crossings as f64;

        let mut first = *request;
        let mut second = *request;
        for axis in 0..AXES {
            let from = self.last_user[axis];
            first.position[axis] = from + fraction * (request.position[axis] - from);
        }
        for drive in AXES..DRIVES {
            first.position[drive] = request.position[drive] * fraction;
            second.position[drive] = request.position[drive] - first.position[drive];
        }
        debug!(fraction, "move split at triangulation centre");
        Some((first, second))
    }

    fn spin_pausing(&mut self) {
        let Some(guard) = self.shared.ring.try_lock() else {
            return;
        };
        if self.shared.is_segment_live() {
            return;
        }

        let machine = self.shared.live_steps();
        let user = self.live_user_position();

        let mut replay = VecDeque::new();
        guard.drain(|segment| {
            if let Some(request) = segment.request() {
                replay.push_back(ReplayMove {
                    request,
                    report_completion: segment.reports_completion(),
                });
            }
        });
        drop(guard);
        self.look_ahead.drain(|planned| {
            if let Some(request) = planned.request {
                replay.push_back(ReplayMove {
                    request,
                    report_completion: planned.report_completion,
                });
            }
        });
        if let Some(remainder) = self.pending_split.take() {
            replay.push_back(ReplayMove {
                request: remainder,
                report_completion: true,
            });
        }
        replay.append(&mut self.replay);
        self.replay = replay;

        self.look_ahead.reset_origin(machine);
        self.last_user.copy_from_slice(&user.coords[..AXES]);
        self.awaiting_endstop_move = false;
        self.pause_point = Some(PausePoint { machine, user });
        self.state = ControllerState::Paused;
        info!(position = ?user.coords, pending = self.replay.len(), "paused");
    }

    fn spin_paused(&mut self) {
        if !self.resume_requested || self.shared.is_isolated_busy() {
            return;
        }
        let Some(pause) = self.pause_point else {
            self.finish_resume(None);
            return;
        };

        let live = self.shared.live_steps();
        if live[..AXES] != pause.machine[..AXES] {
            let mut target = pause.machine;
            target[AXES..].fill(0);
            if let Some(segment) = self.isolated_segment(target, pause.user.feed_rate) {
                self.shared.try_submit_isolated(segment);
                return;
            }
        }

        self.finish_resume(Some(pause));
    }

    fn finish_resume(&mut self, pause: Option<PausePoint>) {
        if let Some(pause) = pause {
            self.shared.set_feed_rate(pause.user.feed_rate);
        }
        self.look_ahead.reset_origin(self.shared.live_steps());
        self.resume_requested = false;
        self.pause_point = None;
        self.shared.set_pausing(false);
        self.state = ControllerState::Running;
        info!("resumed");
    }

    fn spin_cancelled(&mut self) {
        let Some(guard) = self.shared.ring.try_lock() else {
            return;
        };
        if self.shared.is_segment_live() {
            return;
        }
        guard.drain(|_| {});
        drop(guard);

        self.look_ahead.drain(|_| {});
        self.replay.clear();
        self.pending_split = None;
        self.pause_point = None;
        self.resume_requested = false;
        self.awaiting_endstop_move = false;
        self.shared.cancel_isolated();
        self.reset_origin_from_live();

        self.shared.set_pausing(false);
        self.shared.set_abort(false);
        self.state = ControllerState::Running;
        info!("cancelled");
    }

    /// Segment moving straight from the live position to `target` (machine
    /// steps), bypassing both rings.
    fn isolated_segment(&self, target: [i64; DRIVES], feed_rate: f64) -> Option<MotionSegment> {
        self.isolated_segment_with(target, feed_rate, &RequestedMove::new([0.0; DRIVES], feed_rate))
    }

    fn isolated_segment_with(
        &self,
        target: [i64; DRIVES],
        feed_rate: f64,
        request: &RequestedMove,
    ) -> Option<MotionSegment> {
        let start = self.shared.live_steps();
        let planned = match self.build(target, &start, feed_rate, request) {
            Ok(planned) => planned,
            Err(err) => {
                debug!(%err, "isolated move skipped");
                return None;
            }
        };

        let stop = self.shared.stop_velocity;
        let mut segment = MotionSegment::default();
        if segment.init(&planned, &start, &self.drives, stop, stop).profile == Profile::NoMove {
            return None;
        }
        segment.mark_isolated();
        Some(segment)
    }

    /// Request a pause. The live segment decelerates to a stop and the
    /// remaining plan is kept for [`Self::resume`].
    pub fn pause(&mut self) {
        if self.state != ControllerState::Running {
            return;
        }
        self.shared.set_pausing(true);
        self.state = ControllerState::Pausing;
        info!("pausing");
    }

    /// Return to the pause point, then carry on with the kept plan.
    pub fn resume(&mut self) {
        if self.state == ControllerState::Paused {
            self.resume_requested = true;
        }
    }

    /// Abandon everything, including the live segment.
    pub fn cancel(&mut self) {
        self.shared.set_abort(true);
        self.state = ControllerState::Cancelled;
        info!("cancelling");
    }

    /// Execute a single move while paused, outside the plan.
    ///
    /// Returns `false` if not paused, or an earlier isolated move has not
    /// finished yet.
    pub fn try_isolated_move(&mut self, request: RequestedMove) -> bool {
        if self.state != ControllerState::Paused
            || self.resume_requested
            || self.shared.is_isolated_busy()
        {
            return false;
        }

        let mut position = request.position;
        self.transform.transform(&mut position);
        let target = core::array::from_fn(|drive| self.drives.to_steps(drive, position[drive]));

        match self.isolated_segment_with(target, request.feed_rate, &request) {
            Some(segment) => self.shared.try_submit_isolated(segment),
            // Nowhere to go
            None => true,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// True when nothing is planned, queued or moving and the source is dry.
    pub fn is_idle(&self) -> bool {
        if self.state != ControllerState::Running
            || self.source.more_moves_expected()
            || !self.replay.is_empty()
            || self.pending_split.is_some()
            || !self.look_ahead.is_empty()
            || self.shared.is_segment_live()
            || self.shared.is_isolated_busy()
            || self.shared.has_pending_completions()
        {
            return false;
        }
        self.shared
            .ring
            .try_lock()
            .is_some_and(|guard| guard.is_empty())
    }

    /// Where the machine is now, in user coordinates.
    pub fn live_user_position(&self) -> UserPosition {
        let live = self.shared.live_steps();
        let mut coords: [f64; DRIVES] =
            core::array::from_fn(|drive| self.drives.to_units(drive, live[drive]));
        self.transform.inverse_transform(&mut coords);
        UserPosition {
            coords,
            feed_rate: self.shared.feed_rate(),
        }
    }

    /// Where the machine stopped when it was last paused.
    pub fn pause_user_position(&self) -> Option<UserPosition> {
        self.pause_point.map(|pause| pause.user)
    }

    pub fn reset_extruder_accumulators(&mut self) {
        self.shared.reset_extruders();
    }

    /// Filament requested so far for an extruder, before extrusion factors.
    pub fn raw_extrusion_total(&self, extruder: usize) -> f64 {
        self.shared.raw_extrusion(extruder)
    }

    pub fn is_homed(&self, axis: usize) -> bool {
        self.shared.is_homed(axis)
    }

    pub fn last_probe_height(&self) -> Option<f64> {
        self.shared.last_probe_height()
    }

    pub fn transform(&self) -> &TransformState {
        &self.transform
    }

    /// Changes apply to moves read from now on.
    pub fn transform_mut(&mut self) -> &mut TransformState {
        &mut self.transform
    }

    pub fn set_speed_factor(&mut self, factor: f64) {
        if factor > 0.0 {
            self.speed_factor = factor;
        } else {
            warn!(factor, "ignoring non-positive speed factor");
        }
    }

    pub fn set_extrusion_factor(&mut self, extruder: usize, factor: f64) {
        match self.extrusion_factors.get_mut(extruder) {
            Some(slot) if factor >= 0.0 => *slot = factor,
            _ => warn!(extruder, factor, "ignoring extrusion factor"),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
