//! Ring of planned moves awaiting execution.
//!
//! Moves are appended at the tail and taken from the head once planning
//! has settled their velocities. The slot just before the head always
//! holds the most recently taken move, which supplies the start position
//! and entry velocity for the head.

use crate::{
    AXES, DRIVES, EXTRUDERS,
    config::DriveTable,
    error::{MotionError, Result},
    platform::{EndstopMask, RequestedMove},
    segment::{MotionSegment, Profile},
};
use tracing::{error, trace};

/// Planning state of a look-ahead entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Unprocessed,
    /// Junction velocity limited by the corner with its successor
    JunctionVelocitySet,
    /// Ready to be taken
    Complete,
    /// Taken (or never filled); the slot may be reused
    Released,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::JunctionVelocitySet => "junction velocity set",
            Self::Complete => "complete",
            Self::Released => "released",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedMove {
    /// Machine steps; absolute for axes, relative for extruders
    pub endpoint: [i64; DRIVES],
    pub feed_rate: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub acceleration: f64,
    pub endstops: EndstopMask,
    /// Extrusion before the extrusion factor was applied, in mm
    pub raw_extrusion: [f64; EXTRUDERS],
    /// What was asked for, kept so the move can be replayed after a pause
    pub request: Option<RequestedMove>,
    pub report_completion: bool,
    /// Velocity at the end of this move
    velocity: f64,
    state: ProcessingState,
    cosine: Option<f64>,
}

impl PlannedMove {
    pub fn new(
        endpoint: [i64; DRIVES],
        feed_rate: f64,
        min_speed: f64,
        max_speed: f64,
        acceleration: f64,
        endstops: EndstopMask,
    ) -> Self {
        let feed_rate = feed_rate.max(min_speed).min(max_speed);
        Self {
            endpoint,
            feed_rate,
            min_speed,
            max_speed,
            acceleration,
            endstops,
            raw_extrusion: [0.0; EXTRUDERS],
            request: None,
            report_completion: true,
            velocity: feed_rate,
            state: ProcessingState::Unprocessed,
            cosine: None,
        }
    }

    /// A placeholder standing for "the machine is at `endpoint`, moving at
    /// `velocity`".
    pub fn origin(endpoint: [i64; DRIVES], velocity: f64) -> Self {
        let mut mv = Self::new(endpoint, velocity, velocity, velocity, 1.0, EndstopMask::new());
        mv.state = ProcessingState::Released;
        mv
    }

    pub fn with_endstops(mut self, endstops: EndstopMask) -> Self {
        self.endstops = endstops;
        self
    }

    pub fn with_request(mut self, request: RequestedMove, report_completion: bool) -> Self {
        self.request = Some(request);
        self.report_completion = report_completion;
        self
    }

    pub fn with_raw_extrusion(mut self, raw_extrusion: [f64; EXTRUDERS]) -> Self {
        self.raw_extrusion = raw_extrusion;
        self
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }
}

/// A move released by [`LookAheadRing::try_take_completed`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakenMove {
    pub planned: PlannedMove,
    /// Endpoint of the move before it, in machine steps
    pub start: [i64; DRIVES],
    pub entry_velocity: f64,
}

pub struct LookAheadRing {
    entries: Box<[PlannedMove]>,
    add: usize,
    get: usize,
    depth: usize,
    drives: DriveTable,
    scratch: MotionSegment,
}

impl LookAheadRing {
    pub fn new(capacity: usize, depth: usize, drives: DriveTable, origin: [i64; DRIVES]) -> Self {
        let velocity = drives.slowest_instant_dv();
        Self {
            entries: vec![PlannedMove::origin(origin, velocity); capacity].into_boxed_slice(),
            add: 0,
            get: 0,
            depth,
            drives,
            scratch: MotionSegment::default(),
        }
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.entries.len()
    }

    fn prev(&self, index: usize) -> usize {
        (index + self.entries.len() - 1) % self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        (self.add + self.entries.len() - self.get) % self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.add == self.get
    }

    /// One slot stays free and another holds the previous move.
    pub fn is_full(&self) -> bool {
        self.next(self.next(self.add)) == self.get
    }

    pub fn try_append(&mut self, mv: PlannedMove) -> Result<()> {
        if self.is_full() {
            return Err(MotionError::RingFull);
        }
        let slot = &mut self.entries[self.add];
        if slot.state != ProcessingState::Released {
            error!(index = self.add, state = slot.state.as_str(), "look-ahead slot not released");
            return Err(MotionError::SlotNotReleased {
                index: self.add,
                state: slot.state.as_str(),
            });
        }

        *slot = mv;
        slot.state = ProcessingState::Unprocessed;
        slot.cosine = None;
        self.add = self.next(self.add);
        Ok(())
    }

    /// Axis endpoint of the newest move, or of the previous move when empty.
    pub fn last_endpoint(&self) -> [i64; DRIVES] {
        self.entries[self.prev(self.add)].endpoint
    }

    pub fn try_take_completed(&mut self) -> Option<TakenMove> {
        if self.is_empty() || self.entries[self.get].state != ProcessingState::Complete {
            return None;
        }
        let previous = &self.entries[self.prev(self.get)];
        let taken = TakenMove {
            planned: self.entries[self.get],
            start: previous.endpoint,
            entry_velocity: previous.velocity,
        };
        self.entries[self.get].state = ProcessingState::Released;
        self.get = self.next(self.get);
        Some(taken)
    }

    /// Smooth velocities across the pending moves.
    ///
    /// `more_expected` is false once the source has nothing further to
    /// give, which lets the tail be brought to a stop. `in_split` holds the
    /// tail open while the second half of a split move is still to come.
    pub fn run_planning_pass(&mut self, more_expected: bool, in_split: bool, stop_velocity: f64) {
        if self.is_empty() {
            return;
        }
        let newest = self.prev(self.add);

        if !more_expected || self.len() > self.depth {
            // Forward: limit each exit by what is reachable from its entry
            let mut index = self.get;
            while index != newest {
                if self.entries[index].state == ProcessingState::JunctionVelocitySet {
                    self.recalculate(index);
                }
                index = self.next(index);
            }

            // Backward: limit each entry by the stop that follows
            let mut index = newest;
            loop {
                if self.entries[index].state == ProcessingState::JunctionVelocitySet {
                    self.recalculate(index);
                    self.entries[index].state = ProcessingState::Complete;
                }
                if index == self.get {
                    break;
                }
                index = self.prev(index);
            }
        }

        let mut index = self.get;
        while index != newest {
            let next = self.next(index);
            if self.entries[index].state == ProcessingState::Unprocessed {
                let cosine = self.cosine(index);
                let current = &self.entries[index];
                let following = &self.entries[next];
                let floor = current.min_speed.min(following.min_speed);
                let ceiling = current.max_speed.min(current.feed_rate.min(following.feed_rate));
                let velocity = (current.velocity * cosine).max(floor).min(ceiling);

                let entry = &mut self.entries[index];
                entry.velocity = velocity;
                entry.state = ProcessingState::JunctionVelocitySet;
                trace!(index, cosine, velocity, "junction velocity");
            }
            index = next;
        }

        if !more_expected && !in_split {
            // Settled by the sweeps on the next pass
            let tail = &mut self.entries[newest];
            if tail.state == ProcessingState::Unprocessed || tail.velocity > stop_velocity {
                tail.velocity = stop_velocity;
                tail.state = ProcessingState::JunctionVelocitySet;
            }
        }
    }

    fn recalculate(&mut self, index: usize) {
        let prev = self.prev(index);
        let entry = self.entries[prev].velocity;
        let exit = self.entries[index].velocity;
        let start = self.entries[prev].endpoint;
        let outcome = self
            .scratch
            .init(&self.entries[index], &start, &self.drives, entry, exit);
        if outcome.profile == Profile::Changed {
            // Taken moves are already executing
            if self.entries[prev].state != ProcessingState::Released {
                self.entries[prev].velocity = outcome.entry;
            }
            self.entries[index].velocity = outcome.exit;
        }
    }

    /// Cosine of the angle between this move and the next, in mm space.
    fn cosine(&mut self, index: usize) -> f64 {
        if let Some(cosine) = self.entries[index].cosine {
            return cosine;
        }
        let prev = &self.entries[self.prev(index)];
        let current = &self.entries[index];
        let next = &self.entries[self.next(index)];

        let mut dot = 0.0;
        let mut a2 = 0.0;
        let mut b2 = 0.0;
        for drive in 0..DRIVES {
            let (m1, m2) = if drive < AXES {
                (
                    self.drives.to_units(drive, current.endpoint[drive] - prev.endpoint[drive]),
                    self.drives.to_units(drive, next.endpoint[drive] - current.endpoint[drive]),
                )
            } else {
                (
                    self.drives.to_units(drive, current.endpoint[drive]),
                    self.drives.to_units(drive, next.endpoint[drive]),
                )
            };
            dot += m1 * m2;
            a2 += m1 * m1;
            b2 += m2 * m2;
        }
        let cosine = if a2 <= 0.0 || b2 <= 0.0 {
            0.0
        } else {
            dot / (a2.sqrt() * b2.sqrt())
        };
        self.entries[index].cosine = Some(cosine);
        cosine
    }

    /// Remove every pending move, oldest first.
    pub fn drain(&mut self, mut f: impl FnMut(&PlannedMove)) {
        while !self.is_empty() {
            let entry = &mut self.entries[self.get];
            f(entry);
            entry.state = ProcessingState::Released;
            self.get = self.next(self.get);
        }
    }

    /// Forget the plan and restart from `endpoint`, at rest.
    pub fn reset_origin(&mut self, endpoint: [i64; DRIVES]) {
        let velocity = self.drives.slowest_instant_dv();
        let index = self.prev(self.get);
        self.entries[index] = PlannedMove::origin(endpoint, velocity);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlannedMove> {
        let len = self.len();
        let start = self.get;
        let capacity = self.entries.len();
        (0..len).map(move |offset| &self.entries[(start + offset) % capacity])
    }
}
