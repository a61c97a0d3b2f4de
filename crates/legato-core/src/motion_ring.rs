//! Hand-off queue between the spin loop and the step interrupt.
//!
//! The ring is guarded by a flag rather than a blocking lock: whoever finds
//! it held simply tries again on its next pass. Slots are individually
//! wrapped so they can be filled in place without `unsafe`; they are only
//! ever accessed while the ring flag is held, so `try_lock` on a slot never
//! contends in practice.

use crate::{
    error::{MotionError, Result},
    segment::MotionSegment,
};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use parking_lot::Mutex;

pub struct MotionRing {
    slots: Box<[Mutex<MotionSegment>]>,
    add: AtomicUsize,
    get: AtomicUsize,
    locked: AtomicBool,
}

impl MotionRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Mutex::new(MotionSegment::default()))
                .collect(),
            add: AtomicUsize::new(0),
            get: AtomicUsize::new(0),
            locked: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Take the ring flag, or `None` if the other context holds it.
    pub fn try_lock(&self) -> Option<RingGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RingGuard { ring: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

/// Exclusive access to the motion ring; released on drop.
pub struct RingGuard<'a> {
    ring: &'a MotionRing,
}

impl RingGuard<'_> {
    fn next(&self, index: usize) -> usize {
        (index + 1) % self.ring.slots.len()
    }

    fn cursors(&self) -> (usize, usize) {
        (
            self.ring.add.load(Ordering::Acquire),
            self.ring.get.load(Ordering::Acquire),
        )
    }

    pub fn len(&self) -> usize {
        let (add, get) = self.cursors();
        (add + self.ring.slots.len() - get) % self.ring.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        let (add, get) = self.cursors();
        add == get
    }

    /// The slot after the tail is kept free as well, so the interrupt
    /// never reads a slot that is being refilled.
    pub fn is_full(&self) -> bool {
        let (add, get) = self.cursors();
        self.next(self.next(add)) == get
    }

    /// Fill the slot at the tail with `fill`, then publish it.
    pub fn try_push<R>(&self, fill: impl FnOnce(&mut MotionSegment) -> R) -> Result<R> {
        if self.is_full() {
            return Err(MotionError::MotionRingFull);
        }
        let add = self.ring.add.load(Ordering::Acquire);
        let mut slot = self.ring.slots[add]
            .try_lock()
            .ok_or(MotionError::MotionSlotBusy { index: add })?;
        let out = fill(&mut slot);
        drop(slot);
        self.ring.add.store(self.next(add), Ordering::Release);
        Ok(out)
    }

    /// Copy the oldest segment out and advance past it.
    pub fn pop(&self) -> Option<MotionSegment> {
        let (add, get) = self.cursors();
        if add == get {
            return None;
        }
        let segment = *self.ring.slots[get].try_lock()?;
        self.ring.get.store(self.next(get), Ordering::Release);
        Some(segment)
    }

    /// Run `f` on the oldest queued segment without removing it.
    pub fn with_front<R>(&self, f: impl FnOnce(&mut MotionSegment) -> R) -> Option<R> {
        let (add, get) = self.cursors();
        if add == get {
            return None;
        }
        let mut slot = self.ring.slots[get].try_lock()?;
        Some(f(&mut slot))
    }

    pub fn drain(&self, mut f: impl FnMut(&MotionSegment)) {
        while let Some(segment) = self.pop() {
            f(&segment);
        }
    }
}

impl Drop for RingGuard<'_> {
    fn drop(&mut self) {
        self.ring.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive() {
        let ring = MotionRing::new(3);
        let guard = ring.try_lock().unwrap();
        assert!(ring.is_locked());
        assert!(ring.try_lock().is_none());
        drop(guard);
        assert!(!ring.is_locked());
        assert!(ring.try_lock().is_some());
    }

    #[test]
    fn two_slots_stay_free() {
        let ring = MotionRing::new(5);
        let guard = ring.try_lock().unwrap();
        for _ in 0..3 {
            guard.try_push(|_| ()).unwrap();
        }
        assert!(guard.is_full());
        assert_eq!(guard.try_push(|_| ()), Err(MotionError::MotionRingFull));
        assert_eq!(guard.len(), 3);

        guard.pop().unwrap();
        assert!(!guard.is_full());
        guard.try_push(|_| ()).unwrap();
        assert!(guard.is_full());
    }

    #[test]
    fn smallest_ring_holds_one_segment() {
        let ring = MotionRing::new(3);
        let guard = ring.try_lock().unwrap();
        guard.try_push(|_| ()).unwrap();
        assert!(guard.is_full());
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn pops_in_order() {
        let ring = MotionRing::new(4);
        let guard = ring.try_lock().unwrap();
        for _ in 0..3 {
            guard.try_push(|s| s.mark_isolated()).unwrap();
            assert!(guard.pop().unwrap().is_isolated());
        }
        assert!(guard.pop().is_none());
        assert!(guard.is_empty());
    }

    #[test]
    fn drain_empties_ring() {
        let ring = MotionRing::new(4);
        let guard = ring.try_lock().unwrap();
        guard.try_push(|_| ()).unwrap();
        guard.try_push(|_| ()).unwrap();
        let mut count = 0;
        guard.drain(|_| count += 1);
        assert_eq!(count, 2);
        assert!(guard.is_empty());
    }
}
