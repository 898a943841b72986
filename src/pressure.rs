//! Register-pressure tracking for the candidate selector.
//!
//! Pressure is tracked per *pressure set* (a group of interchangeable
//! registers aggregated as one count). Each unit carries a precomputed
//! delta per set (from its def/use counts, see the graph builder); nothing
//! here recomputes liveness. The three quantities the selector consumes:
//!
//! - *excess pressure*: `max(new, t) - max(old, t)` against a per-model
//!   threshold `t`, damping noise below the floor;
//! - *critical-max delta*: growth over the maximum pressure observed so far
//!   across all active scheduling boundaries;
//! - *current-max delta*: growth over the pre-scheduling (original program
//!   order) maximum, a fixed baseline computed once.
//!
//! When several sets exceed the threshold at once their contributions are
//! combined by `max` across sets, not summed: the selector compares
//! candidates by their single worst regression, and summing would
//! double-count a unit whose defs land in overlapping sets.

use crate::boundary::SchedDir;
use crate::graph::SUnit;
use std::fmt;

/// Identity of a pressure set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PressureSetId(pub u32);

impl PressureSetId {
    /// The index of this set in per-set tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PressureSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pset{}", self.0)
    }
}

/// Per-boundary running pressure, one count per set. A boundary owns its
/// state exclusively; the shared aggregates live in [`PressureTracker`].
#[derive(Clone, Debug)]
pub struct PressureState {
    current: Vec<i64>,
}

impl PressureState {
    /// Zero pressure in every set.
    pub fn new(num_sets: u32) -> PressureState {
        PressureState {
            current: vec![0; num_sets as usize],
        }
    }

    /// Current pressure in one set.
    pub fn current(&self, set: usize) -> i64 {
        self.current[set]
    }

    /// A unit's delta as seen from a boundary direction: scheduling
    /// bottom-up walks the block in reverse, so the forecast sign flips.
    fn signed_delta(su: &SUnit, set: usize, dir: SchedDir) -> i64 {
        let d = su.pressure_delta.get(set).copied().unwrap_or(0) as i64;
        match dir {
            SchedDir::TopDown => d,
            SchedDir::BottomUp => -d,
        }
    }
}

/// Region-wide pressure aggregates shared by all boundaries: the damping
/// threshold, the fixed original-order baseline, and the running maximum
/// across boundaries.
pub struct PressureTracker {
    threshold: i64,
    baseline_max: Vec<i64>,
    critical_max: Vec<i64>,
}

impl PressureTracker {
    /// A tracker over `baseline_max` (the per-set original-order maxima,
    /// see `DepGraph::baseline_max_pressure`) with a uniform damping
    /// threshold.
    pub fn new(baseline_max: Vec<i64>, threshold: i64) -> PressureTracker {
        let critical_max = vec![0; baseline_max.len()];
        PressureTracker {
            threshold,
            baseline_max,
            critical_max,
        }
    }

    fn num_sets(&self) -> usize {
        self.baseline_max.len()
    }

    /// Worst-set excess pressure if `su` were scheduled next by a boundary
    /// in state `state`: `max(new, t) - max(old, t)` per set, combined by
    /// `max` across sets. Values at or below the threshold on both sides
    /// contribute zero.
    pub fn excess_after(&self, state: &PressureState, su: &SUnit, dir: SchedDir) -> i64 {
        // Relief (a negative excess) is meaningful and must survive the
        // fold, so the reduction starts from the sets, not from zero.
        (0..self.num_sets())
            .map(|set| {
                let old = state.current(set);
                let new = old + PressureState::signed_delta(su, set, dir);
                new.max(self.threshold) - old.max(self.threshold)
            })
            .max()
            .unwrap_or(0)
    }

    /// Worst-set growth over the maximum pressure observed across all
    /// active boundaries so far.
    pub fn critical_max_delta_after(
        &self,
        state: &PressureState,
        su: &SUnit,
        dir: SchedDir,
    ) -> i64 {
        let mut worst = 0;
        for set in 0..self.num_sets() {
            let new = state.current(set) + PressureState::signed_delta(su, set, dir);
            worst = worst.max((new - self.critical_max[set]).max(0));
        }
        worst
    }

    /// Worst-set growth over the fixed pre-scheduling baseline maximum.
    pub fn current_max_delta_after(
        &self,
        state: &PressureState,
        su: &SUnit,
        dir: SchedDir,
    ) -> i64 {
        let mut worst = 0;
        for set in 0..self.num_sets() {
            let new = state.current(set) + PressureState::signed_delta(su, set, dir);
            worst = worst.max((new - self.baseline_max[set]).max(0));
        }
        worst
    }

    /// Commit `su`'s deltas into a boundary's state and fold the result
    /// into the cross-boundary maxima.
    pub fn commit(&mut self, state: &mut PressureState, su: &SUnit, dir: SchedDir) {
        for set in 0..self.num_sets() {
            state.current[set] += PressureState::signed_delta(su, set, dir);
            self.critical_max[set] = self.critical_max[set].max(state.current[set]);
        }
    }

    /// The maximum pressure observed so far across boundaries, per set.
    pub fn critical_max(&self, set: usize) -> i64 {
        self.critical_max[set]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::ResourceUse;
    use smallvec::SmallVec;

    fn su_with_delta(delta: i32) -> SUnit {
        SUnit {
            latency: 1,
            resources: SmallVec::<[ResourceUse; 4]>::new(),
            depth: 0,
            height: 0,
            pressure_delta: SmallVec::from_slice(&[delta]),
        }
    }

    #[test]
    fn sub_threshold_noise_is_damped() {
        let tracker = PressureTracker::new(vec![0], 8);
        let state = PressureState::new(1);
        // 0 -> 3 stays under the floor: no excess.
        assert_eq!(tracker.excess_after(&state, &su_with_delta(3), SchedDir::TopDown), 0);
        // 0 -> 11 exceeds by 3, not 11.
        assert_eq!(tracker.excess_after(&state, &su_with_delta(11), SchedDir::TopDown), 3);
    }

    #[test]
    fn excess_straddles_the_threshold() {
        let tracker = PressureTracker::new(vec![0], 4);
        let mut state = PressureState::new(1);
        state.current[0] = 6;
        // 6 -> 3: relief back under the floor counts only down to the floor.
        assert_eq!(
            tracker.excess_after(&state, &su_with_delta(-3), SchedDir::TopDown),
            -2
        );
    }

    #[test]
    fn critical_max_tracks_across_commits() {
        let mut tracker = PressureTracker::new(vec![0], 0);
        let mut state = PressureState::new(1);
        let up2 = su_with_delta(2);
        tracker.commit(&mut state, &up2, SchedDir::TopDown);
        tracker.commit(&mut state, &up2, SchedDir::TopDown);
        assert_eq!(tracker.critical_max(0), 4);
        // Another +2 would grow the observed maximum by 2.
        assert_eq!(
            tracker.critical_max_delta_after(&state, &up2, SchedDir::TopDown),
            2
        );
        // Dropping pressure never grows it.
        assert_eq!(
            tracker.critical_max_delta_after(&state, &su_with_delta(-1), SchedDir::TopDown),
            0
        );
    }

    #[test]
    fn current_max_compares_against_fixed_baseline() {
        let tracker = PressureTracker::new(vec![3], 0);
        let mut state = PressureState::new(1);
        state.current[0] = 3;
        assert_eq!(
            tracker.current_max_delta_after(&state, &su_with_delta(1), SchedDir::TopDown),
            1
        );
        assert_eq!(
            tracker.current_max_delta_after(&state, &su_with_delta(0), SchedDir::TopDown),
            0
        );
    }

    #[test]
    fn bottom_up_flips_the_sign() {
        let tracker = PressureTracker::new(vec![0], 0);
        let mut state = PressureState::new(1);
        state.current[0] = 5;
        // A def (+1) seen bottom-up releases pressure from above the threshold.
        assert_eq!(
            tracker.excess_after(&state, &su_with_delta(1), SchedDir::BottomUp),
            -1
        );
        // From an empty set the floor clamp absorbs the relief.
        let empty = PressureState::new(1);
        assert_eq!(
            tracker.excess_after(&empty, &su_with_delta(1), SchedDir::BottomUp),
            0
        );
    }
}
