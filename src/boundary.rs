//! The scheduling boundary: per-direction queues, cursor, and the
//! `Blocked -> Pending -> Available -> Dispatched` state machine.
//!
//! A boundary schedules from one end of the region: top-down from the first
//! instruction, bottom-up from the last. Two boundaries may coexist for
//! bidirectional scheduling, each independently progressing its own cursor;
//! each writes only its private per-direction state and reads the other's
//! already-committed dispatches (single-writer-per-boundary discipline,
//! coordinated by the driver).
//!
//! Transitions:
//!
//! - `Blocked -> Pending` (*legality*): every governing-direction neighbor
//!   (predecessors for top-down, successors for bottom-up) has been
//!   dispatched, by either boundary.
//! - `Pending -> Available` (*feasibility*): the unit's ready cycle is at or
//!   before the cursor and the reservation table reports no hazard at the
//!   cursor. Latency-device users bypass strict hazard blocking and carry a
//!   soft-stall penalty computed by the selector instead.
//! - `Available -> Dispatched`: the selector picked the unit; it leaves
//!   every pool in every boundary.

use crate::graph::{DepGraph, SUnitIndex};
use crate::pressure::PressureState;
use crate::reservation::ReservationTable;
use log::trace;
use std::fmt;

/// Which end of the region a boundary schedules from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedDir {
    /// From the first instruction forward.
    TopDown,
    /// From the last instruction backward.
    BottomUp,
}

impl fmt::Display for SchedDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedDir::TopDown => write!(f, "top-down"),
            SchedDir::BottomUp => write!(f, "bottom-up"),
        }
    }
}

/// Lifecycle of one unit within one boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Some governing-direction neighbor is not yet dispatched.
    Blocked,
    /// Legal, but hazard-blocked or not yet ready.
    Pending,
    /// Legal and feasible at the current cursor.
    Available,
    /// Dispatched (by this boundary or the other one).
    Dispatched,
}

/// Scheduling state for one direction over one region.
pub struct ScheduleBoundary {
    dir: SchedDir,
    cycle: u64,
    state: Vec<UnitState>,
    /// Governing-direction neighbors not yet dispatched, per unit.
    unreleased: Vec<u32>,
    /// Data-readiness cycle in this boundary's time base, per unit.
    ready_cycle: Vec<u64>,
    pending: Vec<SUnitIndex>,
    available: Vec<SUnitIndex>,
    pressure: PressureState,
    sequence: Vec<SUnitIndex>,
}

impl ScheduleBoundary {
    /// A boundary at cycle zero. Units with no governing-direction
    /// neighbors start Pending with a zero ready cycle.
    pub fn new(graph: &DepGraph, dir: SchedDir, num_pressure_sets: u32) -> ScheduleBoundary {
        let n = graph.num_units();
        let mut unreleased = Vec::with_capacity(n);
        for su in 0..n as SUnitIndex {
            let count = match dir {
                SchedDir::TopDown => graph.preds(su).len(),
                SchedDir::BottomUp => graph.succs(su).len(),
            };
            unreleased.push(count as u32);
        }
        let mut boundary = ScheduleBoundary {
            dir,
            cycle: 0,
            state: vec![UnitState::Blocked; n],
            unreleased,
            ready_cycle: vec![0; n],
            pending: vec![],
            available: vec![],
            pressure: PressureState::new(num_pressure_sets),
            sequence: vec![],
        };
        for su in 0..n as SUnitIndex {
            if boundary.unreleased[su as usize] == 0 {
                boundary.state[su as usize] = UnitState::Pending;
                boundary.pending.push(su);
            }
        }
        boundary
    }

    /// The boundary's direction.
    pub fn dir(&self) -> SchedDir {
        self.dir
    }

    /// The cursor, in this boundary's own time base.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// State of one unit within this boundary.
    pub fn unit_state(&self, su: SUnitIndex) -> UnitState {
        self.state[su as usize]
    }

    /// Data-readiness cycle of one unit in this boundary's time base.
    pub fn ready_cycle(&self, su: SUnitIndex) -> u64 {
        self.ready_cycle[su as usize]
    }

    /// Units currently Available.
    pub fn available(&self) -> &[SUnitIndex] {
        &self.available
    }

    /// Units currently Pending.
    pub fn pending(&self) -> &[SUnitIndex] {
        &self.pending
    }

    /// Are any units Pending?
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Units dispatched by this boundary, in dispatch order.
    pub fn sequence(&self) -> &[SUnitIndex] {
        &self.sequence
    }

    /// This boundary's running pressure.
    pub fn pressure(&self) -> &PressureState {
        &self.pressure
    }

    /// Mutable access for the tracker's commit.
    pub fn pressure_mut(&mut self) -> &mut PressureState {
        &mut self.pressure
    }

    /// Run the feasibility check in both directions: demote Available units
    /// whose hazard reappeared (an earlier dispatch this cycle may have
    /// taken the last unit track), then move every Pending unit that is
    /// ready and hazard-free at the cursor into Available.
    pub fn promote(&mut self, graph: &DepGraph, table: &ReservationTable<'_>) {
        let cycle = self.cycle;
        let dir = self.dir;

        let (state, pending) = (&mut self.state, &mut self.pending);
        self.available.retain(|&su| {
            if table.can_reserve(graph.sunit(su), cycle) {
                true
            } else {
                trace!("{}: unit {} back to pending at cycle {}", dir, su, cycle);
                state[su as usize] = UnitState::Pending;
                pending.push(su);
                false
            }
        });

        let (state, available, ready_cycle) =
            (&mut self.state, &mut self.available, &self.ready_cycle);
        self.pending.retain(|&su| {
            let i = su as usize;
            if ready_cycle[i] <= cycle && table.can_reserve(graph.sunit(su), cycle) {
                trace!("{}: unit {} available at cycle {}", dir, su, cycle);
                state[i] = UnitState::Available;
                available.push(su);
                false
            } else {
                true
            }
        });
    }

    /// The earliest cursor position at which any Pending unit could become
    /// Available: the minimum over the queue of the unit's ready cycle
    /// joined with its first structurally feasible cycle. `None` when the
    /// queue is empty.
    pub fn next_pending_cycle(&self, graph: &DepGraph, table: &ReservationTable<'_>) -> Option<u64> {
        self.pending
            .iter()
            .map(|&su| {
                let ready = self.ready_cycle[su as usize];
                let from = ready.max(self.cycle);
                table
                    .first_feasible_cycle(graph.sunit(su), from)
                    .max(ready)
            })
            .min()
    }

    /// Advance the cursor. Never moves backward.
    pub fn advance_to(&mut self, cycle: u64) {
        debug_assert!(cycle >= self.cycle);
        self.cycle = cycle;
    }

    /// Record a dispatch made by this boundary. The unit must be Available.
    pub fn dispatch(&mut self, su: SUnitIndex) {
        debug_assert_eq!(self.state[su as usize], UnitState::Available);
        self.retire(su);
        self.sequence.push(su);
    }

    /// Remove a unit from every pool (because it was dispatched, here or in
    /// the other boundary).
    pub fn retire(&mut self, su: SUnitIndex) {
        self.state[su as usize] = UnitState::Dispatched;
        self.pending.retain(|&x| x != su);
        self.available.retain(|&x| x != su);
    }

    /// Propagate a dispatch to this boundary's bookkeeping: decrement the
    /// release count of each governed neighbor and, for an own-direction
    /// dispatch, push the neighbor's ready cycle to `issue + edge latency`.
    /// `issue` is `None` when the dispatch happened in the other boundary,
    /// whose time base does not constrain this one.
    pub fn release_neighbors(&mut self, graph: &DepGraph, su: SUnitIndex, issue: Option<u64>) {
        let edges = match self.dir {
            SchedDir::TopDown => graph.succs(su),
            SchedDir::BottomUp => graph.preds(su),
        };
        for edge in edges {
            let i = edge.other as usize;
            if self.state[i] == UnitState::Dispatched {
                continue;
            }
            if let Some(issue) = issue {
                let ready = issue + edge.latency as u64;
                if ready > self.ready_cycle[i] {
                    self.ready_cycle[i] = ready;
                }
            }
            debug_assert!(self.unreleased[i] > 0);
            self.unreleased[i] -= 1;
            if self.unreleased[i] == 0 && self.state[i] == UnitState::Blocked {
                trace!("{}: unit {} pending", self.dir, edge.other);
                self.state[i] = UnitState::Pending;
                self.pending.push(edge.other);
            }
        }
    }
}
