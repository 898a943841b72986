//! The diagnostics bundle emitted alongside a schedule: the per-cycle
//! reservation table, per-unit issue cycles, the critical resource, and the
//! hazard-induced stalls, plus a pretty-printer for the schedule table.

use crate::graph::SUnitIndex;
use crate::reservation::ReservationRow;
use crate::resource::{ResourceId, ResourceModel};
use std::fmt::Write;

/// Why a unit could not dispatch at some cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallKind {
    /// Operand not ready: a data hazard.
    Data,
    /// Resource or buffer unavailable: a structural hazard.
    Structural,
    /// Latency-device chaining delayed the unit's consumption without
    /// blocking its dispatch.
    Soft,
}

/// One stall observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stall {
    /// The stalled unit.
    pub su: SUnitIndex,
    /// The cursor position at which the stall was observed.
    pub at_cycle: u64,
    /// How many cycles the unit was held up.
    pub cycles: u64,
    /// The hazard class.
    pub kind: StallKind,
}

/// Everything the simulator learned about a region besides the order
/// itself.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    /// Issue cycle per unit, in the time base of the boundary that
    /// dispatched it (bottom-up cycles count from the region's end).
    pub issue_cycle: Vec<Option<u64>>,
    /// Committed reservations, one row per (unit, resource, unit-track).
    pub rows: Vec<ReservationRow>,
    /// Observed stalls, in observation order.
    pub stalls: Vec<Stall>,
    /// The resource whose normalized accumulated occupancy is highest,
    /// with that occupancy; `None` if nothing was reserved.
    pub critical_resource: Option<(ResourceId, u64)>,
    /// Latency-weighted critical-path length of the region.
    pub critical_path: u64,
    /// Cycles from first issue to last completion (top-down time base).
    pub elapsed_cycles: u64,
}

impl Diagnostics {
    /// A bundle with no recorded activity, for `n` units.
    pub fn empty(n: usize) -> Diagnostics {
        Diagnostics {
            issue_cycle: vec![None; n],
            ..Diagnostics::default()
        }
    }

    /// Total cycles lost to stalls of one kind.
    pub fn stall_cycles(&self, kind: StallKind) -> u64 {
        self.stalls
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.cycles)
            .sum()
    }
}

/// Pretty-printing with a `ResourceModel` context, which supplies proper
/// resource names.
pub trait ShowWithModel {
    /// Render with the model's resource names.
    fn show_with_model(&self, model: &ResourceModel) -> String;
}

impl ShowWithModel for ReservationRow {
    fn show_with_model(&self, model: &ResourceModel) -> String {
        format!(
            "[{:>4}, {:>4})  {}.{}  su{}",
            self.start,
            self.end,
            model.name(self.resource),
            self.unit,
            self.su
        )
    }
}

impl ShowWithModel for Diagnostics {
    fn show_with_model(&self, model: &ResourceModel) -> String {
        let mut s = String::new();
        writeln!(s, "schedule table:").expect("write");
        let mut rows = self.rows.clone();
        rows.sort_by_key(|r| (r.start, r.resource, r.unit));
        for row in &rows {
            writeln!(s, "  {}", row.show_with_model(model)).expect("write");
        }
        for (su, cycle) in self.issue_cycle.iter().enumerate() {
            if let Some(cycle) = cycle {
                writeln!(s, "  su{} issued at cycle {}", su, cycle).expect("write");
            }
        }
        if let Some((r, occ)) = self.critical_resource {
            writeln!(
                s,
                "critical resource: {} (normalized occupancy {}, path bound {})",
                model.name(r),
                occ,
                self.critical_path
            )
            .expect("write");
        }
        if !self.stalls.is_empty() {
            writeln!(s, "stalls:").expect("write");
            for stall in &self.stalls {
                writeln!(
                    s,
                    "  su{} at cycle {}: {:?} hazard, {} cycle(s)",
                    stall.su, stall.at_cycle, stall.kind, stall.cycles
                )
                .expect("write");
            }
        }
        s
    }
}
