//! Candidate selection: the ordered profitability heuristics.
//!
//! The selector scans a boundary's Available units and picks the best by
//! lexicographic comparison: the first differentiator wins, ties fall
//! through to the next:
//!
//! 1. lower resulting register pressure: excess pressure, then critical-max
//!    delta, then current-max delta (see the pressure tracker);
//! 2. fewer accumulated soft-stall cycles (latency-device chaining);
//! 3. lower resulting resource pressure: how far the dispatch would push
//!    any touched resource's normalized occupancy above the critical-path
//!    bound;
//! 4. longer remaining dependency chain (greater governing-direction
//!    height), to shorten the eventual critical path;
//! 5. original program order, as the stable tie-break.

use crate::boundary::{SchedDir, ScheduleBoundary};
use crate::graph::{DepGraph, SUnitIndex};
use crate::pressure::PressureTracker;
use crate::reservation::ReservationTable;
use log::trace;
use std::cmp::Reverse;

/// Read-only state the selector consults.
pub struct SelectionContext<'a, 'm> {
    /// The dependency graph.
    pub graph: &'a DepGraph,
    /// The reservation table (for soft stalls and resource pressure).
    pub table: &'a ReservationTable<'m>,
    /// The region's pressure aggregates.
    pub tracker: &'a PressureTracker,
    /// The critical-path-length bound, in cycles, that normalized resource
    /// occupancy is held against.
    pub bound_cycles: u64,
}

type CandidateKey = (i64, i64, i64, u64, u64, Reverse<u32>, u64);

fn candidate_key(
    ctx: &SelectionContext<'_, '_>,
    boundary: &ScheduleBoundary,
    su: SUnitIndex,
) -> CandidateKey {
    let unit = ctx.graph.sunit(su);
    let dir = boundary.dir();
    let pressure = boundary.pressure();

    let excess = ctx.tracker.excess_after(pressure, unit, dir);
    let critical = ctx.tracker.critical_max_delta_after(pressure, unit, dir);
    let current = ctx.tracker.current_max_delta_after(pressure, unit, dir);
    let soft_stall = ctx.table.chain_ready(unit).saturating_sub(boundary.cycle());
    let resource_excess = ctx.table.bound_excess_after(unit, ctx.bound_cycles);
    // Prefer unblocking the longer remaining chain: height governs
    // top-down, depth governs bottom-up.
    let remaining_chain = match dir {
        SchedDir::TopDown => unit.height,
        SchedDir::BottomUp => unit.depth,
    };
    let order = match dir {
        SchedDir::TopDown => su as u64,
        SchedDir::BottomUp => u64::MAX - su as u64,
    };

    (
        excess,
        critical,
        current,
        soft_stall,
        resource_excess,
        Reverse(remaining_chain),
        order,
    )
}

/// Pick the best Available unit of a boundary, or `None` when the queue is
/// empty.
pub fn select_best(
    ctx: &SelectionContext<'_, '_>,
    boundary: &ScheduleBoundary,
) -> Option<SUnitIndex> {
    let best = boundary
        .available()
        .iter()
        .copied()
        .min_by_key(|&su| candidate_key(ctx, boundary, su))?;
    trace!(
        "{}: selected unit {} at cycle {} (key {:?})",
        boundary.dir(),
        best,
        boundary.cycle(),
        candidate_key(ctx, boundary, best)
    );
    Some(best)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::InstrDesc;
    use crate::pressure::{PressureSetId, PressureTracker};
    use crate::reservation::ReservationTable;
    use crate::resource::{ProcResourceDesc, ResourceModelBuilder};

    const SET0: PressureSetId = PressureSetId(0);

    #[test]
    fn pressure_outranks_chain_length() {
        let mut b = ResourceModelBuilder::new(2);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();

        // Unit 0 raises pressure past the threshold, unit 1 lowers it, yet
        // unit 0 has the taller remaining chain.
        let instrs = vec![
            InstrDesc::new(8).def(0, SET0).def(1, SET0).resource(p, 0, 1),
            InstrDesc::new(1).use_of(2, SET0).resource(p, 0, 1),
            InstrDesc::new(1).use_of(0, SET0).use_of(1, SET0).resource(p, 0, 1),
        ];
        let graph = DepGraph::build(&model, &instrs, 1).unwrap();
        let table = ReservationTable::new(&model);
        let tracker = PressureTracker::new(graph.baseline_max_pressure(), 0);
        let mut bd = ScheduleBoundary::new(&graph, SchedDir::TopDown, 1);
        bd.promote(&graph, &table);

        let ctx = SelectionContext {
            graph: &graph,
            table: &table,
            tracker: &tracker,
            bound_cycles: graph.critical_path() as u64,
        };
        assert_eq!(select_best(&ctx, &bd), Some(1));
    }

    #[test]
    fn taller_chain_breaks_pressure_ties() {
        use crate::graph::{EdgeKind, ResourceUse, SUnit};
        use smallvec::SmallVec;

        let mut b = ResourceModelBuilder::new(2);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();

        // No operands anywhere: pressure and resource keys tie. Unit 1
        // heads the taller chain.
        let su = |latency| SUnit {
            latency,
            resources: SmallVec::from_slice(&[ResourceUse {
                resource: p,
                acquire_at: 0,
                release_at: 1,
            }]),
            depth: 0,
            height: 0,
            pressure_delta: SmallVec::new(),
        };
        let graph = DepGraph::from_parts(
            vec![su(1), su(6), su(1)],
            vec![(1, 2, EdgeKind::Data, 6)],
            0,
        )
        .unwrap();
        let table = ReservationTable::new(&model);
        let tracker = PressureTracker::new(graph.baseline_max_pressure(), 64);
        let mut bd = ScheduleBoundary::new(&graph, SchedDir::TopDown, 0);
        bd.promote(&graph, &table);
        let ctx = SelectionContext {
            graph: &graph,
            table: &table,
            tracker: &tracker,
            bound_cycles: graph.critical_path() as u64,
        };
        assert_eq!(select_best(&ctx, &bd), Some(1));
    }

    #[test]
    fn program_order_is_the_final_tie_break() {
        let mut b = ResourceModelBuilder::new(2);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();
        let instrs = vec![
            InstrDesc::new(1).resource(p, 0, 1),
            InstrDesc::new(1).resource(p, 0, 1),
        ];
        let graph = DepGraph::build(&model, &instrs, 0).unwrap();
        let table = ReservationTable::new(&model);
        let tracker = PressureTracker::new(graph.baseline_max_pressure(), 0);
        let mut bd = ScheduleBoundary::new(&graph, SchedDir::TopDown, 0);
        bd.promote(&graph, &table);
        let ctx = SelectionContext {
            graph: &graph,
            table: &table,
            tracker: &tracker,
            bound_cycles: graph.critical_path() as u64,
        };
        assert_eq!(select_best(&ctx, &bd), Some(0));

        let mut bu = ScheduleBoundary::new(&graph, SchedDir::BottomUp, 0);
        bu.promote(&graph, &table);
        // Bottom-up prefers the later instruction.
        assert_eq!(select_best(&ctx, &bu), Some(1));
    }
}
