//! The scheduling driver: region in, ordered sequence plus diagnostics out.
//!
//! `schedule_region` ties the stages together: build the dependency graph,
//! run the configured boundary strategy to completion, and assemble the
//! diagnostics bundle. The cursor-advance / candidate-pick loop is
//! inherently sequential within a region; parallelism exists only across
//! independent regions (`schedule_regions`), which share nothing mutable.

use crate::boundary::{SchedDir, ScheduleBoundary};
use crate::diag::{Diagnostics, Stall, StallKind};
use crate::graph::{DepGraph, InstrDesc, SUnitIndex};
use crate::pressure::PressureTracker;
use crate::reservation::ReservationTable;
use crate::resource::{ResourceId, ResourceModel};
use crate::result::{SchedError, SchedResult};
use crate::select::{select_best, SelectionContext};
use log::debug;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Which boundary layout to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedStrategy {
    /// One boundary from the top of the region.
    TopDown,
    /// One boundary from the bottom of the region.
    BottomUp,
    /// Both boundaries, advanced turn-by-turn (top-down moves first each
    /// round) until they meet.
    Bidirectional,
}

/// Host-supplied scheduling parameters.
#[derive(Clone, Debug)]
pub struct ScheduleConfig {
    /// Boundary strategy.
    pub strategy: SchedStrategy,
    /// Damping floor for the excess-pressure heuristic.
    pub pressure_threshold: i64,
    /// Optional wall-clock budget per region. Exceeding it fails the
    /// region with [`SchedError::BudgetExceeded`]; the caller may fall
    /// back to [`Schedule::original_order`].
    pub budget: Option<Duration>,
}

impl Default for ScheduleConfig {
    fn default() -> ScheduleConfig {
        ScheduleConfig {
            strategy: SchedStrategy::TopDown,
            pressure_threshold: 0,
            budget: None,
        }
    }
}

/// The result of scheduling one region.
#[derive(Clone, Debug)]
pub struct Schedule {
    /// The emitted instruction order, as indices into the input list.
    pub order: Vec<SUnitIndex>,
    /// Everything else the simulation learned.
    pub diagnostics: Diagnostics,
}

impl Schedule {
    /// The identity schedule over `n` instructions, with empty
    /// diagnostics: the fallback when a region's budget is exceeded.
    pub fn original_order(n: usize) -> Schedule {
        Schedule {
            order: (0..n as SUnitIndex).collect(),
            diagnostics: Diagnostics::empty(n),
        }
    }
}

/// Schedule one region: build the graph from `instrs`, run the configured
/// strategy to completion, and return the order plus diagnostics. Fails
/// outright on a malformed model reference, graph cycle, deadlock, or
/// budget exhaustion; no instruction is ever left half-scheduled.
pub fn schedule_region(
    model: &ResourceModel,
    instrs: &[InstrDesc],
    num_pressure_sets: u32,
    config: &ScheduleConfig,
) -> SchedResult<Schedule> {
    let graph = DepGraph::build(model, instrs, num_pressure_sets)?;
    debug!(
        "region: {} units, critical path {} cycles, strategy {:?}",
        graph.num_units(),
        graph.critical_path(),
        config.strategy
    );
    schedule_graph(model, &graph, config)
}

/// Schedule an already-built dependency graph.
pub fn schedule_graph(
    model: &ResourceModel,
    graph: &DepGraph,
    config: &ScheduleConfig,
) -> SchedResult<Schedule> {
    let n = graph.num_units();
    let sets = graph.num_pressure_sets();
    let mut boundaries: Vec<ScheduleBoundary> = match config.strategy {
        SchedStrategy::TopDown => vec![ScheduleBoundary::new(graph, SchedDir::TopDown, sets)],
        SchedStrategy::BottomUp => vec![ScheduleBoundary::new(graph, SchedDir::BottomUp, sets)],
        SchedStrategy::Bidirectional => vec![
            ScheduleBoundary::new(graph, SchedDir::TopDown, sets),
            ScheduleBoundary::new(graph, SchedDir::BottomUp, sets),
        ],
    };

    // Each boundary owns its own reservation table: the two cursors run on
    // independent time bases (cycles from the top vs. cycles from the
    // bottom), so their hazard windows never refer to the same instant.
    let mut tables: Vec<ReservationTable> =
        boundaries.iter().map(|_| ReservationTable::new(model)).collect();
    let mut tracker =
        PressureTracker::new(graph.baseline_max_pressure(), config.pressure_threshold);
    let bound_cycles = graph.critical_path() as u64;

    let mut issue_cycle: Vec<Option<u64>> = vec![None; n];
    let mut stalls: Vec<Stall> = vec![];
    let mut dispatched = 0usize;
    let started = Instant::now();

    while dispatched < n {
        if let Some(budget) = config.budget {
            if started.elapsed() >= budget {
                return Err(SchedError::BudgetExceeded {
                    budget_ms: budget.as_millis() as u64,
                    dispatched,
                });
            }
        }

        let mut progressed = false;
        for i in 0..boundaries.len() {
            let (boundary, other) = pair_mut(&mut boundaries, i);
            let table = &mut tables[i];
            boundary.promote(graph, table);
            let picked = {
                let ctx = SelectionContext {
                    graph,
                    table: &*table,
                    tracker: &tracker,
                    bound_cycles,
                };
                select_best(&ctx, boundary)
            };
            let Some(su) = picked else { continue };

            let unit = graph.sunit(su);
            let chain = table.chain_ready(unit);
            let cycle = boundary.cycle();
            // Ready-cycle <= cursor is guaranteed by promotion; only the
            // latency-device chain can push the issue past the cursor.
            let issue = cycle.max(chain);
            if chain > cycle {
                stalls.push(Stall {
                    su,
                    at_cycle: cycle,
                    cycles: chain - cycle,
                    kind: StallKind::Soft,
                });
            }

            debug!(
                "{}: dispatch unit {} at cycle {} (issue {})",
                boundary.dir(),
                su,
                cycle,
                issue
            );
            table.reserve(su, unit, issue);
            let dir = boundary.dir();
            tracker.commit(boundary.pressure_mut(), unit, dir);
            boundary.dispatch(su);
            boundary.release_neighbors(graph, su, Some(issue));
            if let Some(other) = other {
                other.retire(su);
                other.release_neighbors(graph, su, None);
            }
            issue_cycle[su as usize] = Some(issue);
            dispatched += 1;
            progressed = true;
        }

        if progressed {
            continue;
        }

        // Nothing was available anywhere: advance cursors over the stall.
        let mut advanced = false;
        for (i, boundary) in boundaries.iter_mut().enumerate() {
            let Some(next) = boundary.next_pending_cycle(graph, &tables[i]) else {
                continue;
            };
            let cycle = boundary.cycle();
            if next > cycle {
                for &su in boundary.pending() {
                    let kind = if boundary.ready_cycle(su) > cycle {
                        StallKind::Data
                    } else {
                        StallKind::Structural
                    };
                    stalls.push(Stall {
                        su,
                        at_cycle: cycle,
                        cycles: next - cycle,
                        kind,
                    });
                }
                boundary.advance_to(next);
                advanced = true;
            }
        }
        if !advanced {
            // Blocked units with no releasable path: a logic bug or a
            // malformed model, never a state to retry from.
            let su = (0..n as SUnitIndex)
                .find(|&su| issue_cycle[su as usize].is_none())
                .unwrap_or(0);
            return Err(SchedError::Deadlock {
                su,
                remaining: n - dispatched,
            });
        }
    }

    // Assemble the final order: the top-down prefix, then the bottom-up
    // suffix reversed back into forward order.
    let order: Vec<SUnitIndex> = match config.strategy {
        SchedStrategy::TopDown => boundaries[0].sequence().to_vec(),
        SchedStrategy::BottomUp => {
            boundaries[0].sequence().iter().rev().copied().collect()
        }
        SchedStrategy::Bidirectional => {
            let mut order = boundaries[0].sequence().to_vec();
            order.extend(boundaries[1].sequence().iter().rev().copied());
            order
        }
    };
    debug_assert_eq!(order.len(), n);

    let elapsed_cycles = (0..n)
        .map(|i| issue_cycle[i].unwrap_or(0) + graph.sunit(i as SUnitIndex).latency as u64)
        .max()
        .unwrap_or(0);
    // Account both boundaries' occupancy when naming the bottleneck.
    let critical_resource = (0..model.num_resources())
        .map(|i| {
            let r = ResourceId(i as u32);
            let occ: u64 = tables.iter().map(|t| t.normalized_occupancy(r)).sum();
            (r, occ)
        })
        .filter(|&(_, occ)| occ > 0)
        .max_by_key(|&(_, occ)| occ);
    let rows = tables.into_iter().flat_map(ReservationTable::into_rows).collect();
    let diagnostics = Diagnostics {
        issue_cycle,
        rows,
        stalls,
        critical_resource,
        critical_path: graph.critical_path() as u64,
        elapsed_cycles,
    };
    debug!(
        "region scheduled: {} units in {} cycles, {} stall record(s)",
        n,
        diagnostics.elapsed_cycles,
        diagnostics.stalls.len()
    );

    Ok(Schedule { order, diagnostics })
}

fn pair_mut(
    boundaries: &mut [ScheduleBoundary],
    i: usize,
) -> (&mut ScheduleBoundary, Option<&mut ScheduleBoundary>) {
    if boundaries.len() == 1 {
        (&mut boundaries[0], None)
    } else {
        let (first, second) = boundaries.split_at_mut(1);
        if i == 0 {
            (&mut first[0], Some(&mut second[0]))
        } else {
            (&mut second[0], Some(&mut first[0]))
        }
    }
}

/// Schedule independent regions concurrently. Regions share only the
/// immutable model; each failure is per-region, never global.
pub fn schedule_regions(
    model: &ResourceModel,
    regions: &[Vec<InstrDesc>],
    num_pressure_sets: u32,
    config: &ScheduleConfig,
) -> Vec<SchedResult<Schedule>> {
    regions
        .par_iter()
        .map(|instrs| schedule_region(model, instrs, num_pressure_sets, config))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::MemEffect;
    use crate::pressure::PressureSetId;
    use crate::resource::{BufferKind, ProcResourceDesc, ResourceModelBuilder};

    const SET0: PressureSetId = PressureSetId(0);

    #[test]
    fn independent_units_fill_the_pipes() {
        let mut b = ResourceModelBuilder::new(2);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();
        let instrs: Vec<InstrDesc> =
            (0..4).map(|_| InstrDesc::new(1).resource(p, 0, 1)).collect();

        let sched =
            schedule_region(&model, &instrs, 0, &ScheduleConfig::default()).unwrap();
        assert_eq!(sched.order, vec![0, 1, 2, 3]);
        // Two per cycle on the two-unit pipe.
        assert_eq!(sched.diagnostics.issue_cycle[0], Some(0));
        assert_eq!(sched.diagnostics.issue_cycle[1], Some(0));
        assert_eq!(sched.diagnostics.issue_cycle[2], Some(1));
        assert_eq!(sched.diagnostics.issue_cycle[3], Some(1));
    }

    #[test]
    fn data_hazard_stalls_are_recorded() {
        let mut b = ResourceModelBuilder::new(1);
        let p = b.add(ProcResourceDesc::atomic("P", 1));
        let model = b.build().unwrap();
        let instrs = vec![
            InstrDesc::new(4).def(0, SET0).resource(p, 0, 1),
            InstrDesc::new(1).use_of(0, SET0).resource(p, 0, 1),
        ];
        let sched = schedule_region(&model, &instrs, 1, &ScheduleConfig::default()).unwrap();
        assert_eq!(sched.order, vec![0, 1]);
        assert_eq!(sched.diagnostics.issue_cycle[1], Some(4));
        assert!(sched
            .diagnostics
            .stalls
            .iter()
            .any(|s| s.su == 1 && s.kind == StallKind::Data));
    }

    #[test]
    fn memory_order_is_never_violated() {
        let mut b = ResourceModelBuilder::new(1);
        let p = b.add(ProcResourceDesc::atomic("P", 1));
        let model = b.build().unwrap();
        let instrs = vec![
            InstrDesc::new(1).mem(MemEffect::Write).resource(p, 0, 1),
            InstrDesc::new(1).mem(MemEffect::Read).resource(p, 0, 1),
            InstrDesc::new(1).mem(MemEffect::Write).resource(p, 0, 1),
        ];
        for strategy in [
            SchedStrategy::TopDown,
            SchedStrategy::BottomUp,
            SchedStrategy::Bidirectional,
        ] {
            let config = ScheduleConfig { strategy, ..ScheduleConfig::default() };
            let sched = schedule_region(&model, &instrs, 0, &config).unwrap();
            assert_eq!(sched.order, vec![0, 1, 2], "strategy {:?}", strategy);
        }
    }

    #[test]
    fn bidirectional_partitions_the_region() {
        let mut b = ResourceModelBuilder::new(2);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();
        let instrs: Vec<InstrDesc> =
            (0..6).map(|_| InstrDesc::new(1).resource(p, 0, 1)).collect();
        let config = ScheduleConfig {
            strategy: SchedStrategy::Bidirectional,
            ..ScheduleConfig::default()
        };
        let sched = schedule_region(&model, &instrs, 0, &config).unwrap();

        let mut seen = sched.order.clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn latency_device_soft_stall_is_reported() {
        let mut b = ResourceModelBuilder::new(1);
        let div =
            b.add(ProcResourceDesc::atomic("Div", 1).with_buffer(BufferKind::LatencyDevice));
        let model = b.build().unwrap();
        let instrs = vec![
            InstrDesc::new(66).resource(div, 0, 1),
            InstrDesc::new(66).resource(div, 0, 1),
        ];
        let sched = schedule_region(&model, &instrs, 0, &ScheduleConfig::default()).unwrap();
        // No data dependence, yet the second divide chains on the first.
        assert_eq!(sched.diagnostics.issue_cycle[0], Some(0));
        assert_eq!(sched.diagnostics.issue_cycle[1], Some(66));
        assert_eq!(sched.diagnostics.stall_cycles(StallKind::Soft), 66);
    }

    #[test]
    fn zero_budget_falls_out_as_budget_exceeded() {
        let mut b = ResourceModelBuilder::new(1);
        let p = b.add(ProcResourceDesc::atomic("P", 1));
        let model = b.build().unwrap();
        let instrs: Vec<InstrDesc> =
            (0..64).map(|_| InstrDesc::new(1).resource(p, 0, 1)).collect();
        let config = ScheduleConfig {
            budget: Some(Duration::from_secs(0)),
            ..ScheduleConfig::default()
        };
        match schedule_region(&model, &instrs, 0, &config) {
            Err(SchedError::BudgetExceeded { .. }) => {}
            other => panic!("expected budget exhaustion, got {:?}", other.map(|s| s.order)),
        }
        // The documented fallback.
        let fallback = Schedule::original_order(instrs.len());
        assert_eq!(fallback.order.len(), 64);
    }

    #[test]
    fn regions_schedule_in_parallel() {
        let mut b = ResourceModelBuilder::new(2);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();
        let region: Vec<InstrDesc> =
            (0..8).map(|_| InstrDesc::new(1).resource(p, 0, 1)).collect();
        let regions: Vec<Vec<InstrDesc>> = (0..4).map(|_| region.clone()).collect();

        let results = schedule_regions(&model, &regions, 0, &ScheduleConfig::default());
        assert_eq!(results.len(), 4);
        for result in results {
            assert_eq!(result.unwrap().order.len(), 8);
        }
    }
}
