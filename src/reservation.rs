//! The resource reservation engine.
//!
//! The table answers, for a unit and a proposed issue cycle, whether the
//! reservation is legal, and commits it if so. A resource with N units is
//! modeled as N independent binary reservation tracks, each holding the
//! cycle at which it next becomes free; a reservation takes the first free
//! track (the tie-break affects only scheduling aesthetics, never
//! correctness). Every check and commit runs over the unit's *expanded*
//! requirement set, so reserving one pipe of a group also draws down the
//! group, and any super-resource above either.
//!
//! Buffer kinds modify the semantics:
//!
//! - `Unbuffered`: strict structural hazard on the interval
//!   `[issue + acquire, issue + release)`.
//! - `LatencyDevice`: never a hard hazard; the previous occupant's issue
//!   cycle and latency are remembered, and the next occupant's consumption
//!   is timed against them (chained producer/consumer semantics with no
//!   data dependence required).
//! - `Buffered(k)` / `Unified`: a hazard only when the queue (private, or
//!   the model-wide pool) is out of slots; the unit reservation then starts
//!   at the earliest free track, which may be after the acquire offset.

use crate::graph::{SUnit, SUnitIndex};
use crate::resource::{BufferKind, ResourceId, ResourceModel};
use num_rational::Ratio;
use smallvec::SmallVec;

/// One committed reservation, for diagnostics: unit `su` held `resource`
/// unit `unit` over `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservationRow {
    /// The reserving scheduling unit.
    pub su: SUnitIndex,
    /// The reserved resource.
    pub resource: ResourceId,
    /// Which of the resource's unit tracks was taken.
    pub unit: u32,
    /// First occupied cycle.
    pub start: u64,
    /// First cycle past the occupation.
    pub end: u64,
}

/// Time-stamped reservation state for one scheduling region.
pub struct ReservationTable<'a> {
    model: &'a ResourceModel,
    /// Next-free cycle per unit track, per resource.
    tracks: Vec<Vec<u64>>,
    /// Accumulated occupancy (release - acquire, summed) per resource.
    occupancy: Vec<u64>,
    /// Release cycles of ops currently held in a `Buffered` queue.
    in_flight: Vec<SmallVec<[u64; 4]>>,
    /// Release cycles of ops in the global `Unified` pool.
    unified: SmallVec<[u64; 4]>,
    /// Last occupant of each `LatencyDevice` resource: (issue, latency).
    chain: Vec<Option<(u64, u32)>>,
    rows: Vec<ReservationRow>,
}

impl<'a> ReservationTable<'a> {
    /// An empty table over the given model.
    pub fn new(model: &'a ResourceModel) -> ReservationTable<'a> {
        let n = model.num_resources();
        ReservationTable {
            model,
            tracks: (0..n)
                .map(|r| vec![0u64; model.units(ResourceId(r as u32)) as usize])
                .collect(),
            occupancy: vec![0; n],
            in_flight: vec![SmallVec::new(); n],
            unified: SmallVec::new(),
            chain: vec![None; n],
            rows: vec![],
        }
    }

    fn live_count(queue: &[u64], cycle: u64) -> usize {
        queue.iter().filter(|&&release| release > cycle).count()
    }

    /// Is every resource in `su`'s expanded requirement set available for an
    /// issue at `cycle`? Latency devices never report a hard hazard here;
    /// their chained timing is exposed via [`chain_ready`](Self::chain_ready)
    /// instead.
    pub fn can_reserve(&self, su: &SUnit, cycle: u64) -> bool {
        for use_ in &su.resources {
            for &r in self.model.expand(use_.resource) {
                let start = cycle + use_.acquire_at as u64;
                match self.model.buffer(r) {
                    BufferKind::Unbuffered => {
                        if !self.tracks[r.index()].iter().any(|&free| free <= start) {
                            return false;
                        }
                    }
                    BufferKind::LatencyDevice => {}
                    BufferKind::Buffered(k) => {
                        if Self::live_count(&self.in_flight[r.index()], cycle) >= k as usize {
                            return false;
                        }
                    }
                    BufferKind::Unified => {
                        if Self::live_count(&self.unified, cycle)
                            >= self.model.max_buffered_ops() as usize
                        {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// The earliest cycle `>= from` at which `can_reserve` holds. Used to
    /// advance a boundary's cursor past a structural hazard.
    pub fn first_feasible_cycle(&self, su: &SUnit, from: u64) -> u64 {
        let mut cycle = from;
        for use_ in &su.resources {
            for &r in self.model.expand(use_.resource) {
                match self.model.buffer(r) {
                    BufferKind::Unbuffered => {
                        let earliest = self.tracks[r.index()].iter().copied().min().unwrap_or(0);
                        cycle = cycle.max(earliest.saturating_sub(use_.acquire_at as u64));
                    }
                    BufferKind::LatencyDevice => {}
                    BufferKind::Buffered(k) => {
                        cycle = cycle.max(Self::queue_feasible(
                            &self.in_flight[r.index()],
                            k as usize,
                            from,
                        ));
                    }
                    BufferKind::Unified => {
                        cycle = cycle.max(Self::queue_feasible(
                            &self.unified,
                            self.model.max_buffered_ops() as usize,
                            from,
                        ));
                    }
                }
            }
        }
        cycle
    }

    /// Earliest cycle at which fewer than `slots` queued ops remain live.
    fn queue_feasible(queue: &[u64], slots: usize, from: u64) -> u64 {
        let mut live: SmallVec<[u64; 8]> =
            queue.iter().copied().filter(|&release| release > from).collect();
        if live.len() < slots {
            return from;
        }
        live.sort_unstable();
        // Once the (len - slots)-th release has passed, a slot is free.
        live[live.len() - slots]
    }

    /// The chained ready cycle imposed on `su` by latency devices it uses:
    /// the previous occupant's issue plus the previous occupant's latency,
    /// regardless of any true data dependency. Zero when unconstrained.
    pub fn chain_ready(&self, su: &SUnit) -> u64 {
        let mut ready = 0;
        for use_ in &su.resources {
            for &r in self.model.expand(use_.resource) {
                if self.model.buffer(r).is_latency_device() {
                    if let Some((issue, latency)) = self.chain[r.index()] {
                        ready = ready.max(issue + latency as u64);
                    }
                }
            }
        }
        ready
    }

    /// Commit `su`'s reservations for an issue at `cycle`, advancing the
    /// assigned tracks and recording diagnostics rows. The caller has
    /// already established feasibility at or before `cycle`.
    pub fn reserve(&mut self, su_ix: SUnitIndex, su: &SUnit, cycle: u64) {
        for use_ in &su.resources {
            for &r in self.model.expand(use_.resource) {
                let ri = r.index();
                let start = cycle + use_.acquire_at as u64;
                let end = cycle + use_.release_at as u64;
                let occ = use_.occupancy() as u64;
                self.occupancy[ri] += occ;

                match self.model.buffer(r) {
                    BufferKind::Unbuffered => {
                        let unit = self.tracks[ri]
                            .iter()
                            .position(|&free| free <= start)
                            .unwrap_or_else(|| first_free_track(&self.tracks[ri]));
                        let eff_start = start.max(self.tracks[ri][unit]);
                        self.tracks[ri][unit] = eff_start + occ;
                        self.rows.push(ReservationRow {
                            su: su_ix,
                            resource: r,
                            unit: unit as u32,
                            start: eff_start,
                            end: eff_start + occ,
                        });
                    }
                    BufferKind::LatencyDevice => {
                        self.chain[ri] = Some((cycle, su.latency));
                        let unit = first_free_track(&self.tracks[ri]);
                        let eff_start = start.max(self.tracks[ri][unit]);
                        self.tracks[ri][unit] = eff_start + occ;
                        self.rows.push(ReservationRow {
                            su: su_ix,
                            resource: r,
                            unit: unit as u32,
                            start: eff_start,
                            end: eff_start + occ,
                        });
                    }
                    BufferKind::Buffered(_) | BufferKind::Unified => {
                        let queue = if self.model.buffer(r) == BufferKind::Unified {
                            &mut self.unified
                        } else {
                            &mut self.in_flight[ri]
                        };
                        queue.retain(|&mut release| release > cycle);
                        queue.push(end);
                        let unit = first_free_track(&self.tracks[ri]);
                        let eff_start = start.max(self.tracks[ri][unit]);
                        self.tracks[ri][unit] = eff_start + occ;
                        self.rows.push(ReservationRow {
                            su: su_ix,
                            resource: r,
                            unit: unit as u32,
                            start: eff_start,
                            end: eff_start + occ,
                        });
                    }
                }
            }
        }
    }

    /// Accumulated occupancy for a resource.
    pub fn occupancy(&self, r: ResourceId) -> u64 {
        self.occupancy[r.index()]
    }

    /// Occupancy scaled by the resource's normalization factor, making
    /// heterogeneous resources comparable against a scaled cycle bound.
    pub fn normalized_occupancy(&self, r: ResourceId) -> u64 {
        self.occupancy[r.index()] * self.model.factor(r)
    }

    /// How far dispatching `su` would push the worst touched resource's
    /// normalized occupancy above `bound_cycles` (scaled by the model LCM).
    /// Zero when every touched resource would stay within the bound.
    pub fn bound_excess_after(&self, su: &SUnit, bound_cycles: u64) -> u64 {
        let scaled_bound = bound_cycles * self.model.norm_lcm();
        let mut excess = 0;
        for use_ in &su.resources {
            for &r in self.model.expand(use_.resource) {
                let after =
                    (self.occupancy[r.index()] + use_.occupancy() as u64) * self.model.factor(r);
                excess = excess.max(after.saturating_sub(scaled_bound));
            }
        }
        excess
    }

    /// The resource with the highest normalized accumulated occupancy, with
    /// that occupancy. `None` when nothing has been reserved.
    pub fn critical_resource(&self) -> Option<(ResourceId, u64)> {
        (0..self.model.num_resources())
            .map(|i| {
                let r = ResourceId(i as u32);
                (r, self.normalized_occupancy(r))
            })
            .filter(|&(_, n)| n > 0)
            .max_by_key(|&(_, n)| n)
    }

    /// The committed reservation rows, in commit order.
    pub fn rows(&self) -> &[ReservationRow] {
        &self.rows
    }

    /// Consume the table, keeping the rows for a diagnostics bundle.
    pub fn into_rows(self) -> Vec<ReservationRow> {
        self.rows
    }
}

/// The track that frees up first.
fn first_free_track(tracks: &[u64]) -> usize {
    let mut best = 0;
    for (i, &free) in tracks.iter().enumerate() {
        if free < tracks[best] {
            best = i;
        }
    }
    best
}

/// Steady-state average cycles per instruction when issuing a long run of
/// `su` back-to-back: `max((release - acquire) / units)` over the expanded
/// resource set. Exact for zero and non-zero acquire offsets alike: the
/// interval between successive dispatches is bounded below by the longest
/// per-resource occupancy after optimally left-shifting the later
/// instruction against the earlier one.
pub fn reciprocal_throughput(model: &ResourceModel, su: &SUnit) -> Ratio<u64> {
    let mut best = Ratio::new(0, 1);
    for use_ in &su.resources {
        for &r in model.expand(use_.resource) {
            let ratio = Ratio::new(use_.occupancy() as u64, model.units(r) as u64);
            if ratio > best {
                best = ratio;
            }
        }
    }
    best
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::ResourceUse;
    use crate::resource::{ProcResourceDesc, ResourceModelBuilder};

    fn su_using(uses: &[(ResourceId, u32, u32)], latency: u32) -> SUnit {
        SUnit {
            latency,
            resources: uses
                .iter()
                .map(|&(resource, acquire_at, release_at)| ResourceUse {
                    resource,
                    acquire_at,
                    release_at,
                })
                .collect(),
            depth: 0,
            height: 0,
            pressure_delta: SmallVec::new(),
        }
    }

    #[test]
    fn unit_cap_is_enforced() {
        let mut b = ResourceModelBuilder::new(4);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();
        let mut table = ReservationTable::new(&model);
        let su = su_using(&[(p, 0, 3)], 3);

        assert!(table.can_reserve(&su, 0));
        table.reserve(0, &su, 0);
        assert!(table.can_reserve(&su, 0));
        table.reserve(1, &su, 0);
        // Both units busy over [0, 3).
        assert!(!table.can_reserve(&su, 0));
        assert!(!table.can_reserve(&su, 2));
        assert!(table.can_reserve(&su, 3));
        assert_eq!(table.first_feasible_cycle(&su, 0), 3);
    }

    #[test]
    fn back_to_back_throughput_formula() {
        // N identical units on one pipe: total elapsed is
        // release * (N - 1) + latency.
        let mut b = ResourceModelBuilder::new(1);
        let p = b.add(ProcResourceDesc::atomic("P", 1));
        let model = b.build().unwrap();
        let mut table = ReservationTable::new(&model);
        let su = su_using(&[(p, 0, 2)], 5);

        let n = 6u64;
        let mut issue = 0;
        for i in 0..n {
            issue = table.first_feasible_cycle(&su, issue);
            assert!(table.can_reserve(&su, issue));
            table.reserve(i as SUnitIndex, &su, issue);
        }
        assert_eq!(issue + su.latency as u64, 2 * (n - 1) + 5);
        assert_eq!(table.occupancy(p), 2 * n);
    }

    #[test]
    fn acquire_offsets_shift_the_steady_state() {
        // P0 [0,2), P1 [2,5), P2 [1,3): inverse throughput is
        // max(release - acquire) = 3, from P1.
        let mut b = ResourceModelBuilder::new(1);
        let p0 = b.add(ProcResourceDesc::atomic("P0", 1));
        let p1 = b.add(ProcResourceDesc::atomic("P1", 1));
        let p2 = b.add(ProcResourceDesc::atomic("P2", 1));
        let model = b.build().unwrap();
        let su = su_using(&[(p0, 0, 2), (p1, 2, 5), (p2, 1, 3)], 1);

        assert_eq!(reciprocal_throughput(&model, &su), Ratio::new(3, 1));

        let mut table = ReservationTable::new(&model);
        let mut prev = table.first_feasible_cycle(&su, 0);
        table.reserve(0, &su, prev);
        for i in 1..8 {
            let issue = table.first_feasible_cycle(&su, prev);
            assert_eq!(issue - prev, 3, "steady-state stride at dispatch {}", i);
            table.reserve(i, &su, issue);
            prev = issue;
        }
    }

    #[test]
    fn group_units_divide_throughput() {
        let mut b = ResourceModelBuilder::new(4);
        let p0 = b.add(ProcResourceDesc::atomic("P0", 1));
        let p1 = b.add(ProcResourceDesc::atomic("P1", 1));
        let p2 = b.add(ProcResourceDesc::atomic("P2", 1));
        let g = b.add(ProcResourceDesc::group("G", &[p0, p1, p2]));
        let model = b.build().unwrap();

        // A group reservation can go to any of three units.
        let su = su_using(&[(g, 0, 3)], 1);
        assert_eq!(reciprocal_throughput(&model, &su), Ratio::new(1, 1));

        // A pipe reservation also holds one group unit.
        let leaf = su_using(&[(p0, 0, 2)], 1);
        let mut table = ReservationTable::new(&model);
        table.reserve(0, &leaf, 0);
        assert_eq!(table.occupancy(p0), 2);
        assert_eq!(table.occupancy(g), 2);
        assert!(!table.can_reserve(&leaf, 1));
    }

    #[test]
    fn latency_device_chains_but_never_blocks() {
        let mut b = ResourceModelBuilder::new(1);
        let div = b.add(
            ProcResourceDesc::atomic("Div", 1).with_buffer(BufferKind::LatencyDevice),
        );
        let model = b.build().unwrap();
        let mut table = ReservationTable::new(&model);
        let su = su_using(&[(div, 0, 1)], 66);

        assert!(table.can_reserve(&su, 0));
        table.reserve(0, &su, 0);
        // No structural hazard, but the chained consumption timing is
        // issue + latency of the previous occupant.
        assert!(table.can_reserve(&su, 0));
        assert_eq!(table.chain_ready(&su), 66);
        table.reserve(1, &su, 66);
        assert_eq!(table.chain_ready(&su), 132);
    }

    #[test]
    fn buffered_queue_exhaustion_is_a_hazard() {
        let mut b = ResourceModelBuilder::new(1);
        let q = b.add(ProcResourceDesc::atomic("Q", 1).with_buffer(BufferKind::Buffered(2)));
        let model = b.build().unwrap();
        let mut table = ReservationTable::new(&model);
        let su = su_using(&[(q, 0, 4)], 4);

        table.reserve(0, &su, 0);
        table.reserve(1, &su, 0);
        // Two ops in a two-slot queue: full until one releases.
        assert!(!table.can_reserve(&su, 0));
        let feasible = table.first_feasible_cycle(&su, 0);
        assert_eq!(feasible, 4);
        assert!(table.can_reserve(&su, feasible));
    }

    #[test]
    fn unified_pool_is_shared() {
        let mut b = ResourceModelBuilder::new(1);
        let a = b.add(ProcResourceDesc::atomic("A", 1).with_buffer(BufferKind::Unified));
        let c = b.add(ProcResourceDesc::atomic("C", 1).with_buffer(BufferKind::Unified));
        let model = b.max_buffered_ops(2).build().unwrap();
        let mut table = ReservationTable::new(&model);
        let on_a = su_using(&[(a, 0, 8)], 8);
        let on_c = su_using(&[(c, 0, 8)], 8);

        table.reserve(0, &on_a, 0);
        table.reserve(1, &on_c, 0);
        // The pool is global: a third op on either resource stalls.
        assert!(!table.can_reserve(&on_a, 0));
        assert!(!table.can_reserve(&on_c, 0));
        assert_eq!(table.first_feasible_cycle(&on_a, 0), 8);
    }

    #[test]
    fn rows_record_unit_assignment() {
        let mut b = ResourceModelBuilder::new(2);
        let p = b.add(ProcResourceDesc::atomic("P", 2));
        let model = b.build().unwrap();
        let mut table = ReservationTable::new(&model);
        let su = su_using(&[(p, 1, 3)], 3);

        table.reserve(7, &su, 0);
        table.reserve(8, &su, 0);
        assert_eq!(
            table.rows(),
            &[
                ReservationRow { su: 7, resource: p, unit: 0, start: 1, end: 3 },
                ReservationRow { su: 8, resource: p, unit: 1, start: 1, end: 3 },
            ]
        );
    }
}
