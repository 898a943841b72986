//! The dependency graph: scheduling units, typed edges, depth and height.
//!
//! `DepGraph::build` transforms a basic block's instruction list into a DAG
//! of [`SUnit`]s. Each instruction becomes one unit; data edges run from a
//! definer to each user with the definer's latency on the edge; ordering
//! edges serialize instructions with conflicting memory effects (the
//! original relative order across such an edge is never violated); anti
//! edges run from a reader (or prior definer) to a later redefiner with zero
//! latency.
//!
//! Edges are stored the flat way: one concatenated successor list and one
//! concatenated predecessor list, with per-unit `(start, end)` ranges into
//! each. Depth and height are the latency-weighted longest paths from a
//! root and to a sink respectively, computed once on a topological order.
//! A cycle among dependency edges is an invariant violation
//! ([`GraphError::DependencyCycle`]), not a user error.

use crate::pressure::PressureSetId;
use crate::resource::{ResourceId, ResourceModel};
use crate::result::{GraphError, SchedResult};
use crate::HashMap;
use log::trace;
use smallvec::SmallVec;

/// Index referring to a scheduling unit, and to the instruction it wraps;
/// units are created one per instruction, in program order.
pub type SUnitIndex = u32;

/// Identity of a virtual register / operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperandId(pub u32);

/// An operand reference, tagged with the pressure set its register class
/// belongs to.
#[derive(Clone, Copy, Debug)]
pub struct Operand {
    /// The operand's identity.
    pub id: OperandId,
    /// The pressure set tracking this operand's register class.
    pub set: PressureSetId,
}

/// Memory-effect classification of one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemEffect {
    /// No memory access.
    None,
    /// Reads memory.
    Read,
    /// Writes memory.
    Write,
    /// Unknown effect, may alias anything; ordered against all other
    /// memory operations.
    Unknown,
}

/// One entry of an instruction's resolved resource-usage descriptor: the
/// resource is held over `[issue + acquire_at, issue + release_at)`.
#[derive(Clone, Copy, Debug)]
pub struct ResourceUse {
    /// The resource used (directly; expansion happens in the model).
    pub resource: ResourceId,
    /// Cycle offset, relative to issue, at which the resource is acquired.
    pub acquire_at: u32,
    /// Cycle offset, relative to issue, at which the resource is released.
    pub release_at: u32,
}

impl ResourceUse {
    /// Occupancy of this entry: cycles the resource is exclusively held.
    pub fn occupancy(&self) -> u32 {
        self.release_at - self.acquire_at
    }
}

/// Host-supplied description of one instruction: operand def/use identities,
/// memory-effect classification, and the resolved resource-usage descriptor.
#[derive(Clone, Debug, Default)]
pub struct InstrDesc {
    /// Operands defined (written) by the instruction.
    pub defs: SmallVec<[Operand; 2]>,
    /// Operands used (read) by the instruction.
    pub uses: SmallVec<[Operand; 4]>,
    /// Memory-effect classification.
    pub mem_effect: MemEffect,
    /// Cycles until the result is usable by a consumer.
    pub latency: u32,
    /// Resource reservations required at issue.
    pub resources: SmallVec<[ResourceUse; 4]>,
}

impl Default for MemEffect {
    fn default() -> MemEffect {
        MemEffect::None
    }
}

impl InstrDesc {
    /// A new instruction with the given latency and no operands, memory
    /// effect, or resource uses.
    pub fn new(latency: u32) -> InstrDesc {
        InstrDesc {
            latency,
            ..InstrDesc::default()
        }
    }

    /// Add a defined operand.
    pub fn def(mut self, id: u32, set: PressureSetId) -> InstrDesc {
        self.defs.push(Operand { id: OperandId(id), set });
        self
    }

    /// Add a used operand.
    pub fn use_of(mut self, id: u32, set: PressureSetId) -> InstrDesc {
        self.uses.push(Operand { id: OperandId(id), set });
        self
    }

    /// Set the memory-effect classification.
    pub fn mem(mut self, effect: MemEffect) -> InstrDesc {
        self.mem_effect = effect;
        self
    }

    /// Add a resource reservation held over `[acquire_at, release_at)`
    /// relative to issue.
    pub fn resource(mut self, resource: ResourceId, acquire_at: u32, release_at: u32) -> InstrDesc {
        self.resources.push(ResourceUse {
            resource,
            acquire_at,
            release_at,
        });
        self
    }
}

/// The type of a dependency edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeKind {
    /// True data dependence: the source's result feeds the target.
    Data,
    /// Memory / ordering dependence: the two may alias and must keep their
    /// original relative order.
    Order,
    /// Anti or output dependence: target redefines something the source
    /// reads or defines.
    Anti,
}

/// A typed, latency-weighted dependency edge. In a successor list `other`
/// is the dependent unit; in a predecessor list it is the depended-on unit.
#[derive(Clone, Copy, Debug)]
pub struct DepEdge {
    /// The unit on the far end of the edge.
    pub other: SUnitIndex,
    /// The edge type.
    pub kind: EdgeKind,
    /// Cycles the target must wait after the source issues.
    pub latency: u32,
}

/// One schedulable unit: an instruction plus its scheduling metadata.
/// Graph-topology state (edges, depth, height) lives here and is only
/// mutated during construction; per-direction scheduling state lives in the
/// boundary, never in the graph.
#[derive(Clone, Debug)]
pub struct SUnit {
    /// Cycles to produce a usable result.
    pub latency: u32,
    /// Resource reservations, as supplied (pre-expansion).
    pub resources: SmallVec<[ResourceUse; 4]>,
    /// Max latency-weighted path length from a root to this unit.
    pub depth: u32,
    /// Max latency-weighted path length from this unit to a sink.
    pub height: u32,
    /// Forecast pressure change per pressure set if this unit is scheduled
    /// next: +1 per def, -1 per use.
    pub pressure_delta: SmallVec<[i32; 4]>,
}

/// The dependency DAG for one scheduling region.
pub struct DepGraph {
    sunits: Vec<SUnit>,
    succs: Vec<DepEdge>,
    succ_ranges: Vec<(u32, u32)>,
    preds: Vec<DepEdge>,
    pred_ranges: Vec<(u32, u32)>,
    num_pressure_sets: u32,
    critical_path: u32,
}

impl DepGraph {
    /// Build the graph from a linear instruction stream. The builder owns
    /// and exclusively mutates the units during construction; afterwards the
    /// graph is read-only.
    pub fn build(
        model: &ResourceModel,
        instrs: &[InstrDesc],
        num_pressure_sets: u32,
    ) -> SchedResult<DepGraph> {
        let n = instrs.len();
        let mut sunits = Vec::with_capacity(n);
        for (i, instr) in instrs.iter().enumerate() {
            let su = i as SUnitIndex;
            for use_ in &instr.resources {
                if use_.resource.index() >= model.num_resources() {
                    return Err(GraphError::UnknownResource {
                        su,
                        resource: use_.resource,
                    }
                    .into());
                }
                if use_.acquire_at > use_.release_at {
                    return Err(GraphError::InvertedReservation {
                        su,
                        resource: use_.resource,
                    }
                    .into());
                }
            }
            let mut delta: SmallVec<[i32; 4]> =
                SmallVec::from_elem(0, num_pressure_sets as usize);
            for op in &instr.defs {
                let set = op.set.index();
                if set >= num_pressure_sets as usize {
                    return Err(GraphError::UnknownPressureSet { su, set: op.set.0 }.into());
                }
                delta[set] += 1;
            }
            for op in &instr.uses {
                let set = op.set.index();
                if set >= num_pressure_sets as usize {
                    return Err(GraphError::UnknownPressureSet { su, set: op.set.0 }.into());
                }
                delta[set] -= 1;
            }
            sunits.push(SUnit {
                latency: instr.latency,
                resources: instr.resources.clone(),
                depth: 0,
                height: 0,
                pressure_delta: delta,
            });
        }

        // Data and anti edges from def/use chains.
        let mut edges: Vec<(SUnitIndex, SUnitIndex, EdgeKind, u32)> = vec![];
        let mut last_def: HashMap<OperandId, SUnitIndex> = HashMap::new();
        let mut readers: HashMap<OperandId, SmallVec<[SUnitIndex; 4]>> = HashMap::new();
        // Memory conflict state: the last write-like access and the reads
        // observed since it.
        let mut last_mem_write: Option<SUnitIndex> = None;
        let mut mem_reads: SmallVec<[SUnitIndex; 8]> = SmallVec::new();

        for (i, instr) in instrs.iter().enumerate() {
            let su = i as SUnitIndex;
            for op in &instr.uses {
                if let Some(&def) = last_def.get(&op.id) {
                    edges.push((def, su, EdgeKind::Data, sunits[def as usize].latency));
                }
                readers.entry(op.id).or_default().push(su);
            }
            for op in &instr.defs {
                if let Some(prev) = last_def.insert(op.id, su) {
                    if prev != su {
                        edges.push((prev, su, EdgeKind::Anti, 0));
                    }
                }
                for r in readers.remove(&op.id).unwrap_or_default() {
                    if r != su {
                        edges.push((r, su, EdgeKind::Anti, 0));
                    }
                }
            }
            match instr.mem_effect {
                MemEffect::None => {}
                MemEffect::Read => {
                    if let Some(w) = last_mem_write {
                        edges.push((w, su, EdgeKind::Order, 0));
                    }
                    mem_reads.push(su);
                }
                MemEffect::Write | MemEffect::Unknown => {
                    if let Some(w) = last_mem_write {
                        edges.push((w, su, EdgeKind::Order, 0));
                    }
                    for r in mem_reads.drain(..) {
                        if r != su {
                            edges.push((r, su, EdgeKind::Order, 0));
                        }
                    }
                    last_mem_write = Some(su);
                }
            }
        }

        trace!("dep graph: {} units, {} raw edges", n, edges.len());
        DepGraph::from_parts(sunits, edges, num_pressure_sets)
    }

    /// Assemble a graph from already-built units and edges. This is the
    /// entry point for hosts that construct the DAG themselves; `build`
    /// delegates here. Duplicate edges between a pair of units are folded,
    /// keeping the largest latency (ties prefer `Data` over `Order` over
    /// `Anti`).
    pub fn from_parts(
        mut sunits: Vec<SUnit>,
        mut edges: Vec<(SUnitIndex, SUnitIndex, EdgeKind, u32)>,
        num_pressure_sets: u32,
    ) -> SchedResult<DepGraph> {
        let n = sunits.len();

        edges.sort_unstable_by(|a, b| {
            (a.0, a.1)
                .cmp(&(b.0, b.1))
                .then(b.3.cmp(&a.3))
                .then(a.2.cmp(&b.2))
        });
        edges.dedup_by_key(|e| (e.0, e.1));

        // Flatten into concatenated successor lists with per-unit ranges.
        let mut succs = Vec::with_capacity(edges.len());
        let mut succ_ranges = vec![(0u32, 0u32); n];
        for (from, to, kind, latency) in edges.iter().copied() {
            let range = &mut succ_ranges[from as usize];
            if range.0 == range.1 {
                range.0 = succs.len() as u32;
            }
            succs.push(DepEdge {
                other: to,
                kind,
                latency,
            });
            range.1 = succs.len() as u32;
        }

        // And the mirrored predecessor lists.
        let mut by_to = edges.clone();
        by_to.sort_unstable_by_key(|e| (e.1, e.0));
        let mut preds = Vec::with_capacity(by_to.len());
        let mut pred_ranges = vec![(0u32, 0u32); n];
        for (from, to, kind, latency) in by_to.into_iter() {
            let range = &mut pred_ranges[to as usize];
            if range.0 == range.1 {
                range.0 = preds.len() as u32;
            }
            preds.push(DepEdge {
                other: from,
                kind,
                latency,
            });
            range.1 = preds.len() as u32;
        }

        // Topological order by Kahn's algorithm; any unit never reaching
        // in-degree zero sits on a cycle.
        let mut indegree: Vec<u32> = vec![0; n];
        for e in &edges {
            indegree[e.1 as usize] += 1;
        }
        let mut topo: Vec<SUnitIndex> = Vec::with_capacity(n);
        let mut worklist: Vec<SUnitIndex> =
            (0..n as u32).filter(|&i| indegree[i as usize] == 0).collect();
        while let Some(u) = worklist.pop() {
            topo.push(u);
            let (s, e) = succ_ranges[u as usize];
            for edge in &succs[s as usize..e as usize] {
                let d = &mut indegree[edge.other as usize];
                *d -= 1;
                if *d == 0 {
                    worklist.push(edge.other);
                }
            }
        }
        if topo.len() != n {
            let stuck = (0..n as u32)
                .find(|&i| indegree[i as usize] != 0)
                .unwrap_or(0);
            return Err(GraphError::DependencyCycle(stuck).into());
        }

        // Depth forward along the topological order, height backward.
        for &u in &topo {
            let (s, e) = pred_ranges[u as usize];
            let depth = preds[s as usize..e as usize]
                .iter()
                .map(|p| sunits[p.other as usize].depth + p.latency)
                .max()
                .unwrap_or(0);
            sunits[u as usize].depth = depth;
        }
        for &u in topo.iter().rev() {
            let (s, e) = succ_ranges[u as usize];
            let height = succs[s as usize..e as usize]
                .iter()
                .map(|edge| edge.latency + sunits[edge.other as usize].height)
                .max()
                .unwrap_or(0);
            sunits[u as usize].height = height;
        }

        let critical_path = sunits.iter().map(|su| su.depth + su.latency).max().unwrap_or(0);

        Ok(DepGraph {
            sunits,
            succs,
            succ_ranges,
            preds,
            pred_ranges,
            num_pressure_sets,
            critical_path,
        })
    }

    /// Number of scheduling units.
    pub fn num_units(&self) -> usize {
        self.sunits.len()
    }

    /// One unit.
    pub fn sunit(&self, su: SUnitIndex) -> &SUnit {
        &self.sunits[su as usize]
    }

    /// Successor edges of a unit.
    pub fn succs(&self, su: SUnitIndex) -> &[DepEdge] {
        let (s, e) = self.succ_ranges[su as usize];
        &self.succs[s as usize..e as usize]
    }

    /// Predecessor edges of a unit.
    pub fn preds(&self, su: SUnitIndex) -> &[DepEdge] {
        let (s, e) = self.pred_ranges[su as usize];
        &self.preds[s as usize..e as usize]
    }

    /// Number of pressure sets the unit deltas are indexed by.
    pub fn num_pressure_sets(&self) -> u32 {
        self.num_pressure_sets
    }

    /// Latency-weighted length of the longest dependent chain:
    /// `max(depth + latency)` over all units.
    pub fn critical_path(&self) -> u32 {
        self.critical_path
    }

    /// Maximum pressure per set in the original program order, starting
    /// from zero: the fixed baseline the current-max heuristic compares
    /// against.
    pub fn baseline_max_pressure(&self) -> Vec<i64> {
        let sets = self.num_pressure_sets as usize;
        let mut running = vec![0i64; sets];
        let mut max = vec![0i64; sets];
        for su in &self.sunits {
            for (s, &d) in su.pressure_delta.iter().enumerate() {
                running[s] += d as i64;
                max[s] = max[s].max(running[s]);
            }
        }
        max
    }
}
