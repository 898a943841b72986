//! The declarative processor resource model.
//!
//! A resource is an execution pipe (or pipe group) with a fixed per-cycle
//! unit capacity. Resources relate to each other in two ways:
//!
//! - *Groups*: a group is a resource whose capacity is the explicit union of
//!   its member pipes; a reservation against the group may be satisfied by
//!   any member.
//! - *Super-resources*: a parent resource representing shared capacity that
//!   its child "alias" resources partition (e.g. an `LSU` whose ports are
//!   split between `Load` and `Store` views).
//!
//! Reserving only a leaf resource would under-account shared capacity:
//! taking one pipe of a three-pipe group must also decrement the group's
//! availability, and any other group sharing that pipe. The model therefore
//! normalizes each resource, once at construction time, into its *expansion*:
//! the full effective set of resources a direct use implicitly reserves
//! (itself, every transitive containing group, and every super-resource
//! ancestor). The reservation engine only ever consults the expansion table.
//!
//! The model is immutable after construction and is shared by reference
//! across all scheduling regions.

use crate::result::{ConfigurationError, SchedResult};
use crate::HashMap;
use log::debug;
use smallvec::SmallVec;
use std::fmt;

/// Identity of a processor resource within a [`ResourceModel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u32);

impl ResourceId {
    /// The index of this resource in the model's tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Buffering behavior of a resource, which decides how structural hazards on
/// it are enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Strictly in-order: dispatch and issue coincide, and the next unit
    /// requiring this resource must wait for the current occupant's release
    /// cycle. Full structural-hazard enforcement.
    Unbuffered,
    /// A one-deep staging buffer in front of an in-order sub-unit (e.g. an
    /// unpipelined divider inside an otherwise out-of-order resource). The
    /// next occupant is accepted immediately, but its own consumption is
    /// timed against the previous occupant's *latency*, imposing chained
    /// producer/consumer timing on adjacent occupants regardless of any true
    /// data dependency. Checked as a soft stall, never a hard hazard.
    LatencyDevice,
    /// A decoupled queue of the given depth: no structural hazard while free
    /// slots remain; filling the queue is itself a hazard.
    Buffered(u32),
    /// Draws slots from the model's single global buffered-op pool rather
    /// than a private queue.
    Unified,
}

impl BufferKind {
    /// Is this the one-deep chained-latency staging buffer?
    pub fn is_latency_device(self) -> bool {
        matches!(self, BufferKind::LatencyDevice)
    }
}

/// Construction-time description of one resource. Fed to
/// [`ResourceModelBuilder::add`]; ids are assigned in insertion order.
#[derive(Clone, Debug)]
pub struct ProcResourceDesc {
    /// Human-readable name, unique within the model.
    pub name: String,
    /// Unit count: the resource accepts up to this many concurrent
    /// reservations, i.e. a throughput of `units` uops per cycle. For a
    /// group, zero means "derive from the members".
    pub units: u32,
    /// Buffering behavior.
    pub buffer: BufferKind,
    /// Super-resource parents. At most one *independent* parent is
    /// expressible; redundant entries already on one ancestor chain are
    /// deduplicated, anything else is rejected at construction.
    pub supers: SmallVec<[ResourceId; 2]>,
    /// Member resources, if this is a group. Empty for atomic resources.
    pub members: SmallVec<[ResourceId; 4]>,
}

impl ProcResourceDesc {
    /// An atomic (non-group) resource with the given unit count.
    pub fn atomic(name: &str, units: u32) -> ProcResourceDesc {
        ProcResourceDesc {
            name: name.to_string(),
            units,
            buffer: BufferKind::Unbuffered,
            supers: SmallVec::new(),
            members: SmallVec::new(),
        }
    }

    /// A group over the given members; the unit count is derived as the sum
    /// of the member unit counts.
    pub fn group(name: &str, members: &[ResourceId]) -> ProcResourceDesc {
        ProcResourceDesc {
            name: name.to_string(),
            units: 0,
            buffer: BufferKind::Unbuffered,
            supers: SmallVec::new(),
            members: members.iter().copied().collect(),
        }
    }

    /// Set the buffering behavior.
    pub fn with_buffer(mut self, buffer: BufferKind) -> ProcResourceDesc {
        self.buffer = buffer;
        self
    }

    /// Add a super-resource parent.
    pub fn with_super(mut self, parent: ResourceId) -> ProcResourceDesc {
        self.supers.push(parent);
        self
    }
}

/// Builder for a [`ResourceModel`]. Collects descriptors, then `build()`
/// runs the validation and normalization pass.
pub struct ResourceModelBuilder {
    descs: Vec<ProcResourceDesc>,
    issue_width: u32,
    max_buffered_ops: u32,
}

impl ResourceModelBuilder {
    /// Create a builder for a machine with the given issue width (uops
    /// dispatched per cycle, used only for occupancy normalization).
    pub fn new(issue_width: u32) -> ResourceModelBuilder {
        ResourceModelBuilder {
            descs: vec![],
            issue_width: issue_width.max(1),
            max_buffered_ops: u32::MAX,
        }
    }

    /// Set the global buffered-op pool size used by [`BufferKind::Unified`]
    /// resources. Unlimited by default.
    pub fn max_buffered_ops(mut self, max: u32) -> ResourceModelBuilder {
        self.max_buffered_ops = max;
        self
    }

    /// Add a resource descriptor; returns the id it will have in the built
    /// model. All validation is deferred to `build()`.
    pub fn add(&mut self, desc: ProcResourceDesc) -> ResourceId {
        let id = ResourceId(self.descs.len() as u32);
        self.descs.push(desc);
        id
    }

    /// Validate the descriptors and compute the expansion and normalization
    /// tables. All malformed-model conditions surface here as
    /// [`ConfigurationError`]; nothing is recoverable.
    pub fn build(self) -> SchedResult<ResourceModel> {
        let ResourceModelBuilder {
            mut descs,
            issue_width,
            max_buffered_ops,
        } = self;
        let n = descs.len();

        // Unique names, and a name->id map for diagnostics.
        let mut by_name: HashMap<String, ResourceId> = HashMap::with_capacity(n);
        for (i, desc) in descs.iter().enumerate() {
            if by_name
                .insert(desc.name.clone(), ResourceId(i as u32))
                .is_some()
            {
                return Err(ConfigurationError::DuplicateName(desc.name.clone()).into());
            }
        }

        // All referenced ids must be in range.
        for desc in &descs {
            for id in desc.supers.iter().chain(desc.members.iter()) {
                if id.index() >= n {
                    return Err(ConfigurationError::UnknownResource {
                        name: desc.name.clone(),
                        id: *id,
                    }
                    .into());
                }
            }
        }

        // Invert membership: which groups directly contain each resource.
        let mut containing: Vec<SmallVec<[ResourceId; 2]>> = vec![SmallVec::new(); n];
        for (g, desc) in descs.iter().enumerate() {
            for m in &desc.members {
                containing[m.index()].push(ResourceId(g as u32));
            }
        }

        // Cycle check over the combined upward relation (super edges plus
        // member-to-group edges) with a three-color DFS. The relation must
        // be a DAG for expansion to terminate.
        let mut color = vec![Color::White; n];
        for r in 0..n {
            check_acyclic(r, &descs, &containing, &mut color)?;
        }

        // Super-resource chains must be single-owner: if a resource lists
        // two parents, one must be an ancestor of the other (the nearer one
        // is kept). Two independent parents would require simultaneous
        // capacity limits that expansion cannot preserve.
        for i in 0..n {
            let supers = normalize_supers(i, &descs)?;
            descs[i].supers = supers;
        }

        // Derive or cross-check group unit counts.
        for i in 0..n {
            if descs[i].members.is_empty() {
                continue;
            }
            let derived: u32 = descs[i]
                .members
                .iter()
                .map(|m| descs[m.index()].units)
                .sum();
            if descs[i].units == 0 {
                descs[i].units = derived;
            } else if descs[i].units != derived {
                return Err(ConfigurationError::GroupUnitMismatch {
                    name: descs[i].name.clone(),
                    declared: descs[i].units,
                    derived,
                }
                .into());
            }
        }

        // Remaining per-resource sanity.
        for desc in &descs {
            if desc.units == 0 {
                return Err(ConfigurationError::ZeroUnits(desc.name.clone()).into());
            }
            if desc.buffer == BufferKind::Buffered(0) {
                return Err(ConfigurationError::ZeroBuffer(desc.name.clone()).into());
            }
            if desc.buffer == BufferKind::Unified && max_buffered_ops == 0 {
                return Err(ConfigurationError::ZeroUnifiedPool(desc.name.clone()).into());
            }
        }

        // The expansion table: for each resource, the transitive closure of
        // "containing group or super-resource", plus the resource itself.
        // Sorted and deduplicated; computed once, never per dispatch.
        let mut expansion: Vec<SmallVec<[ResourceId; 4]>> = Vec::with_capacity(n);
        for r in 0..n {
            let mut set: SmallVec<[ResourceId; 4]> = SmallVec::new();
            let mut stack: SmallVec<[ResourceId; 8]> = SmallVec::new();
            stack.push(ResourceId(r as u32));
            while let Some(x) = stack.pop() {
                if set.contains(&x) {
                    continue;
                }
                set.push(x);
                stack.extend(descs[x.index()].supers.iter().copied());
                stack.extend(containing[x.index()].iter().copied());
            }
            set.sort_unstable();
            expansion.push(set);
        }

        // Normalization factors equalize ingress/egress ratios across
        // heterogeneous resources: occupancy on resource R is scaled by
        // LCM(issue_width, all unit counts) / R.units before being compared
        // against the critical-path bound.
        let mut norm_lcm = issue_width as u64;
        for desc in &descs {
            norm_lcm = lcm(norm_lcm, desc.units as u64);
        }
        let factors: Vec<u64> = descs.iter().map(|d| norm_lcm / d.units as u64).collect();

        debug!(
            "resource model built: {} resources, issue width {}, normalization LCM {}",
            n, issue_width, norm_lcm
        );

        Ok(ResourceModel {
            descs,
            by_name,
            expansion,
            factors,
            norm_lcm,
            issue_width,
            max_buffered_ops,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn check_acyclic(
    r: usize,
    descs: &[ProcResourceDesc],
    containing: &[SmallVec<[ResourceId; 2]>],
    color: &mut [Color],
) -> SchedResult<()> {
    match color[r] {
        Color::Black => return Ok(()),
        Color::Gray => {
            return Err(ConfigurationError::ResourceCycle(descs[r].name.clone()).into());
        }
        Color::White => {}
    }
    color[r] = Color::Gray;
    for next in descs[r].supers.iter().chain(containing[r].iter()) {
        check_acyclic(next.index(), descs, containing, color)?;
    }
    color[r] = Color::Black;
    Ok(())
}

/// Walk the super chain upward from `r`, collecting every ancestor.
/// The combined relation is already known to be acyclic when this runs.
fn super_ancestors(r: ResourceId, descs: &[ProcResourceDesc]) -> SmallVec<[ResourceId; 4]> {
    let mut out: SmallVec<[ResourceId; 4]> = SmallVec::new();
    let mut stack: SmallVec<[ResourceId; 4]> = descs[r.index()].supers.iter().copied().collect();
    while let Some(x) = stack.pop() {
        if out.contains(&x) {
            continue;
        }
        out.push(x);
        stack.extend(descs[x.index()].supers.iter().copied());
    }
    out
}

/// Deduplicate a resource's declared super-parents down to the nearest
/// parent per chain, rejecting genuinely independent parents.
fn normalize_supers(
    i: usize,
    descs: &[ProcResourceDesc],
) -> SchedResult<SmallVec<[ResourceId; 2]>> {
    let mut kept: SmallVec<[ResourceId; 2]> = SmallVec::new();
    for &p in &descs[i].supers {
        let mut subsumed = false;
        kept.retain(|&mut q| {
            if q == p || super_ancestors(q, descs).contains(&p) {
                // `p` is `q` or above `q`; the nearer parent `q` wins.
                subsumed = true;
                true
            } else {
                // Keep `q` unless it sits above `p`.
                !super_ancestors(p, descs).contains(&q)
            }
        });
        if !subsumed && !kept.contains(&p) {
            kept.push(p);
        }
        if kept.len() > 1 {
            return Err(ConfigurationError::UnrepresentableOverlap {
                resource: descs[i].name.clone(),
                first: descs[kept[0].index()].name.clone(),
                second: descs[kept[1].index()].name.clone(),
            }
            .into());
        }
    }
    Ok(kept)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// The immutable, pre-normalized resource model. Built once via
/// [`ResourceModelBuilder::build`] and shared by reference across regions.
pub struct ResourceModel {
    descs: Vec<ProcResourceDesc>,
    by_name: HashMap<String, ResourceId>,
    expansion: Vec<SmallVec<[ResourceId; 4]>>,
    factors: Vec<u64>,
    norm_lcm: u64,
    issue_width: u32,
    max_buffered_ops: u32,
}

impl ResourceModel {
    /// Number of resources in the model.
    pub fn num_resources(&self) -> usize {
        self.descs.len()
    }

    /// Descriptor for a resource.
    pub fn desc(&self, r: ResourceId) -> &ProcResourceDesc {
        &self.descs[r.index()]
    }

    /// Name of a resource.
    pub fn name(&self, r: ResourceId) -> &str {
        &self.descs[r.index()].name
    }

    /// Unit count of a resource.
    pub fn units(&self, r: ResourceId) -> u32 {
        self.descs[r.index()].units
    }

    /// Buffering behavior of a resource.
    pub fn buffer(&self, r: ResourceId) -> BufferKind {
        self.descs[r.index()].buffer
    }

    /// Look a resource up by name.
    pub fn resource_by_name(&self, name: &str) -> Option<ResourceId> {
        self.by_name.get(name).copied()
    }

    /// The full effective set of resources a direct use of `r` implicitly
    /// reserves: `r` itself, every group transitively containing it, and
    /// every super-resource ancestor. Sorted by id; idempotent by
    /// construction (the expansion of anything in `expand(r)` is a subset
    /// of `expand(r)`... of the union, which this precomputes).
    pub fn expand(&self, r: ResourceId) -> &[ResourceId] {
        &self.expansion[r.index()]
    }

    /// Occupancy normalization factor for `r`: `LCM / units`.
    pub fn factor(&self, r: ResourceId) -> u64 {
        self.factors[r.index()]
    }

    /// The normalization LCM (`LCM(issue_width, all unit counts)`). A bound
    /// expressed in cycles is scaled by this before being compared against
    /// normalized occupancy.
    pub fn norm_lcm(&self) -> u64 {
        self.norm_lcm
    }

    /// Machine issue width.
    pub fn issue_width(&self) -> u32 {
        self.issue_width
    }

    /// Global buffered-op pool size for [`BufferKind::Unified`] resources.
    pub fn max_buffered_ops(&self) -> u32 {
        self.max_buffered_ops
    }
}

impl fmt::Debug for ResourceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ResourceModel {{")?;
        for (i, desc) in self.descs.iter().enumerate() {
            let r = ResourceId(i as u32);
            write!(
                f,
                "  {}: `{}` units={} buffer={:?} factor={}",
                r,
                desc.name,
                desc.units,
                desc.buffer,
                self.factors[i]
            )?;
            let exp: Vec<&str> = self.expand(r).iter().map(|x| self.name(*x)).collect();
            writeln!(f, " expand={:?}", exp)?;
        }
        writeln!(f, "}}")
    }
}
