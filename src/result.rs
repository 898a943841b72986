//! Result and error types for model construction, graph building, and
//! scheduling.
//!
//! There is no partial-success mode anywhere in this crate: a region either
//! fully schedules or the call fails with one of the errors below, each of
//! which carries the offending resource or scheduling-unit identity.

use crate::graph::SUnitIndex;
use crate::resource::ResourceId;
use thiserror::Error;

/// A malformed resource model. Fatal at model construction; scheduling never
/// starts if the model fails to build.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// Two resources were declared with the same name.
    #[error("duplicate resource name `{0}`")]
    DuplicateName(String),

    /// A super-resource or group-member reference points outside the model.
    #[error("resource `{name}` references unknown resource id {id}")]
    UnknownResource {
        /// Name of the referencing resource.
        name: String,
        /// The out-of-range id.
        id: ResourceId,
    },

    /// The super-resource / group-membership relations contain a cycle.
    #[error("cycle through resource `{0}` in super-resource/group relations")]
    ResourceCycle(String),

    /// A resource was assigned two super-resources neither of which is an
    /// ancestor of the other. Overlapping capacity shared across two
    /// unrelated parents is not expressible by expansion; an explicit
    /// resource group must be used instead.
    #[error(
        "resource `{resource}` has independent super-resources `{first}` and `{second}`; \
         use an explicit resource group for overlapping capacity"
    )]
    UnrepresentableOverlap {
        /// The doubly-parented resource.
        resource: String,
        /// First declared parent.
        first: String,
        /// Second declared parent.
        second: String,
    },

    /// A resource declared zero units.
    #[error("resource `{0}` declares zero units")]
    ZeroUnits(String),

    /// A group's declared unit count disagrees with the sum of its members'.
    #[error("group `{name}` declares {declared} units but its members provide {derived}")]
    GroupUnitMismatch {
        /// Name of the group.
        name: String,
        /// Units declared on the group itself.
        declared: u32,
        /// Sum of the member unit counts.
        derived: u32,
    },

    /// A decoupled-queue resource declared a zero-slot buffer.
    #[error("buffered resource `{0}` declares a zero-slot buffer")]
    ZeroBuffer(String),

    /// A resource draws from the shared pool, but the pool holds no slots.
    #[error("resource `{0}` draws from the unified pool, but `max_buffered_ops` is zero")]
    ZeroUnifiedPool(String),
}

/// A malformed dependency graph. Fatal at graph-build time; inputs that
/// respect def-use order never produce these, so a cycle here is an invariant
/// violation rather than a user error.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The dependency edges contain a cycle.
    #[error("dependency cycle through instruction {0}")]
    DependencyCycle(SUnitIndex),

    /// An instruction names a resource not present in the model.
    #[error("instruction {su} uses resource id {resource} not present in the model")]
    UnknownResource {
        /// The offending instruction.
        su: SUnitIndex,
        /// The unresolved resource id.
        resource: ResourceId,
    },

    /// An instruction's reservation interval is inverted.
    #[error("instruction {su} reserves resource {resource} over an inverted interval")]
    InvertedReservation {
        /// The offending instruction.
        su: SUnitIndex,
        /// The resource with `acquire_at > release_at`.
        resource: ResourceId,
    },

    /// An operand names a pressure set outside the declared set count.
    #[error("instruction {su} references pressure set {set} out of range")]
    UnknownPressureSet {
        /// The offending instruction.
        su: SUnitIndex,
        /// The out-of-range set index.
        set: u32,
    },
}

/// Top-level scheduling error.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchedError {
    /// The resource model failed to build.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The dependency graph failed to build.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// No candidate can ever become available, yet undispatched units remain.
    /// This must never occur for a well-formed model and graph; it indicates
    /// a logic bug in the engine and is surfaced loudly, never retried.
    #[error(
        "scheduling deadlock: {remaining} instruction(s) undispatched, first stuck: {su}"
    )]
    Deadlock {
        /// A representative stuck unit.
        su: SUnitIndex,
        /// How many units remain undispatched.
        remaining: usize,
    },

    /// The host-imposed wall-clock budget was exhausted. Recoverable by the
    /// host: abandon scheduling for this region and fall back to the
    /// original order (see `Schedule::original_order`).
    #[error("scheduling budget of {budget_ms} ms exceeded after {dispatched} dispatch(es)")]
    BudgetExceeded {
        /// The configured budget, in milliseconds.
        budget_ms: u64,
        /// How many units had been dispatched when the budget ran out.
        dispatched: usize,
    },
}

/// A scheduling result.
pub type SchedResult<T> = Result<T, SchedError>;
