//! A cycle-accurate, multi-resource instruction scheduling simulator.
//!
//! This crate consumes a basic block's worth of annotated instructions plus a
//! declarative description of processor resources (execution pipes, pipe
//! groups, super-resources, buffering behavior), and produces an instruction
//! order together with resource-utilization diagnostics: a per-cycle
//! reservation table, per-instruction issue cycles, the critical resource,
//! and hazard-induced stalls.
//!
//! The pipeline is:
//!
//! - [`ResourceModel`]: immutable, pre-normalized resource tables, built once
//!   and shared by reference across all scheduling regions.
//! - [`DepGraph`]: the dependency DAG of [`SUnit`]s built from the linear
//!   instruction stream, with latency-weighted depth and height.
//! - [`ReservationTable`]: time-stamped acquisition/release of resource units,
//!   structural-hazard detection, occupancy and throughput accounting.
//! - [`ScheduleBoundary`] + the candidate selector: per-direction pending and
//!   available queues, data- and structural-hazard gates, and an ordered set
//!   of profitability heuristics.
//! - [`schedule_region`]: the driver tying the stages together; see also
//!   [`schedule_regions`] for the embarrassingly parallel multi-region batch.
//!
//! The simulator performs no instruction selection, register allocation, or
//! code generation; it takes an already-annotated instruction list and a
//! resolved resource model, and is purely a library (no CLI or file formats).

#![warn(missing_docs)]

pub use hashbrown::HashMap;
pub use num_rational::Ratio;

pub mod boundary;
pub mod diag;
pub mod graph;
pub mod pressure;
pub mod reservation;
pub mod resource;
pub mod result;
pub mod schedule;
pub mod select;

pub use boundary::{SchedDir, ScheduleBoundary, UnitState};
pub use diag::{Diagnostics, Stall, StallKind};
pub use graph::{
    DepEdge, DepGraph, EdgeKind, InstrDesc, MemEffect, Operand, OperandId, ResourceUse, SUnit,
    SUnitIndex,
};
pub use pressure::{PressureSetId, PressureState, PressureTracker};
pub use reservation::{reciprocal_throughput, ReservationRow, ReservationTable};
pub use resource::{
    BufferKind, ProcResourceDesc, ResourceId, ResourceModel, ResourceModelBuilder,
};
pub use result::{ConfigurationError, GraphError, SchedError, SchedResult};
pub use schedule::{
    schedule_region, schedule_regions, SchedStrategy, Schedule, ScheduleConfig,
};
