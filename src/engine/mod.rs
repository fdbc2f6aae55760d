//! Execution engine: worker-pool graph walk with retry and skip cascade.
//!
//! The engine consumes a built [`crate::graph::Graph`] and a
//! [`crate::planner::Plan`], executes unit actions against the provider in
//! dependency order, and aggregates per-unit outcomes into a [`RunOutcome`].

mod context;
mod executor;
mod unit;

pub use context::{
    RunContext, DEFAULT_CLUSTER_TIMEOUT_SECS, DEFAULT_IAM_TIMEOUT_SECS,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_WORKERS,
};
pub use executor::ExecutionEngine;
pub use unit::{RunOutcome, SkipCause, UnitEvent, UnitFailure, UnitSkip, UnitState, UnitSuccess};
