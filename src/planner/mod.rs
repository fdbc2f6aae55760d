//! Planning: desired-vs-recorded diffing and plan construction.
//!
//! The [`DiffEngine`] compares the catalog against state records; the
//! resulting [`Plan`] is displayed by `plan` and drives per-unit actions
//! during `apply`.

mod diff;
mod plan;

pub use diff::{ChangeKind, DiffEngine, DiffResult, ResourceChange};
pub use plan::Plan;
