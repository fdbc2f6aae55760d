// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackforge
//!
//! A declarative, graph-ordered orchestration engine for cloud infrastructure
//! resources.
//!
//! ## Overview
//!
//! Stackforge turns a catalog of declared resources into provider-side
//! infrastructure:
//!
//! - Declare resources, their attributes, and dependencies in a YAML catalog
//! - Build a dependency graph from attribute references and explicit edges
//! - Resolve dynamic discovery queries (subnet enumeration, zone
//!   eligibility) as first-class graph units
//! - Execute creation and destruction in topological order with bounded
//!   concurrency, idempotency, and partial-failure recovery
//!
//! ## Architecture
//!
//! The engine reconciles **desired state** (the catalog) against **recorded
//! state** (the state store):
//!
//! 1. **Catalog**: parsed and validated from `stackforge.yaml`
//! 2. **Plan**: a side-effect-free diff of desired vs. recorded state
//! 3. **Graph walk**: plan actions executed in dependency order
//!
//! ## Modules
//!
//! - [`catalog`]: declaration parsing, validation, and hashing
//! - [`graph`]: dependency graph construction and cycle detection
//! - [`provider`]: cloud provider API, discovery, and placement eligibility
//! - [`planner`]: desired-vs-recorded diffing and plan construction
//! - [`engine`]: worker-pool graph walk with retry and skip cascade
//! - [`state`]: state record storage backends (local, S3)
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: analytics
//!   region: eu-west-1
//!
//! resources:
//!   - id: cluster_role
//!     kind: role
//!     attributes:
//!       assume_policy: clusters.provider.example
//!   - id: cluster
//!     kind: cluster
//!     attributes:
//!       role_arn: "${cluster_role.arn}"
//!       subnet_ids: "${subnets:${var.vpc_id}}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod catalog;
pub mod cli;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use catalog::{Catalog, CatalogParser, CatalogValidator, SpecHasher};
pub use cli::{Cli, Commands, OutputFormatter};
pub use engine::{ExecutionEngine, RunContext, RunOutcome};
pub use error::{Result, StackforgeError};
pub use graph::{Graph, GraphBuilder};
pub use planner::{DiffEngine, Plan};
pub use provider::{CloudProvider, DiscoveryResolver, HttpProvider, PlacementPolicy, ZoneFilter};
pub use state::{LocalStateStore, S3StateStore, StateFile, StateStore};
