//! Resource catalog for the Stackforge orchestration engine.
//!
//! This module handles all declaration-related functionality:
//! - Parsing and deserializing `stackforge.yaml`
//! - Variable substitution and attribute expression parsing
//! - Validation of declared resources against per-kind schemas
//! - Computing spec hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::SpecHasher;
pub use parser::{find_catalog_file, CatalogParser, DEFAULT_CATALOG_FILES};
pub use spec::{
    AttrValue, Catalog, DiscoveryQuery, PlacementConfig, PlacementPolicyKind, ProjectConfig,
    ResourceKind, ResourceSpec, ScalingConfig, StateBackend, StateConfig,
};
pub use validator::{CatalogValidator, ValidationResult};
