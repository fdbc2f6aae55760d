//! Cloud provider boundary: API trait, HTTP client, discovery, eligibility.
//!
//! The [`CloudProvider`] trait is the engine's single I/O boundary. The
//! [`DiscoveryResolver`] caches read-only inventory queries per signature,
//! and the [`ZoneFilter`] narrows discovered placement targets to the
//! eligible subset.

pub mod api;
mod discovery;
mod eligibility;
mod http;

pub use api::{
    CloudProvider, CreatedResource, DiscoveredItem, ResourceAttrs, ATTR_STATUS, STATUS_ACTIVE,
};
pub use discovery::{DiscoveryResolver, DiscoveryResult};
pub use eligibility::{PlacementPolicy, ZoneFilter};
pub use http::HttpProvider;
