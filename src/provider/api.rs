//! Cloud provider boundary types.
//!
//! The [`CloudProvider`] trait is the engine's only I/O boundary. Everything
//! above it (discovery, planning, execution) is provider-agnostic; the
//! production implementation is [`super::HttpProvider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::catalog::{DiscoveryQuery, ResourceKind};
use crate::error::Result;

/// Attribute map exchanged with the provider.
pub type ResourceAttrs = BTreeMap<String, serde_json::Value>;

/// Status value a resource reports once it is fully provisioned.
pub const STATUS_ACTIVE: &str = "active";

/// Attribute name under which the provider reports resource status.
pub const ATTR_STATUS: &str = "status";

/// A resource as returned by a provider create or update call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedResource {
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Provider-reported attributes (identifiers, endpoints, status).
    #[serde(default)]
    pub attributes: ResourceAttrs,
}

/// One item of a discovery result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    /// Provider-assigned identifier of the item.
    pub id: String,
    /// Availability-zone label, if the item carries one.
    #[serde(default)]
    pub zone: Option<String>,
    /// Remaining item attributes.
    #[serde(default)]
    pub attributes: ResourceAttrs,
}

/// The cloud provider API boundary.
///
/// All calls are independent round-trips; retry discipline belongs to the
/// callers (the discovery resolver and the execution engine), not to
/// implementations.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Creates a resource of the given kind.
    async fn create(&self, kind: ResourceKind, attributes: &ResourceAttrs)
        -> Result<CreatedResource>;

    /// Reads the current attributes of a resource.
    ///
    /// Returns [`crate::error::ProviderError::NotFound`] if the provider does
    /// not know the id.
    async fn read(&self, provider_id: &str) -> Result<ResourceAttrs>;

    /// Applies an in-place attribute update to a resource.
    async fn update(
        &self,
        provider_id: &str,
        attributes: &ResourceAttrs,
    ) -> Result<CreatedResource>;

    /// Deletes a resource. Deleting an id the provider no longer knows is an
    /// error; callers treat it as already gone.
    async fn delete(&self, provider_id: &str) -> Result<()>;

    /// Executes a read-only inventory query.
    ///
    /// Implementations must never mutate provider state on this path.
    async fn list(&self, query: &DiscoveryQuery) -> Result<Vec<DiscoveredItem>>;
}

impl DiscoveredItem {
    /// Creates an item with just an id and a zone label.
    #[must_use]
    pub fn new(id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            zone: Some(zone.into()),
            attributes: ResourceAttrs::new(),
        }
    }
}
