//! Spec hashing for change detection.
//!
//! This module provides deterministic hashing of declared resource specs to
//! detect changes between runs and enable idempotent operations.

use sha2::{Digest, Sha256};

use super::spec::{Catalog, ResourceSpec};

/// Hasher for computing spec hashes.
#[derive(Debug, Default)]
pub struct SpecHasher;

impl SpecHasher {
    /// Creates a new spec hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire catalog.
    ///
    /// This hash changes when any declared resource changes.
    #[must_use]
    pub fn hash_catalog(&self, catalog: &Catalog) -> String {
        let mut hasher = Sha256::new();

        hasher.update(catalog.project.name.as_bytes());
        hasher.update(catalog.project.environment.as_bytes());
        if let Some(region) = &catalog.project.region {
            hasher.update(region.as_bytes());
        }

        for resource in &catalog.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single declared resource.
    ///
    /// Attribute iteration order is the `BTreeMap` key order, so the hash is
    /// deterministic for a given declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.id.as_bytes());
        hasher.update(resource.kind.as_str().as_bytes());

        for (name, value) in &resource.attributes {
            hasher.update(name.as_bytes());
            hasher.update(value.to_declaration().to_string().as_bytes());
        }

        let mut deps = resource.explicit_dependencies.clone();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::spec::{AttrValue, ResourceKind};
    use std::collections::BTreeMap;

    fn create_test_resource(id: &str) -> ResourceSpec {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            String::from("assume_policy"),
            AttrValue::Literal(serde_json::json!("clusters.provider.example")),
        );
        ResourceSpec {
            id: id.to_string(),
            kind: ResourceKind::Role,
            attributes,
            explicit_dependencies: vec![],
        }
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = SpecHasher::new();
        let resource = create_test_resource("cluster-role");

        assert_eq!(
            hasher.hash_resource(&resource),
            hasher.hash_resource(&resource)
        );
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = SpecHasher::new();
        let a = create_test_resource("role-a");
        let b = create_test_resource("role-b");

        assert_ne!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_attribute_change_changes_hash() {
        let hasher = SpecHasher::new();
        let a = create_test_resource("role-a");
        let mut b = a.clone();
        b.attributes.insert(
            String::from("assume_policy"),
            AttrValue::Literal(serde_json::json!("nodes.provider.example")),
        );

        assert_ne!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = SpecHasher::new();
        let short = hasher.short_hash("abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }
}
