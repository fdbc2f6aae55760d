//! Diff engine for comparing desired vs. recorded state.
//!
//! The diff classifies every declared resource against its state record:
//! `create` when no record exists, `update` when attributes changed
//! compatibly, `replace` when an update-incompatible attribute changed, and
//! `no_change` when the declared spec hash matches. Records with no declared
//! counterpart become `destroy`.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::catalog::{Catalog, ResourceKind, ResourceSpec, SpecHasher};
use crate::state::StateRecord;

/// Engine for computing diffs between desired and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Spec hasher.
    hasher: SpecHasher,
}

/// Classification of one resource's pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Resource has no record and will be created.
    Create,
    /// Resource exists and changed compatibly; updated in place.
    Update,
    /// Resource exists but an update-incompatible attribute changed;
    /// destroyed and recreated.
    Replace,
    /// Record has no declared counterpart and will be destroyed.
    Destroy,
    /// Declared spec matches the record.
    NoChange,
}

/// Pending change for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceChange {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Change classification.
    pub change: ChangeKind,
    /// Names of attributes that differ from the record.
    pub changed_attributes: Vec<String>,
    /// Provider id of the existing resource, if recorded.
    pub provider_id: Option<String>,
    /// New spec hash, for declared resources.
    pub new_hash: Option<String>,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// All resource changes: declared resources in declaration order, then
    /// orphaned records in id order.
    pub changes: Vec<ResourceChange>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of in-place updates.
    pub updates: usize,
    /// Number of replacements.
    pub replacements: usize,
    /// Number of resources to destroy.
    pub destroys: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: SpecHasher::new(),
        }
    }

    /// Computes the diff between a catalog and the recorded state.
    #[must_use]
    pub fn compute_diff(
        &self,
        catalog: &Catalog,
        records: &HashMap<String, StateRecord>,
    ) -> DiffResult {
        let mut changes = Vec::new();

        for resource in &catalog.resources {
            let new_hash = self.hasher.hash_resource(resource);
            changes.push(Self::classify_resource(
                resource,
                records.get(&resource.id),
                new_hash,
            ));
        }

        // Records with no declared counterpart are orphans to destroy.
        let mut orphans: Vec<&StateRecord> = records
            .values()
            .filter(|record| catalog.resource(&record.id).is_none())
            .collect();
        orphans.sort_by(|a, b| a.id.cmp(&b.id));

        for record in orphans {
            debug!("Found orphaned record: {}", record.id);
            changes.push(ResourceChange {
                id: record.id.clone(),
                kind: record.kind,
                change: ChangeKind::Destroy,
                changed_attributes: vec![],
                provider_id: Some(record.provider_id.clone()),
                new_hash: None,
            });
        }

        let creates = changes.iter().filter(|c| c.change == ChangeKind::Create).count();
        let updates = changes.iter().filter(|c| c.change == ChangeKind::Update).count();
        let replacements = changes.iter().filter(|c| c.change == ChangeKind::Replace).count();
        let destroys = changes.iter().filter(|c| c.change == ChangeKind::Destroy).count();
        let unchanged = changes.iter().filter(|c| c.change == ChangeKind::NoChange).count();

        DiffResult {
            changes,
            creates,
            updates,
            replacements,
            destroys,
            unchanged,
        }
    }

    /// Classifies one declared resource against its record.
    fn classify_resource(
        resource: &ResourceSpec,
        record: Option<&StateRecord>,
        new_hash: String,
    ) -> ResourceChange {
        let Some(record) = record else {
            debug!("Resource {} needs to be created", resource.id);
            return ResourceChange {
                id: resource.id.clone(),
                kind: resource.kind,
                change: ChangeKind::Create,
                changed_attributes: vec![],
                provider_id: None,
                new_hash: Some(new_hash),
            };
        };

        if record.spec_hash == new_hash {
            debug!("Resource {} is up to date", resource.id);
            return ResourceChange {
                id: resource.id.clone(),
                kind: resource.kind,
                change: ChangeKind::NoChange,
                changed_attributes: vec![],
                provider_id: Some(record.provider_id.clone()),
                new_hash: Some(new_hash),
            };
        }

        let changed_attributes = Self::changed_attributes(resource, record);
        let forces_replacement = changed_attributes
            .iter()
            .any(|name| resource.kind.replacement_attributes().contains(&name.as_str()));

        let change = if forces_replacement {
            ChangeKind::Replace
        } else {
            ChangeKind::Update
        };

        debug!(
            "Resource {} needs {change:?} ({} attributes changed)",
            resource.id,
            changed_attributes.len()
        );

        ResourceChange {
            id: resource.id.clone(),
            kind: resource.kind,
            change,
            changed_attributes,
            provider_id: Some(record.provider_id.clone()),
            new_hash: Some(new_hash),
        }
    }

    /// Returns the attribute names whose declared value differs from the
    /// applied spec in the record.
    fn changed_attributes(resource: &ResourceSpec, record: &StateRecord) -> Vec<String> {
        let names: BTreeSet<&String> = resource
            .attributes
            .keys()
            .chain(record.spec.keys())
            .collect();

        names
            .into_iter()
            .filter(|name| resource.attributes.get(*name) != record.spec.get(*name))
            .cloned()
            .collect()
    }
}

impl DiffResult {
    /// Returns true if any change requires provider action.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replacements > 0 || self.destroys > 0
    }

    /// Filters to changes that require action.
    #[must_use]
    pub fn actionable_changes(&self) -> Vec<&ResourceChange> {
        self.changes
            .iter()
            .filter(|c| c.change != ChangeKind::NoChange)
            .collect()
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.change)?;
        if !self.changed_attributes.is_empty() {
            write!(f, " ({})", self.changed_attributes.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogParser;
    use crate::provider::ResourceAttrs;

    const CATALOG: &str = r#"
project:
  name: analytics
resources:
  - id: cluster_role
    kind: role
    attributes:
      assume_policy: clusters.provider.example
  - id: workers
    kind: node_group
    attributes:
      cluster: "${cluster.name}"
      role_arn: "${node_role.arn}"
      subnet_ids: "${subnets:vpc-1}"
      instance_type: m5.large
      scaling:
        min: 1
        desired: 2
        max: 4
"#;

    fn catalog() -> Catalog {
        CatalogParser::new().parse_yaml(CATALOG, None).unwrap()
    }

    fn record_for(resource: &ResourceSpec) -> StateRecord {
        let hasher = SpecHasher::new();
        StateRecord::new(
            &resource.id,
            resource.kind,
            resource.attributes.clone(),
            &hasher.hash_resource(resource),
            ResourceAttrs::new(),
            &format!("prov-{}", resource.id),
        )
    }

    #[test]
    fn test_no_records_all_creates() {
        let catalog = catalog();
        let diff = DiffEngine::new().compute_diff(&catalog, &HashMap::new());

        assert_eq!(diff.creates, 2);
        assert_eq!(diff.destroys, 0);
        assert!(diff.has_changes());
    }

    #[test]
    fn test_matching_records_unchanged() {
        let catalog = catalog();
        let records: HashMap<String, StateRecord> = catalog
            .resources
            .iter()
            .map(|r| (r.id.clone(), record_for(r)))
            .collect();

        let diff = DiffEngine::new().compute_diff(&catalog, &records);

        assert_eq!(diff.unchanged, 2);
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_compatible_change_is_update() {
        let mut catalog = catalog();
        let records: HashMap<String, StateRecord> = catalog
            .resources
            .iter()
            .map(|r| (r.id.clone(), record_for(r)))
            .collect();

        // Scaling is not a replacement attribute on node groups.
        let workers = catalog.resources.iter_mut().find(|r| r.id == "workers").unwrap();
        workers.attributes.insert(
            String::from("scaling"),
            crate::catalog::AttrValue::Literal(
                serde_json::json!({"min": 1, "desired": 3, "max": 6}),
            ),
        );

        let diff = DiffEngine::new().compute_diff(&catalog, &records);
        let change = diff.changes.iter().find(|c| c.id == "workers").unwrap();

        assert_eq!(change.change, ChangeKind::Update);
        assert_eq!(change.changed_attributes, vec!["scaling"]);
    }

    #[test]
    fn test_incompatible_change_is_replace() {
        let mut catalog = catalog();
        let records: HashMap<String, StateRecord> = catalog
            .resources
            .iter()
            .map(|r| (r.id.clone(), record_for(r)))
            .collect();

        let workers = catalog.resources.iter_mut().find(|r| r.id == "workers").unwrap();
        workers.attributes.insert(
            String::from("instance_type"),
            crate::catalog::AttrValue::Literal(serde_json::json!("m5.xlarge")),
        );

        let diff = DiffEngine::new().compute_diff(&catalog, &records);
        let change = diff.changes.iter().find(|c| c.id == "workers").unwrap();

        assert_eq!(change.change, ChangeKind::Replace);
    }

    #[test]
    fn test_orphaned_record_is_destroy() {
        let catalog = catalog();
        let mut records: HashMap<String, StateRecord> = catalog
            .resources
            .iter()
            .map(|r| (r.id.clone(), record_for(r)))
            .collect();
        records.insert(
            String::from("stale"),
            StateRecord::new(
                "stale",
                ResourceKind::Role,
                std::collections::BTreeMap::new(),
                "old",
                ResourceAttrs::new(),
                "prov-stale",
            ),
        );

        let diff = DiffEngine::new().compute_diff(&catalog, &records);

        assert_eq!(diff.destroys, 1);
        let destroy = diff.changes.iter().find(|c| c.id == "stale").unwrap();
        assert_eq!(destroy.change, ChangeKind::Destroy);
        assert_eq!(destroy.provider_id.as_deref(), Some("prov-stale"));
    }
}
