//! Execution plan types.
//!
//! A plan is the user-facing product of `plan` and the action table consumed
//! by the execution engine during `apply`. It is computed without side
//! effects.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::diff::{ChangeKind, DiffResult, ResourceChange};

/// A complete execution plan.
#[derive(Debug)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Catalog hash this plan is based on.
    pub catalog_hash: String,
    /// All resource changes, including unchanged resources.
    pub changes: Vec<ResourceChange>,
    /// Change lookup by resource id.
    by_id: HashMap<String, usize>,
}

impl Plan {
    /// Creates a plan from a diff result.
    #[must_use]
    pub fn from_diff(diff: DiffResult, catalog_hash: &str) -> Self {
        let by_id = diff
            .changes
            .iter()
            .enumerate()
            .map(|(i, change)| (change.id.clone(), i))
            .collect();

        Self {
            created_at: Utc::now(),
            catalog_hash: catalog_hash.to_string(),
            changes: diff.changes,
            by_id,
        }
    }

    /// Returns the planned change for a resource.
    #[must_use]
    pub fn change_for(&self, id: &str) -> Option<&ResourceChange> {
        self.by_id.get(id).map(|&i| &self.changes[i])
    }

    /// Returns true if no change requires provider action.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes
            .iter()
            .all(|c| c.change == ChangeKind::NoChange)
    }

    /// Counts changes of one kind.
    #[must_use]
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.change == kind).count()
    }

    /// Returns the ids of resources scheduled for destruction.
    #[must_use]
    pub fn destroy_ids(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| c.change == ChangeKind::Destroy)
            .map(|c| c.id.as_str())
            .collect()
    }

    /// One-line summary of the plan.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            self.count(ChangeKind::Create),
            self.count(ChangeKind::Update),
            self.count(ChangeKind::Replace),
            self.count(ChangeKind::Destroy),
            self.count(ChangeKind::NoChange),
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution plan:")?;
        for change in &self.changes {
            if change.change != ChangeKind::NoChange {
                writeln!(f, "  {change}")?;
            }
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResourceKind;

    fn change(id: &str, change: ChangeKind) -> ResourceChange {
        ResourceChange {
            id: id.to_string(),
            kind: ResourceKind::Role,
            change,
            changed_attributes: vec![],
            provider_id: None,
            new_hash: None,
        }
    }

    fn plan(changes: Vec<ResourceChange>) -> Plan {
        let creates = changes.iter().filter(|c| c.change == ChangeKind::Create).count();
        Plan::from_diff(
            DiffResult {
                creates,
                updates: 0,
                replacements: 0,
                destroys: 0,
                unchanged: changes.len() - creates,
                changes,
            },
            "hash",
        )
    }

    #[test]
    fn test_empty_plan() {
        let plan = plan(vec![change("a", ChangeKind::NoChange)]);
        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_change_lookup() {
        let plan = plan(vec![
            change("a", ChangeKind::Create),
            change("b", ChangeKind::NoChange),
        ]);

        assert_eq!(plan.change_for("a").unwrap().change, ChangeKind::Create);
        assert!(plan.change_for("ghost").is_none());
        assert!(!plan.is_empty());
        assert_eq!(plan.count(ChangeKind::Create), 1);
    }
}
