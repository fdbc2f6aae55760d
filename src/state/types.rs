//! Persisted state types.
//!
//! A [`StateRecord`] holds the last-known-good shape of one created
//! resource. Records are the basis for plan diffs and drive destroy
//! ordering. The [`StateFile`] is the unit of persistence exchanged with a
//! state backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::catalog::{AttrValue, ResourceKind};
use crate::provider::ResourceAttrs;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// The complete persisted state for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last fully applied catalog.
    pub catalog_hash: String,
    /// Records of created resources, keyed by resource id.
    pub records: HashMap<String, StateRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Persisted record of one created resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Catalog resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// The declared spec as applied, used for attribute-level diffing.
    pub spec: BTreeMap<String, AttrValue>,
    /// Hash of the declared spec as applied.
    pub spec_hash: String,
    /// Last-applied resolved attributes, including provider outputs.
    pub attributes: ResourceAttrs,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: RunOperation,
    /// Catalog hash at run time.
    pub catalog_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the run succeeded in full.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of engine runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Creation/update run.
    Apply,
    /// Teardown run.
    Destroy,
}

impl StateFile {
    /// Creates a new empty state file.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            catalog_hash: String::new(),
            records: HashMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by resource id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Adds or replaces a record.
    pub fn put(&mut self, record: StateRecord) {
        self.records.insert(record.id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by resource id.
    pub fn remove(&mut self, id: &str) -> Option<StateRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Returns all record ids, sorted.
    #[must_use]
    pub fn record_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.records.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a history entry, keeping the most recent entries only.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        const MAX_HISTORY: usize = 100;
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl StateRecord {
    /// Creates a new record for a freshly created resource.
    #[must_use]
    pub fn new(
        id: &str,
        kind: ResourceKind,
        spec: BTreeMap<String, AttrValue>,
        spec_hash: &str,
        attributes: ResourceAttrs,
        provider_id: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            kind,
            spec,
            spec_hash: spec_hash.to_string(),
            attributes,
            provider_id: provider_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the applied spec and attributes after a successful update.
    pub fn apply_update(
        &mut self,
        spec: BTreeMap<String, AttrValue>,
        spec_hash: &str,
        attributes: ResourceAttrs,
    ) {
        self.spec = spec;
        self.spec_hash = spec_hash.to_string();
        self.attributes = attributes;
        self.updated_at = Utc::now();
    }
}

impl RunHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: RunOperation, catalog_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            catalog_hash: catalog_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        catalog_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            catalog_hash: catalog_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
