//! In-run record map with per-resource locking.
//!
//! During a run, execution units read and write state records through a
//! [`RecordSet`]. Each resource id has its own lock, so units touching
//! unrelated resources never contend. The key set is fixed at construction
//! (the union of recorded and declared resource ids); only record values
//! change during a run.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::types::{StateFile, StateRecord};

/// Handle to one resource's record slot.
pub type RecordCell = Arc<Mutex<Option<StateRecord>>>;

/// Per-resource-locked view of the state records for one run.
#[derive(Debug, Default)]
pub struct RecordSet {
    /// One cell per known resource id.
    cells: HashMap<String, RecordCell>,
}

impl RecordSet {
    /// Builds a record set from persisted state plus the declared ids.
    #[must_use]
    pub fn from_state(state: &StateFile, declared_ids: impl IntoIterator<Item = String>) -> Self {
        let mut cells: HashMap<String, RecordCell> = state
            .records
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    Arc::new(Mutex::new(Some(record.clone()))),
                )
            })
            .collect();

        for id in declared_ids {
            cells.entry(id).or_default();
        }

        Self { cells }
    }

    /// Returns the cell for a resource id.
    ///
    /// Every declared or recorded resource has a cell; `None` means the id
    /// is unknown to this run.
    #[must_use]
    pub fn cell(&self, id: &str) -> Option<RecordCell> {
        self.cells.get(id).map(Arc::clone)
    }

    /// Returns every known resource id, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cells.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshots all present records.
    pub async fn snapshot(&self) -> HashMap<String, StateRecord> {
        let mut records = HashMap::new();
        for (id, cell) in &self.cells {
            if let Some(record) = cell.lock().await.clone() {
                records.insert(id.clone(), record);
            }
        }
        records
    }

    /// Writes the current records back into a state file.
    pub async fn flush_into(&self, state: &mut StateFile) {
        state.records = self.snapshot().await;
        state.last_updated = chrono::Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResourceKind;
    use std::collections::BTreeMap;

    fn record(id: &str) -> StateRecord {
        StateRecord::new(
            id,
            ResourceKind::Role,
            BTreeMap::new(),
            "hash",
            crate::provider::ResourceAttrs::new(),
            "prov-1",
        )
    }

    #[tokio::test]
    async fn test_records_survive_round_trip() {
        let mut state = StateFile::new("proj", "dev");
        state.put(record("cluster_role"));

        let set = RecordSet::from_state(&state, [String::from("workers")]);

        // Declared but unrecorded ids have empty cells.
        let cell = set.cell("workers").unwrap();
        assert!(cell.lock().await.is_none());

        // Recorded ids carry their record into the run.
        let cell = set.cell("cluster_role").unwrap();
        assert!(cell.lock().await.is_some());

        let mut out = StateFile::new("proj", "dev");
        set.flush_into(&mut out).await;
        assert_eq!(out.record_ids(), vec!["cluster_role"]);
    }

    #[tokio::test]
    async fn test_mutation_through_cell() {
        let state = StateFile::new("proj", "dev");
        let set = RecordSet::from_state(&state, [String::from("workers")]);

        {
            let cell = set.cell("workers").unwrap();
            *cell.lock().await = Some(record("workers"));
        }

        let snapshot = set.snapshot().await;
        assert!(snapshot.contains_key("workers"));
    }

    #[test]
    fn test_unknown_id_has_no_cell() {
        let state = StateFile::new("proj", "dev");
        let set = RecordSet::from_state(&state, []);
        assert!(set.cell("ghost").is_none());
    }
}
