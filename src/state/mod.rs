//! State storage for the Stackforge orchestration engine.
//!
//! The state store owns the [`StateRecord`]s of created resources. Backends
//! (local file, S3) persist a [`StateFile`] between runs; within a run the
//! engine works on a per-resource-locked [`RecordSet`].

mod local;
mod lock;
mod records;
mod s3;
mod store;
mod types;

pub use local::LocalStateStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use records::{RecordCell, RecordSet};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{RunHistoryEntry, RunOperation, StateFile, StateRecord, STATE_VERSION};
