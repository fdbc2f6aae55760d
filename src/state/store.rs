//! State store trait definition.
//!
//! This module defines the common interface for state storage backends. The
//! execution engine never touches persistence directly; it works on a
//! [`super::RecordSet`] that is loaded from and flushed back through this
//! interface around each run.

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::StateFile;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the persisted state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateFile>>;

    /// Saves the persisted state.
    async fn save(&self, state: &StateFile) -> Result<()>;

    /// Deletes the persisted state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks whether persisted state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for the given holder.
    ///
    /// Fails with [`crate::error::StateError::LockedByOther`] if an
    /// unexpired lock is held elsewhere.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the state lock if `lock_id` matches the held lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets the current lock, if one is held.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateFile>> {
        (**self).load().await
    }

    async fn save(&self, state: &StateFile) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
