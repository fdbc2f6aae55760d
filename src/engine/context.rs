//! Per-run execution context.
//!
//! Provider region, concurrency bounds, polling cadence, and the
//! cancellation flag are threaded explicitly through every resolver and
//! engine call as a [`RunContext`]. The context lives for exactly one engine
//! invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::catalog::{Catalog, ResourceKind};

/// Default worker count for concurrent unit execution.
pub const DEFAULT_WORKERS: usize = 10;

/// Default readiness polling interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Default creation timeout for cluster-class resources in seconds.
pub const DEFAULT_CLUSTER_TIMEOUT_SECS: u64 = 20 * 60;

/// Default timeout for IAM-class resources in seconds.
pub const DEFAULT_IAM_TIMEOUT_SECS: u64 = 5 * 60;

/// Context for one engine invocation.
#[derive(Debug)]
pub struct RunContext {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Provider region, if configured.
    pub region: Option<String>,
    /// Prefix for provider-side resource names (`project-environment`).
    pub name_prefix: String,
    /// Maximum number of units executing concurrently.
    pub workers: usize,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Overall readiness timeout for cluster-class resources.
    pub cluster_timeout: Duration,
    /// Overall timeout for IAM-class resources.
    pub iam_timeout: Duration,
    /// Set once the run is cancelled; checked before scheduling each unit.
    cancelled: AtomicBool,
}

impl RunContext {
    /// Creates a run context for a catalog with default tuning.
    #[must_use]
    pub fn for_catalog(catalog: &Catalog) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            region: catalog.project.region.clone(),
            name_prefix: catalog.qualified_name(),
            workers: DEFAULT_WORKERS,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            cluster_timeout: Duration::from_secs(DEFAULT_CLUSTER_TIMEOUT_SECS),
            iam_timeout: Duration::from_secs(DEFAULT_IAM_TIMEOUT_SECS),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Overrides the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Overrides the readiness polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Marks the run as cancelled. Already running units reach a terminal
    /// state; nothing new is scheduled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the readiness timeout for a resource kind.
    #[must_use]
    pub const fn timeout_for(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::Cluster | ResourceKind::NodeGroup => self.cluster_timeout,
            ResourceKind::Role | ResourceKind::PolicyAttachment => self.iam_timeout,
        }
    }

    /// Returns the provider-side name for a declared resource.
    #[must_use]
    pub fn resource_name(&self, id: &str) -> String {
        format!("{}-{id}", self.name_prefix)
    }
}
