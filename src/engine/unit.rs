//! Execution unit states and run outcomes.
//!
//! Every graph unit moves `Pending → Running → Succeeded | Failed`, with
//! `Skipped` for units whose ancestors failed (or whose scheduling was
//! cancelled). The run-level [`RunOutcome`] aggregates all unit outcomes and
//! is the only result surfaced to callers.

use serde::Serialize;

/// State of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Not yet eligible or not yet scheduled.
    Pending,
    /// Action in flight.
    Running,
    /// Action completed; outputs available to dependents.
    Succeeded,
    /// Action failed terminally.
    Failed,
    /// Never attempted: a transitive dependency failed, or the run was
    /// cancelled before scheduling.
    Skipped,
}

/// A streamed unit state transition.
#[derive(Debug, Clone, Serialize)]
pub struct UnitEvent {
    /// Unit id.
    pub unit: String,
    /// New state.
    pub state: UnitState,
    /// Optional human-readable detail (terminal error, skip cause).
    pub detail: Option<String>,
}

/// A unit that completed successfully.
#[derive(Debug, Clone, Serialize)]
pub struct UnitSuccess {
    /// Unit id.
    pub unit: String,
    /// Provider attempts the action took, retries included.
    pub attempts: u32,
}

/// A unit that failed terminally.
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    /// Unit id.
    pub unit: String,
    /// Terminal error message.
    pub error: String,
    /// Attempts made before giving up.
    pub attempts: u32,
}

/// Why a unit was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// A transitive dependency failed.
    FailedAncestor(String),
    /// The run was cancelled before the unit was scheduled.
    Cancelled,
}

/// A unit that was never attempted.
#[derive(Debug, Clone, Serialize)]
pub struct UnitSkip {
    /// Unit id.
    pub unit: String,
    /// Why the unit was skipped.
    pub cause: SkipCause,
}

/// Result of one engine run.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every unit succeeded.
    AllSucceeded {
        /// Successful units.
        succeeded: Vec<UnitSuccess>,
    },
    /// At least one unit failed or was skipped.
    PartialFailure {
        /// Successful units.
        succeeded: Vec<UnitSuccess>,
        /// Failed units with their terminal errors.
        failed: Vec<UnitFailure>,
        /// Skipped units with their causes.
        skipped: Vec<UnitSkip>,
    },
    /// The run never started executing (config or graph error, or a held
    /// lock).
    Aborted {
        /// Why the run aborted.
        reason: String,
    },
}

impl RunOutcome {
    /// Builds an outcome from collected unit results.
    #[must_use]
    pub fn from_results(
        succeeded: Vec<UnitSuccess>,
        failed: Vec<UnitFailure>,
        skipped: Vec<UnitSkip>,
    ) -> Self {
        if failed.is_empty() && skipped.is_empty() {
            Self::AllSucceeded { succeeded }
        } else {
            Self::PartialFailure {
                succeeded,
                failed,
                skipped,
            }
        }
    }

    /// Returns true if every unit succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::AllSucceeded { .. })
    }

    /// Returns the successful units, if the run executed.
    #[must_use]
    pub fn succeeded(&self) -> &[UnitSuccess] {
        match self {
            Self::AllSucceeded { succeeded } | Self::PartialFailure { succeeded, .. } => succeeded,
            Self::Aborted { .. } => &[],
        }
    }

    /// Returns the failed units, if any.
    #[must_use]
    pub fn failed(&self) -> &[UnitFailure] {
        match self {
            Self::PartialFailure { failed, .. } => failed,
            _ => &[],
        }
    }

    /// Returns the skipped units, if any.
    #[must_use]
    pub fn skipped(&self) -> &[UnitSkip] {
        match self {
            Self::PartialFailure { skipped, .. } => skipped,
            _ => &[],
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for SkipCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailedAncestor(ancestor) => write!(f, "dependency '{ancestor}' failed"),
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllSucceeded { succeeded } => {
                write!(f, "All {} units succeeded", succeeded.len())
            }
            Self::PartialFailure {
                succeeded,
                failed,
                skipped,
            } => {
                writeln!(
                    f,
                    "Run finished with failures: {} succeeded, {} failed, {} skipped",
                    succeeded.len(),
                    failed.len(),
                    skipped.len()
                )?;
                for failure in failed {
                    writeln!(f, "  failed: {} - {}", failure.unit, failure.error)?;
                }
                for skip in skipped {
                    writeln!(f, "  skipped: {} ({})", skip.unit, skip.cause)?;
                }
                Ok(())
            }
            Self::Aborted { reason } => write!(f, "Run aborted: {reason}"),
        }
    }
}
