//! Output formatting for CLI commands.
//!
//! This module renders plans, streamed unit transitions, run outcomes, and
//! recorded state for the terminal, in text or JSON form.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::engine::{RunOutcome, UnitEvent, UnitState};
use crate::planner::{ChangeKind, Plan};
use crate::state::StateFile;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: super::commands::OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Changed")]
    changed: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: super::commands::OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            super::commands::OutputFormat::Json => Self::format_plan_json(plan),
            super::commands::OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as JSON.
    fn format_plan_json(plan: &Plan) -> String {
        let changes: Vec<serde_json::Value> = plan
            .changes
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "kind": c.kind.as_str(),
                    "action": c.change.to_string(),
                    "changed_attributes": c.changed_attributes,
                })
            })
            .collect();

        serde_json::to_string_pretty(&serde_json::json!({
            "catalog_hash": plan.catalog_hash,
            "changes": changes,
        }))
        .unwrap_or_default()
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution plan (catalog {}):\n", &plan.catalog_hash[..plan.catalog_hash.len().min(8)]);

        let rows: Vec<PlanRow> = plan
            .changes
            .iter()
            .filter(|c| c.change != ChangeKind::NoChange)
            .map(|c| PlanRow {
                action: Self::paint_change(c.change),
                resource: c.id.clone(),
                kind: c.kind.to_string(),
                changed: Self::truncate(&c.changed_attributes.join(", "), 40),
            })
            .collect();

        if !rows.is_empty() {
            let _ = writeln!(output, "{}", Table::new(rows));
        }

        if detailed {
            for change in &plan.changes {
                if !change.changed_attributes.is_empty() {
                    let _ = writeln!(
                        output,
                        "  {}: {}",
                        change.id,
                        change.changed_attributes.join(", ")
                    );
                }
            }
        }

        let _ = write!(output, "\n{}", plan.summary());
        output
    }

    /// Formats a run outcome for display.
    #[must_use]
    pub fn format_outcome(&self, outcome: &RunOutcome) -> String {
        match self.format {
            super::commands::OutputFormat::Json => {
                serde_json::to_string_pretty(outcome).unwrap_or_default()
            }
            super::commands::OutputFormat::Text => Self::format_outcome_text(outcome),
        }
    }

    /// Formats a run outcome as text.
    fn format_outcome_text(outcome: &RunOutcome) -> String {
        match outcome {
            RunOutcome::AllSucceeded { succeeded } => format!(
                "{} All {} units succeeded.",
                "✓".green(),
                succeeded.len()
            ),
            RunOutcome::PartialFailure {
                succeeded,
                failed,
                skipped,
            } => {
                let mut output = format!(
                    "{} Run finished with failures: {} succeeded, {} failed, {} skipped\n",
                    "✗".red(),
                    succeeded.len().to_string().green(),
                    failed.len().to_string().red(),
                    skipped.len().to_string().yellow()
                );
                for failure in failed {
                    let _ = writeln!(
                        output,
                        "  {} {} - {}",
                        "failed:".red(),
                        failure.unit,
                        failure.error
                    );
                }
                for skip in skipped {
                    let _ = writeln!(
                        output,
                        "  {} {} ({})",
                        "skipped:".yellow(),
                        skip.unit,
                        skip.cause
                    );
                }
                output
            }
            RunOutcome::Aborted { reason } => {
                format!("{} Run aborted: {reason}", "✗".red())
            }
        }
    }

    /// Formats recorded state for display.
    #[must_use]
    pub fn format_state(&self, state: &StateFile) -> String {
        match self.format {
            super::commands::OutputFormat::Json => {
                serde_json::to_string_pretty(state).unwrap_or_default()
            }
            super::commands::OutputFormat::Text => {
                if state.is_empty() {
                    return String::from("No resources recorded.");
                }

                let mut ids = state.record_ids();
                ids.sort_unstable();
                let rows: Vec<RecordRow> = ids
                    .iter()
                    .filter_map(|id| state.get(id))
                    .map(|record| RecordRow {
                        resource: record.id.clone(),
                        kind: record.kind.to_string(),
                        provider_id: record.provider_id.clone(),
                        updated: record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    })
                    .collect();

                format!(
                    "Project: {}/{}\n\n{}",
                    state.project,
                    state.environment,
                    Table::new(rows)
                )
            }
        }
    }

    /// Prints one streamed unit transition.
    pub fn print_event(&self, event: &UnitEvent) {
        let line = match event.state {
            UnitState::Running => format!("  {} {}", "~".cyan(), event.unit),
            UnitState::Succeeded => format!("  {} {}", "+".green(), event.unit),
            UnitState::Failed => format!(
                "  {} {} - {}",
                "!".red(),
                event.unit,
                event.detail.as_deref().unwrap_or("failed")
            ),
            UnitState::Skipped => format!(
                "  {} {} ({})",
                "-".yellow(),
                event.unit,
                event.detail.as_deref().unwrap_or("skipped")
            ),
            UnitState::Pending => return,
        };
        eprintln!("{line}");
    }

    /// Truncates a string for table display.
    fn truncate(s: &str, max: usize) -> String {
        if s.len() <= max {
            s.to_string()
        } else {
            format!("{}...", &s[..max])
        }
    }

    /// Colors a change kind for the plan table.
    fn paint_change(change: ChangeKind) -> String {
        match change {
            ChangeKind::Create => change.to_string().green().to_string(),
            ChangeKind::Update => change.to_string().yellow().to_string(),
            ChangeKind::Replace | ChangeKind::Destroy => change.to_string().red().to_string(),
            ChangeKind::NoChange => change.to_string(),
        }
    }
}
