//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::NodeOutcome;
use crate::planner::{ActionType, Plan};
use crate::reconciler::ApplyReport;
use crate::state::{Database, ExportedState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan entry row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
    #[tabled(rename = "Changed fields")]
    fields: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct ApplyRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

/// State entry row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// Exported resource row for table display.
#[derive(Tabled)]
struct ExportRow {
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "ETag")]
    etag: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats a deployment plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_noop() {
            return format!("{} {plan}\n", "✓".green());
        }

        let mut output = String::new();
        let _ = write!(output, "\nDeployment Plan\n");
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            &plan.config_hash[..8.min(plan.config_hash.len())]
        );

        let rows: Vec<PlanRow> = plan
            .entries
            .iter()
            .filter(|(_, e)| e.action.has_changes())
            .map(|(key, e)| PlanRow {
                action: Self::format_action(e.action),
                resource: key.clone(),
                depends_on: Self::truncate(
                    &e.depends_on
                        .iter()
                        .map(|d| d.node.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    30,
                ),
                fields: Self::truncate(
                    &e.changes
                        .iter()
                        .map(|c| c.path.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    40,
                ),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for key in plan.changed_keys() {
                let Some(entry) = plan.get(key) else {
                    continue;
                };
                let _ = writeln!(output, "   {} {key}", Self::format_action(entry.action));
                for change in &entry.changes {
                    let origin = if change.remote { " (remote)" } else { "" };
                    let _ = writeln!(
                        output,
                        "      {}: {} -> {}  [{}]{origin}",
                        change.path,
                        Self::render(change.old.as_ref()),
                        Self::render(change.new.as_ref()),
                        change.action
                    );
                }
            }
        }

        let _ = write!(output, "\n{plan}\n");
        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let rows: Vec<ApplyRow> = report
                    .outcomes
                    .outcomes
                    .iter()
                    .filter(|(key, _)| {
                        report.actions.get(*key).is_some_and(|a| a.has_changes())
                    })
                    .map(|(key, outcome)| ApplyRow {
                        resource: key.clone(),
                        action: Self::format_action(
                            report.actions.get(key).copied().unwrap_or(ActionType::Unset),
                        ),
                        outcome: Self::format_outcome(outcome),
                    })
                    .collect();

                let mut output = String::new();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let status = if report.is_success() {
                    "✓".green()
                } else {
                    "✗".red()
                };
                let _ = write!(output, "\n{status} {report}\n");
                output
            }
        }
    }

    /// Formats the state snapshot.
    #[must_use]
    pub fn format_state(&self, db: &Database) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(db).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nState\n\n");
                let _ = writeln!(output, "   Lineage: {}", db.lineage);
                let _ = writeln!(output, "   Serial: {}", db.serial);
                let _ = writeln!(
                    output,
                    "   Version: {} (written by {})",
                    db.state_version, db.cli_version
                );
                let _ = writeln!(output, "   Resources: {}\n", db.state.len());

                if !db.state.is_empty() {
                    let rows: Vec<StateRow> = db
                        .state
                        .iter()
                        .map(|(key, entry)| StateRow {
                            resource: key.clone(),
                            id: Self::truncate(&entry.id, 24),
                            depends_on: entry
                                .depends_on
                                .iter()
                                .map(|d| d.node.as_str())
                                .collect::<Vec<_>>()
                                .join(", "),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats exported identifiers.
    #[must_use]
    pub fn format_export(&self, exported: &ExportedState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(exported).unwrap_or_default(),
            OutputFormat::Text => {
                let rows: Vec<ExportRow> = exported
                    .iter()
                    .flat_map(|(group, items)| {
                        items.iter().map(move |(name, r)| ExportRow {
                            group: group.clone(),
                            name: name.clone(),
                            id: r.id.clone(),
                            etag: r.etag.clone().unwrap_or_default(),
                        })
                    })
                    .collect();
                if rows.is_empty() {
                    return String::from("No resources in state.\n");
                }
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    format!(
                        "{} Configuration has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    )
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {error}");
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an action type with color.
    fn format_action(action: ActionType) -> String {
        match action {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::UpdateWithId => "~update_with_id".yellow().to_string(),
            ActionType::Resize => "~resize".cyan().to_string(),
            ActionType::Recreate => "-/+recreate".magenta().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::Noop | ActionType::Unset => action.as_str().dimmed().to_string(),
        }
    }

    fn format_outcome(outcome: &NodeOutcome) -> String {
        match outcome {
            NodeOutcome::Succeeded => outcome.to_string().green().to_string(),
            NodeOutcome::Failed => outcome.to_string().red().to_string(),
            NodeOutcome::DependencyFailed { .. } | NodeOutcome::Cancelled => {
                outcome.to_string().yellow().to_string()
            }
        }
    }

    fn render(value: Option<&Value>) -> String {
        value.map_or_else(
            || String::from("(absent)"),
            |v| Self::truncate(&v.to_string(), 40),
        )
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, marker: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }
}
