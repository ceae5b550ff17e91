//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::io::Write as _;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::declaration::{render, Declarations};
use crate::planner::{ActionStatus, ChangeKind, ExecutionResult, Plan, PlannedValue};
use crate::state::{OutputValue, StateRecord};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Resource change row for the review gate.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Recorded resource row.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

/// Step result row.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Result")]
    status: String,
}

const MASK: &str = "(sensitive)";

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

    /// Formats a plan for the review gate.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the declarations.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nStackform plan");
        if !plan.declaration_hash.is_empty() {
            let _ = writeln!(
                output,
                "   Declarations: {}\n",
                &plan.declaration_hash[..12.min(plan.declaration_hash.len())]
            );
        }

        let rows: Vec<ChangeRow> = plan
            .pending_changes()
            .map(|c| ChangeRow {
                change: Self::format_change_kind(c.change, c.create_before_destroy),
                resource: c.address.clone(),
                reason: Self::truncate(&c.reason, 50),
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        for change in plan.pending_changes() {
            if change.attributes.is_empty() {
                continue;
            }
            let _ = writeln!(output, "\n  {}", change.address.bold());
            for attr in &change.attributes {
                let old = attr.old.as_ref().map_or_else(|| String::from("-"), render_json);
                let new = match &attr.new {
                    PlannedValue::Known(v) => render_json(v),
                    PlannedValue::Unknown => "(known after apply)".dimmed().to_string(),
                    PlannedValue::Removed => "(removed)".red().to_string(),
                };
                let marker = if attr.forces_replacement {
                    " # forces replacement".red().to_string()
                } else {
                    String::new()
                };
                let _ = writeln!(output, "      {}: {old} -> {new}{marker}", attr.name);
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy ({} steps in {} stages).\n",
            plan.count(ChangeKind::Create).to_string().green(),
            plan.count(ChangeKind::Update).to_string().yellow(),
            plan.count(ChangeKind::Replace).to_string().magenta(),
            plan.count(ChangeKind::Destroy).to_string().red(),
            plan.action_count(),
            plan.stages.len()
        );
        output
    }

    /// Formats a validation summary.
    #[must_use]
    pub fn format_validation(&self, declarations: &Declarations, result: &ValidationResult) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "resources": declarations.addresses(),
                    "variables": declarations.variables.keys().collect::<Vec<_>>(),
                    "outputs": declarations.outputs.iter().map(|o| &o.name).collect::<Vec<_>>(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Declarations are valid.", "✓".green());
                } else {
                    let _ = writeln!(output, "{} {} errors:", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                for warning in &result.warnings {
                    let _ = writeln!(output, "{} {warning}", "⚠".yellow());
                }
                let _ = writeln!(output, "\n   Resources: {}", declarations.resources.len());
                let _ = writeln!(output, "   Variables: {}", declarations.variables.len());
                let _ = writeln!(output, "   Outputs:   {}", declarations.outputs.len());
                output
            }
        }
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_execution(&self, result: &ExecutionResult) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "success": result.is_success(),
                    "cancelled": result.cancelled,
                    "succeeded": result.succeeded,
                    "failed": result.failed,
                    "not_attempted": result.not_attempted,
                    "error": result.failure.as_ref().map(ToString::to_string),
                    "steps": result.results.iter().map(|r| serde_json::json!({
                        "index": r.index,
                        "step": r.description,
                        "status": r.status.to_string(),
                        "error": r.error,
                    })).collect::<Vec<_>>(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_success() {
                    let _ = writeln!(
                        output,
                        "{} Apply complete: {} steps succeeded.",
                        "✓".green(),
                        result.succeeded
                    );
                    return output;
                }

                let rows: Vec<StepRow> = result
                    .results
                    .iter()
                    .map(|r| StepRow {
                        index: r.index,
                        step: r.description.clone(),
                        status: Self::format_status(r.status),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                if let Some(failure) = &result.failure {
                    let _ = writeln!(output, "\n{} {failure}", "✗".red());
                }
                let _ = writeln!(
                    output,
                    "   {} succeeded, {} failed, {} not attempted. Run plan again to resume.",
                    result.succeeded, result.failed, result.not_attempted
                );
                output
            }
        }
    }

    /// Formats the State Record.
    #[must_use]
    pub fn format_state(&self, state: &StateRecord) -> String {
        match self.format {
            OutputFormat::Json => {
                let mut redacted = state.clone();
                for output in redacted.outputs.values_mut().filter(|o| o.sensitive) {
                    output.value = Value::String(MASK.to_string());
                }
                serde_json::to_string_pretty(&redacted).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {}/{}\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(
                    output,
                    "   Declarations: {}",
                    &state.declaration_hash[..12.min(state.declaration_hash.len())]
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());
                let _ = writeln!(output, "   Outputs: {}", state.outputs.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats the list of recorded resources.
    #[must_use]
    pub fn format_resource_list(&self, state: &StateRecord) -> String {
        match self.format {
            OutputFormat::Json => {
                let json: Vec<_> = state
                    .resources
                    .values()
                    .map(|r| {
                        serde_json::json!({
                            "address": r.address,
                            "id": r.id,
                            "dependencies": r.dependencies,
                            "deposed": r.deposed,
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                if state.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<ResourceRow> = state
                    .resources
                    .values()
                    .map(|r| ResourceRow {
                        address: r.address.clone(),
                        id: r.id.clone(),
                        dependencies: r
                            .dependencies
                            .iter()
                            .map(String::as_str)
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats every output, masking sensitive values.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, OutputValue>) -> String {
        match self.format {
            OutputFormat::Json => {
                let json: serde_json::Map<String, Value> = outputs
                    .iter()
                    .map(|(name, o)| {
                        let value = if o.sensitive {
                            Value::String(MASK.to_string())
                        } else {
                            o.value.clone()
                        };
                        (name.clone(), value)
                    })
                    .collect();
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                if outputs.is_empty() {
                    return String::from("No outputs recorded.\n");
                }
                let mut output = String::new();
                for (name, value) in outputs {
                    let shown = if value.sensitive {
                        MASK.dimmed().to_string()
                    } else {
                        render_json(&value.value)
                    };
                    let _ = writeln!(output, "{name} = {shown}");
                }
                output
            }
        }
    }

    /// Formats a single output; sensitive values are shown when asked for by name.
    #[must_use]
    pub fn format_output_value(&self, value: &OutputValue, raw: bool) -> String {
        match (&value.value, raw, self.format) {
            (Value::String(s), true, _) => s.clone(),
            (v, _, OutputFormat::Json) => serde_json::to_string_pretty(v).unwrap_or_default(),
            (v, _, OutputFormat::Text) => render_json(v),
        }
    }

    fn format_change_kind(kind: ChangeKind, create_before_destroy: bool) -> String {
        match kind {
            ChangeKind::Create => "+ create".green().to_string(),
            ChangeKind::Update => "~ update".yellow().to_string(),
            ChangeKind::Replace if create_before_destroy => "+/- replace".magenta().to_string(),
            ChangeKind::Replace => "-/+ replace".magenta().to_string(),
            ChangeKind::Destroy => "- destroy".red().to_string(),
            ChangeKind::NoOp => "no-op".dimmed().to_string(),
        }
    }

    fn format_status(status: ActionStatus) -> String {
        match status {
            ActionStatus::Succeeded => "succeeded".green().to_string(),
            ActionStatus::Failed => "failed".red().to_string(),
            ActionStatus::NotAttempted => "not attempted".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }

    /// Writes command results to stdout.
    pub fn emit(&self, content: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(content.as_bytes());
        if !content.ends_with('\n') {
            let _ = stdout.write_all(b"\n");
        }
    }

    /// Reports a success message on stderr.
    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Text {
            eprintln!("{} {message}", "✓".green());
        }
    }

    /// Reports a warning on stderr.
    pub fn warning(&self, message: &str) {
        eprintln!("{} {message}", "⚠".yellow());
    }
}

/// Renders a value for display: strings quoted, everything else as JSON.
fn render_json(value: &Value) -> String {
    match value {
        Value::String(_) => value.to_string(),
        other => render(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> BTreeMap<String, OutputValue> {
        BTreeMap::from([
            (
                String::from("cdn_domain"),
                OutputValue {
                    value: json!("d-1.cdn.test"),
                    sensitive: false,
                    description: None,
                },
            ),
            (
                String::from("admin_token"),
                OutputValue {
                    value: json!("s3cret"),
                    sensitive: true,
                    description: None,
                },
            ),
        ])
    }

    #[test]
    fn test_sensitive_outputs_are_masked_in_listings() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_outputs(&outputs());
        assert!(text.contains("cdn_domain = \"d-1.cdn.test\""));
        assert!(text.contains("admin_token = (sensitive)"));
        assert!(!text.contains("s3cret"));

        let json = OutputFormatter::new(OutputFormat::Json).format_outputs(&outputs());
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn test_single_output_is_unmasked() {
        let all = outputs();
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert_eq!(formatter.format_output_value(&all["admin_token"], true), "s3cret");
        assert_eq!(formatter.format_output_value(&all["cdn_domain"], false), "\"d-1.cdn.test\"");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a longer reason", 8), "a lon...");
    }
}
