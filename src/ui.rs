use colored::{ColoredString, Colorize};
use declarative::{
    Action, ApplyReport, DriftReport, DriftStatus, OutcomeStatus, Plan, PlanEntry, PropertyChange,
    PropertyValue,
};
use serde_json::Value;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Plans
// ============================================================================

fn action_symbol(action: Action) -> ColoredString {
    let symbol = action.symbol();
    match action {
        Action::NoOp => symbol.dimmed(),
        Action::Create => symbol.green(),
        Action::Update => symbol.yellow(),
        Action::Replace => symbol.magenta(),
        Action::Delete { retained: false } => symbol.red(),
        Action::Delete { retained: true } => symbol.blue(),
    }
}

/// Print a plan, one line per changed resource in execution order
pub fn display_plan(plan: &Plan) {
    if !plan.has_changes() {
        println!();
        println!("  {} No changes. Stack '{}' is up to date", "✓".green(), plan.stack);
        return;
    }

    println!();
    println!(
        "┌─ {} {} ─────────────────────────────────────",
        "Plan for".bold(),
        plan.stack.bold()
    );
    println!("│");

    for entry in plan.changes() {
        display_entry(entry);
    }

    let summary = &plan.summary;
    println!("│");
    println!("├─────────────────────────────────────────────────────");
    println!(
        "│ Summary: {} to create, {} to update, {} to replace, {} to delete, {} to retain",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red(),
        summary.retain.to_string().blue()
    );
    println!("└─────────────────────────────────────────────────────");
}

fn display_entry(entry: &PlanEntry) {
    println!(
        "│ {} {:<28} {}",
        action_symbol(entry.action),
        entry.logical_id,
        format!("{} ({})", entry.resource_type, entry.action).dimmed()
    );
    if let Some(reason) = &entry.reason {
        println!("│     {}", reason.italic().dimmed());
    }
    for change in &entry.changes {
        let marker = if change.requires_replacement {
            " [forces replacement]".red().to_string()
        } else {
            String::new()
        };
        println!("│     {}{marker}", format_change(change));
    }
}

/// One property change as `Name: before → after`
pub fn format_change(change: &PropertyChange) -> String {
    let before = change
        .before
        .as_ref()
        .map_or_else(|| "(absent)".to_string(), format_value);
    let after = match &change.after {
        Some(PropertyValue::Known(value)) => format_value(value),
        Some(PropertyValue::Unknown) => "(known after apply)".to_string(),
        None => "(removed)".to_string(),
    };
    format!("{}: {before} → {after}", change.property)
}

const MAX_VALUE_WIDTH: usize = 60;

/// Compact single-line rendering of a property value
pub fn format_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    };
    if text.chars().count() <= MAX_VALUE_WIDTH {
        text
    } else {
        let head: String = text.chars().take(MAX_VALUE_WIDTH - 3).collect();
        format!("{head}...")
    }
}

// ============================================================================
// Apply reports
// ============================================================================

/// Print failures and skips, then the totals
pub fn display_report(report: &ApplyReport) {
    let problems: Vec<_> = report
        .outcomes
        .iter()
        .filter(|o| !o.status.is_success())
        .collect();

    if !problems.is_empty() {
        println!();
        for outcome in problems {
            match &outcome.status {
                OutcomeStatus::Failed { error } => println!(
                    "  {} {} ({}): {}",
                    "✗".red(),
                    outcome.logical_id,
                    outcome.action,
                    error
                ),
                OutcomeStatus::Skipped { reason } => println!(
                    "  {} {} ({}): {}",
                    "○".dimmed(),
                    outcome.logical_id,
                    outcome.action,
                    reason.dimmed()
                ),
                OutcomeStatus::Succeeded | OutcomeStatus::Unchanged => {}
            }
        }
    }

    let summary = &report.summary;
    println!();
    if report.cancelled {
        warn("Apply cancelled; finished work was saved");
    }
    let line = format!(
        "{} succeeded, {} failed, {} skipped, {} unchanged",
        summary.succeeded, summary.failed, summary.skipped, summary.unchanged
    );
    if summary.is_success() && !report.cancelled {
        success(&format!("Apply complete: {line}"));
    } else {
        error(&format!("Apply incomplete: {line}"));
    }
}

/// Print stack outputs as `Name = value`
pub fn display_outputs(outputs: &std::collections::BTreeMap<String, Value>) {
    if outputs.is_empty() {
        return;
    }
    header("Outputs");
    for (name, value) in outputs {
        println!("  {} = {}", name.bold(), format_value(value));
    }
}

// ============================================================================
// Drift
// ============================================================================

pub fn display_drift(report: &DriftReport) {
    if !report.has_drift() {
        println!();
        println!(
            "  {} {} resource(s) match their recorded state",
            "✓".green(),
            report.entries.len()
        );
        return;
    }

    println!();
    println!("┌─ {} ─────────────────────────────────────", "Drift".bold());
    println!("│");
    for entry in report.drifted() {
        match &entry.status {
            DriftStatus::Deleted => println!(
                "│ {} {:<28} {}",
                "-".red(),
                entry.logical_id,
                format!("{} {} (deleted outside stackform)", entry.resource_type, entry.physical_id)
                    .dimmed()
            ),
            DriftStatus::Modified { changes } => {
                println!(
                    "│ {} {:<28} {}",
                    "~".yellow(),
                    entry.logical_id,
                    format!("{} {}", entry.resource_type, entry.physical_id).dimmed()
                );
                for change in changes {
                    println!("│     {}", format_change(change));
                }
            }
            DriftStatus::InSync => {}
        }
    }
    println!("│");
    println!(
        "└─ {} of {} resource(s) drifted",
        report.drifted().count(),
        report.entries.len()
    );
}
