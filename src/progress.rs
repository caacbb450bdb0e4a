//! Terminal progress and confirmation for apply
//!
//! Implements the engine callbacks with an indicatif bar and a dialoguer
//! prompt.

use colored::Colorize;
use declarative::{
    ApplyOutcome, ApplySummary, ConfirmCallback, OutcomeStatus, Plan, PlanEntry, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};

use crate::ui;

const BAR_TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Progress bar over the entries of one apply
pub struct ApplyProgress {
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl ApplyProgress {
    pub fn new(quiet: bool) -> Self {
        Self { bar: None, quiet }
    }

    fn print(&self, line: String) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_apply_start(&mut self, total: usize) {
        let bar = if self.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total as u64)
        };
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        self.bar = Some(bar);
    }

    fn on_resource_start(&mut self, entry: &PlanEntry) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{} {}", entry.action, entry.logical_id));
        }
    }

    fn on_resource_complete(&mut self, outcome: &ApplyOutcome) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        if self.quiet {
            return;
        }
        let line = match &outcome.status {
            OutcomeStatus::Succeeded => {
                format!("  {} {} ({})", "✓".green(), outcome.logical_id, outcome.action)
            }
            OutcomeStatus::Failed { .. } => {
                format!("  {} {} ({})", "✗".red(), outcome.logical_id, outcome.action)
            }
            OutcomeStatus::Skipped { .. } => format!(
                "  {} {} ({})",
                "○".dimmed(),
                outcome.logical_id.dimmed(),
                outcome.action
            ),
            OutcomeStatus::Unchanged => return,
        };
        self.print(line);
    }

    fn on_apply_complete(&mut self, _summary: &ApplySummary) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Shows the plan and asks before applying it
pub struct PromptConfirm {
    /// Skip the prompt (`--auto-approve`)
    pub auto_approve: bool,
    /// Print the plan before asking
    pub show_plan: bool,
}

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, plan: &Plan) -> bool {
        if self.show_plan {
            ui::display_plan(plan);
        }
        if self.auto_approve {
            return true;
        }

        println!();
        let prompt = format!(
            "Apply {} change(s) to stack '{}'?",
            plan.summary.total_changes(),
            plan.stack
        );
        match dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
        {
            Ok(confirmed) => confirmed,
            Err(e) => {
                log::warn!("Could not read confirmation ({e}); use --auto-approve");
                false
            }
        }
    }
}
