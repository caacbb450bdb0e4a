//! `stackform apply` and `stackform destroy`
//!
//! Ctrl-C stops new provider calls; calls already running finish and their
//! results are saved before the lock is released.

use anyhow::Result;
use declarative::{ApplyOptions, ApplyRun, CancelToken};

use super::{Session, Status};
use crate::Context;
use crate::cli::{ApplyArgs, DestroyArgs};
use crate::progress::{ApplyProgress, PromptConfirm};
use crate::ui;

pub fn apply(ctx: &Context, args: &ApplyArgs) -> Result<Status> {
    let session = Session::with_template(ctx)?;
    let loaded = session.loaded()?;
    let definition = session.engine.build(&loaded.template, &loaded.inputs)?;

    let options = ApplyOptions {
        jobs: args.jobs.unwrap_or_else(|| session.config.jobs()),
        refresh: args.refresh,
        cancel: cancel_on_interrupt(),
    };
    let mut confirm = PromptConfirm {
        auto_approve: args.auto_approve,
        show_plan: !ctx.quiet,
    };
    let mut progress = ApplyProgress::new(ctx.quiet);

    let run = session
        .engine
        .apply(&definition, &options, &mut confirm, &mut progress)?;
    Ok(finish(ctx, &run))
}

pub fn destroy(ctx: &Context, args: &DestroyArgs) -> Result<Status> {
    let session = Session::from_state(ctx)?;
    if !session.engine.exists()? {
        ui::info(&format!("Stack '{}' has no recorded state", session.stack()));
        return Ok(Status::Clean);
    }

    let options = ApplyOptions {
        jobs: args.jobs.unwrap_or_else(|| session.config.jobs()),
        refresh: false,
        cancel: cancel_on_interrupt(),
    };
    let mut confirm = PromptConfirm {
        auto_approve: args.auto_approve,
        show_plan: !ctx.quiet,
    };
    let mut progress = ApplyProgress::new(ctx.quiet);

    let run = session.engine.destroy(&options, &mut confirm, &mut progress)?;
    Ok(finish(ctx, &run))
}

fn finish(ctx: &Context, run: &ApplyRun) -> Status {
    match run {
        ApplyRun::NoChanges(plan) => {
            if !ctx.quiet {
                ui::display_plan(plan);
            }
            Status::Clean
        }
        ApplyRun::Declined(_) => {
            ui::warn("Apply declined; nothing was changed");
            Status::Clean
        }
        ApplyRun::Applied { report, .. } => {
            ui::display_report(report);
            if !ctx.quiet {
                ui::display_outputs(&report.outputs);
            }
            if report.summary.is_success() && !report.cancelled {
                Status::Clean
            } else {
                Status::Failed
            }
        }
    }
}

/// A token cancelled by the first Ctrl-C
fn cancel_on_interrupt() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if !handler_token.is_cancelled() {
            eprintln!("\nInterrupted: waiting for running provider calls to finish...");
        }
        handler_token.cancel();
    }) {
        log::warn!("Could not install Ctrl-C handler: {e}");
    }
    token
}
