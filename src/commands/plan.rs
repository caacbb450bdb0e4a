//! `stackform plan`

use anyhow::Result;
use declarative::PlanOptions;

use super::{Session, Status};
use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &PlanArgs) -> Result<Status> {
    let session = Session::with_template(ctx)?;
    let loaded = session.loaded()?;
    let definition = session.engine.build(&loaded.template, &loaded.inputs)?;

    let plan = session.engine.plan(
        &definition,
        &PlanOptions {
            refresh: args.refresh,
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        if let Some(drift) = plan.drift.as_ref().filter(|d| d.has_drift()) {
            ui::display_drift(drift);
        }
        ui::display_plan(&plan);
    }

    Ok(if plan.has_changes() {
        Status::Changes
    } else {
        Status::Clean
    })
}
