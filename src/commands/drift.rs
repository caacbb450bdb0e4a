//! `stackform drift`

use anyhow::Result;

use super::{Session, Status};
use crate::Context;
use crate::cli::JsonArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &JsonArgs) -> Result<Status> {
    let session = Session::from_state(ctx)?;
    let report = session.engine.drift()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        ui::display_drift(&report);
    }

    Ok(if report.has_drift() {
        Status::Changes
    } else {
        Status::Clean
    })
}
