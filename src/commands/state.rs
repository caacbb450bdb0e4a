//! Read-only state inspection, plus `force-unlock`

use anyhow::{Result, bail};
use colored::Colorize;

use super::{Session, Status};
use crate::Context;
use crate::cli::{JsonArgs, StateCommand};
use crate::ui;

pub fn run(ctx: &Context, cmd: &StateCommand) -> Result<Status> {
    let session = Session::from_state(ctx)?;
    match cmd {
        StateCommand::List => list(&session),
        StateCommand::Show { logical_id } => show(&session, logical_id),
        StateCommand::Lock => lock(&session),
    }
}

fn list(session: &Session) -> Result<Status> {
    let snapshot = session.engine.snapshot()?;
    if snapshot.is_empty() {
        ui::info(&format!("Stack '{}' has no recorded resources", session.stack()));
        return Ok(Status::Clean);
    }

    ui::header(&format!("Stack {}", session.stack()));
    if let Some(meta) = snapshot.meta() {
        ui::kv("Serial", &meta.serial.to_string());
        ui::kv(
            "Last applied",
            &meta.last_applied_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        );
    }
    println!();
    for record in snapshot.records() {
        println!(
            "  {:<28} {:<24} {}",
            record.logical_id.bold(),
            record.resource_type,
            record.physical_id.dimmed()
        );
    }
    Ok(Status::Clean)
}

fn show(session: &Session, logical_id: &str) -> Result<Status> {
    let snapshot = session.engine.snapshot()?;
    let Some(record) = snapshot.get(logical_id) else {
        bail!(
            "No resource '{logical_id}' recorded in stack '{}'",
            session.stack()
        );
    };
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(Status::Clean)
}

fn lock(session: &Session) -> Result<Status> {
    match session.engine.lock_holder()? {
        Some(info) => {
            ui::warn(&format!("Stack '{}' is locked", session.stack()));
            ui::kv("Holder", &info.holder);
            ui::kv("Operation", &info.operation);
            ui::kv("Token", &info.token.to_string());
            ui::kv("Acquired", &info.acquired_at.to_rfc3339());
            ui::kv("Expires", &info.expires_at.to_rfc3339());
        }
        None => ui::info(&format!("Stack '{}' is not locked", session.stack())),
    }
    Ok(Status::Clean)
}

/// `stackform outputs`
pub fn outputs(ctx: &Context, args: &JsonArgs) -> Result<Status> {
    let session = Session::from_state(ctx)?;
    let snapshot = session.engine.snapshot()?;
    let outputs = snapshot
        .meta()
        .map(|meta| meta.outputs.clone())
        .unwrap_or_default();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    } else if outputs.is_empty() {
        ui::info(&format!("Stack '{}' has no outputs", session.stack()));
    } else {
        ui::display_outputs(&outputs);
    }
    Ok(Status::Clean)
}

/// `stackform force-unlock <token>`
pub fn force_unlock(ctx: &Context, token: u64) -> Result<Status> {
    let session = Session::from_state(ctx)?;
    let info = session.engine.force_unlock(token)?;
    ui::success(&format!(
        "Released lock {} held by {} ({})",
        info.token, info.holder, info.operation
    ));
    Ok(Status::Clean)
}
