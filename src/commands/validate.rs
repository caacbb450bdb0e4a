//! `stackform validate`
//!
//! Resolves the template against its parameters without opening state.

use anyhow::{Result, bail};
use declarative::{Engine, EngineSettings, StackDefinition};
use statestore::{MemoryBackend, StateSnapshot};
use std::sync::Arc;

use super::{Status, load, seen_types, stack_name, template_path};
use crate::Context;
use crate::config::Config;
use crate::providers;
use crate::ui;

pub fn run(ctx: &Context) -> Result<Status> {
    let (config, _) = Config::load(ctx.config.as_deref())?;
    let Some(path) = template_path(ctx, &config) else {
        bail!("No template given. Use --template or set `template` in the config");
    };
    let stack = stack_name(ctx, &config, Some(&path))?;
    let loaded = load(ctx, path)?;

    let seen = seen_types(Some(&loaded.template), &StateSnapshot::new());
    let registry = providers::registry(&config, &stack, &seen)?;
    let mut settings = EngineSettings::new(stack);
    settings.region = config.region().to_string();
    let engine = Engine::new(Arc::new(MemoryBackend::new()), registry, settings);

    let definition = engine.build(&loaded.template, &loaded.inputs)?;
    report(&loaded.path.display().to_string(), &definition, ctx.quiet);
    Ok(Status::Clean)
}

fn report(path: &str, definition: &StackDefinition, quiet: bool) {
    ui::success(&format!("{path} is valid"));
    if quiet {
        return;
    }
    ui::kv("Stack", &definition.name);
    ui::kv("Parameters", &definition.parameters.len().to_string());
    ui::kv(
        "Resources",
        &format!(
            "{} included ({} condition(s))",
            definition.graph.len(),
            definition.conditions.len()
        ),
    );
    for node in definition.graph.nodes() {
        ui::dim(&format!("{} ({})", node.logical_id, node.resource_type));
    }
}
