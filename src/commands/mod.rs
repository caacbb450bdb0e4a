//! Command implementations and the setup they share
//!
//! Every command loads the config, works out the stack name, opens the
//! state backend and registers providers before doing its own work.

pub mod apply;
pub mod drift;
pub mod plan;
pub mod state;
pub mod validate;

use anyhow::{Context as _, Result, bail};
use declarative::{Engine, EngineSettings, ParameterInputs, Template, TemplateFormat};
use serde_json::Value;
use statestore::{MemoryBackend, SqliteBackend, StateBackend, StateSnapshot, StateStore};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::Context;
use crate::config::{BackendKind, Config, validate_stack_name};
use crate::providers;

/// How a command finished, mapped to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Exit 0
    Clean,
    /// Exit 2: the plan has changes, or resources drifted
    Changes,
    /// Exit 1
    Failed,
}

impl Status {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Status::Clean => ExitCode::SUCCESS,
            Status::Changes => ExitCode::from(2),
            Status::Failed => ExitCode::FAILURE,
        }
    }
}

/// A template loaded from disk with its parameters
pub struct Loaded {
    pub path: PathBuf,
    pub template: Template,
    pub inputs: ParameterInputs,
}

/// Everything a command needs to talk to one stack
pub struct Session {
    pub config: Config,
    pub engine: Engine,
    pub loaded: Option<Loaded>,
}

impl Session {
    /// Set up a stack that needs a template (plan, apply)
    pub fn with_template(ctx: &Context) -> Result<Self> {
        Self::open(ctx, true)
    }

    /// Set up a stack from its recorded state alone (destroy, drift, state)
    pub fn from_state(ctx: &Context) -> Result<Self> {
        Self::open(ctx, false)
    }

    fn open(ctx: &Context, needs_template: bool) -> Result<Self> {
        let (config, config_path) = Config::load(ctx.config.as_deref())?;
        if let Some(path) = &config_path {
            log::info!("Loaded config from {}", path.display());
        }

        let loaded = match template_path(ctx, &config) {
            Some(path) if needs_template => Some(load(ctx, path)?),
            Some(_) => None,
            None if needs_template => bail!(
                "No template given. Use --template or set `template` in {}",
                crate::paths::CONFIG_FILE
            ),
            None => None,
        };

        let stack = stack_name(ctx, &config, template_path(ctx, &config).as_deref())?;
        let backend = open_backend(&config)?;
        let snapshot = StateStore::new(Arc::clone(&backend), stack.clone())
            .load_snapshot()
            .with_context(|| format!("Could not read state of stack '{stack}'"))?;

        let seen = seen_types(loaded.as_ref().map(|l| &l.template), &snapshot);
        let registry = providers::registry(&config, &stack, &seen)?;
        let engine = Engine::new(backend, registry, settings(&config, stack));

        Ok(Self {
            config,
            engine,
            loaded,
        })
    }

    /// The loaded template; only present for sessions opened with one
    pub fn loaded(&self) -> Result<&Loaded> {
        self.loaded.as_ref().context("This command needs a template")
    }

    pub fn stack(&self) -> &str {
        &self.engine.settings().stack
    }
}

fn settings(config: &Config, stack: String) -> EngineSettings {
    let mut settings = EngineSettings::new(stack);
    settings.region = config.region().to_string();
    if let Some(holder) = &config.lock.holder {
        settings.holder = holder.clone();
    }
    settings.lock_ttl = config.lock_ttl();
    settings.retry = config.lock.retry.to_retry_config();
    settings
}

fn template_path(ctx: &Context, config: &Config) -> Option<PathBuf> {
    ctx.template
        .clone()
        .or_else(|| config.template.as_deref().map(crate::paths::expand))
}

/// `--stack`, then the config, then the template file name
fn stack_name(ctx: &Context, config: &Config, template: Option<&Path>) -> Result<String> {
    let name = ctx
        .stack
        .clone()
        .or_else(|| config.stack.clone())
        .or_else(|| {
            template
                .and_then(Path::file_stem)
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .context("No stack name. Use --stack or set `stack` in the config")?;
    validate_stack_name(&name)?;
    Ok(name)
}

fn open_backend(config: &Config) -> Result<Arc<dyn StateBackend>> {
    match config.state.backend {
        BackendKind::Sqlite => {
            let path = config.state_path()?;
            let backend = SqliteBackend::open(&path)
                .with_context(|| format!("Could not open state database {}", path.display()))?;
            Ok(Arc::new(backend))
        }
        BackendKind::Memory => {
            log::warn!("Using the memory state backend; nothing will be saved");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

/// Resource types used by the template or recorded in state
fn seen_types(template: Option<&Template>, snapshot: &StateSnapshot) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = snapshot
        .records()
        .map(|record| record.resource_type.clone())
        .collect();
    if let Some(template) = template {
        seen.extend(
            template
                .resources
                .values()
                .map(|resource| resource.resource_type.clone()),
        );
    }
    seen
}

/// Read a template and its parameter values
pub fn load(ctx: &Context, path: PathBuf) -> Result<Loaded> {
    let template = load_template(&path)?;
    let inputs = load_inputs(ctx)?;
    Ok(Loaded {
        path,
        template,
        inputs,
    })
}

pub fn load_template(path: &Path) -> Result<Template> {
    let format = TemplateFormat::from_path(path).with_context(|| {
        format!(
            "Unknown template format for {} (expected .json, .yaml, .yml or .toml)",
            path.display()
        )
    })?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read template {}", path.display()))?;
    Template::parse(&content, format)
        .with_context(|| format!("Invalid template {}", path.display()))
}

/// Values from `--params-file`, overridden by `--param`
fn load_inputs(ctx: &Context) -> Result<ParameterInputs> {
    let mut inputs = match &ctx.params_file {
        Some(path) => read_params_file(path)?,
        None => ParameterInputs::new(),
    };
    for (key, value) in &ctx.params {
        inputs.insert(key.clone(), Value::String(value.clone()));
    }
    Ok(inputs)
}

fn read_params_file(path: &Path) -> Result<ParameterInputs> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read parameters file {}", path.display()))?;
    parse_params(&content, path)
        .with_context(|| format!("Invalid parameters file {}", path.display()))
}

fn parse_params(content: &str, path: &Path) -> Result<ParameterInputs> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let value: Value = if is_toml {
        let table: toml::Table = toml::from_str(content)?;
        serde_json::to_value(table)?
    } else {
        serde_json::from_str(content)?
    };
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => bail!("expected a table of parameter values"),
    }
}
