//! # Declarative
//!
//! Declarative resource graphs: resolve a template against parameters,
//! plan the difference from recorded state, and converge through
//! providers.
//!
//! ## Core Concepts
//!
//! - **Template**: resources, parameters, conditions and outputs, written in
//!   JSON, YAML or TOML
//! - **StackDefinition**: a template resolved against parameters, with its
//!   resource graph in dependency order
//! - **Plan**: the create/update/replace/delete change-set against state
//! - **Engine**: runs plan and apply under the stack lock, dispatching
//!   provider calls to a bounded worker pool
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     ApplyOptions, AutoConfirm, Engine, EngineSettings, NoProgress, ParameterInputs,
//!     ProviderRegistry, Template, TemplateFormat,
//! };
//! use statestore::MemoryBackend;
//! use std::sync::Arc;
//!
//! let template = Template::parse(
//!     r#"{"Resources": {"Logs": {"Type": "Storage::Bucket"}}}"#,
//!     TemplateFormat::Json,
//! )?;
//!
//! let providers = ProviderRegistry::new().with(Arc::new(MyBucketProvider));
//! let engine = Engine::new(Arc::new(MemoryBackend::new()), providers, EngineSettings::new("demo"));
//!
//! let definition = engine.build(&template, &ParameterInputs::new())?;
//! let run = engine.apply(&definition, &ApplyOptions::default(), &mut AutoConfirm, &mut NoProgress)?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`ResourceProvider`]: creates, updates, deletes and reads back one
//!   resource type
//! - [`ProgressCallback`]: receives progress updates during apply
//! - [`ConfirmCallback`]: approves or declines a plan before it runs

pub mod context;
pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod parameters;
pub mod planner;
pub mod resource;
pub mod template;
pub mod types;

// Re-export main types at crate root
pub use context::{
    ApplyOptions, AutoConfirm, AutoDecline, CancelToken, ConfirmCallback, NoProgress,
    ProgressCallback,
};
pub use diff::{DriftEntry, DriftReport, DriftStatus, PropertyChange, detect_drift};
pub use engine::{ApplyRun, Engine, EngineSettings};
pub use error::{
    Error, ErrorCategory, ProviderError, ProviderErrorKind, ResolutionError, Result,
    ValidationError,
};
pub use expr::{AttributeSource, Expr, Lookup};
pub use graph::{ResourceGraph, StackContext, StackDefinition};
pub use parameters::{ParameterInputs, resolve_parameters};
pub use planner::{Action, Plan, PlanEntry, PlanOptions, PlanSummary};
pub use resource::{CreatedResource, ProviderRegistry, ResourceProvider, UpdatePolicy};
pub use template::{Template, TemplateFormat};
pub use types::{
    ApplyOutcome, ApplyReport, ApplySummary, OutcomeStatus, Properties, PropertyValue,
};
