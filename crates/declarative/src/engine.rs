//! Stack engine - lock, plan, confirm, apply
//!
//! [`Engine`] is the entry point callers use. Every operation that reads
//! state for planning runs under the stack lock, so a plan is always made
//! against the state it will be applied to.

use crate::context::{ApplyOptions, ConfirmCallback, ProgressCallback};
use crate::diff::{DriftReport, detect_drift};
use crate::error::{Result, ValidationError};
use crate::executor::{ExecutionContext, execute};
use crate::graph::{StackContext, StackDefinition};
use crate::parameters::ParameterInputs;
use crate::planner::{Plan, PlanOptions, plan};
use crate::resource::ProviderRegistry;
use crate::template::Template;
use crate::types::ApplyReport;
use statestore::retry::LogCallback;
use statestore::{
    LockGuard, LockInfo, LockManager, RetryConfig, StateBackend, StateSnapshot, StateStore,
    with_retry,
};
use std::sync::Arc;

/// Default time a lock stays valid without a refresh
pub const DEFAULT_LOCK_TTL_SECS: i64 = 300;

/// Settings for one stack
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub stack: String,
    pub region: String,
    /// Identity recorded in the lock
    pub holder: String,
    pub lock_ttl: chrono::Duration,
    /// Backoff while another holder owns the lock
    pub retry: RetryConfig,
}

impl EngineSettings {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            region: "local".to_string(),
            holder: default_holder(),
            lock_ttl: chrono::Duration::seconds(DEFAULT_LOCK_TTL_SECS),
            retry: RetryConfig::default(),
        }
    }
}

/// `user@host:pid` of the current process
pub fn default_holder() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}:{}", std::process::id())
}

/// How an apply ended
#[derive(Debug)]
pub enum ApplyRun {
    /// State already matches; nothing was confirmed or executed
    NoChanges(Plan),
    /// The confirm callback refused the plan
    Declined(Plan),
    Applied { plan: Plan, report: ApplyReport },
}

impl ApplyRun {
    pub fn plan(&self) -> &Plan {
        match self {
            Self::NoChanges(plan) | Self::Declined(plan) | Self::Applied { plan, .. } => plan,
        }
    }

    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            Self::Applied { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Plans and applies stacks against one state backend
pub struct Engine {
    store: StateStore,
    locks: LockManager,
    providers: ProviderRegistry,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        providers: ProviderRegistry,
        settings: EngineSettings,
    ) -> Self {
        let store = StateStore::new(backend, settings.stack.clone());
        let locks = store.lock_manager(settings.lock_ttl);
        Self {
            store,
            locks,
            providers,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Values behind the pseudo parameters
    pub fn context(&self) -> StackContext {
        StackContext {
            name: self.settings.stack.clone(),
            region: self.settings.region.clone(),
        }
    }

    /// Resolve a template against parameters without touching state
    ///
    /// Also checks that every included resource type has a provider.
    pub fn build(&self, template: &Template, inputs: &ParameterInputs) -> Result<StackDefinition> {
        let definition = StackDefinition::build(template, inputs, &self.context())?;
        for node in definition.graph.nodes() {
            if !self.providers.contains(&node.resource_type) {
                return Err(ValidationError::UnknownResourceType {
                    logical_id: node.logical_id.clone(),
                    resource_type: node.resource_type.clone(),
                }
                .into());
            }
        }
        log::debug!(
            "Built stack '{}' with {} resource(s)",
            definition.name,
            definition.graph.len()
        );
        Ok(definition)
    }

    /// Compute a plan under the stack lock
    pub fn plan(&self, definition: &StackDefinition, options: &PlanOptions) -> Result<Plan> {
        self.with_lock("plan", |_| {
            let snapshot = self.store.load_snapshot()?;
            plan(definition, &snapshot, &self.providers, options)
        })
    }

    /// Plan, confirm, and execute under one lock epoch
    pub fn apply<C, P>(
        &self,
        definition: &StackDefinition,
        options: &ApplyOptions,
        confirm: &mut C,
        progress: &mut P,
    ) -> Result<ApplyRun>
    where
        C: ConfirmCallback + ?Sized,
        P: ProgressCallback + ?Sized,
    {
        self.with_lock("apply", |guard| {
            let mut snapshot = self.store.load_snapshot()?;
            let plan = plan(
                definition,
                &snapshot,
                &self.providers,
                &PlanOptions {
                    refresh: options.refresh,
                },
            )?;

            if !plan.has_changes() {
                log::info!("Stack '{}' is up to date", plan.stack);
                return Ok(ApplyRun::NoChanges(plan));
            }
            if !confirm.confirm(&plan) {
                log::info!("Apply of '{}' declined", plan.stack);
                return Ok(ApplyRun::Declined(plan));
            }

            let ctx = ExecutionContext {
                definition,
                store: &self.store,
                locks: &self.locks,
                providers: &self.providers,
            };
            let report = execute(&plan, &ctx, &mut snapshot, guard, options, progress)?;
            Ok(ApplyRun::Applied { plan, report })
        })
    }

    /// Delete every resource recorded for the stack
    pub fn destroy<C, P>(
        &self,
        options: &ApplyOptions,
        confirm: &mut C,
        progress: &mut P,
    ) -> Result<ApplyRun>
    where
        C: ConfirmCallback + ?Sized,
        P: ProgressCallback + ?Sized,
    {
        let empty = StackDefinition::empty(&self.context());
        self.apply(&empty, options, confirm, progress)
    }

    /// Read every recorded resource back and report differences
    pub fn drift(&self) -> Result<DriftReport> {
        self.with_lock("drift", |_| {
            let snapshot = self.store.load_snapshot()?;
            detect_drift(&snapshot, &self.providers)
        })
    }

    /// Current recorded state, read without the lock
    pub fn snapshot(&self) -> Result<StateSnapshot> {
        Ok(self.store.load_snapshot()?)
    }

    /// Whether anything is recorded for the stack
    pub fn exists(&self) -> Result<bool> {
        Ok(self.store.exists()?)
    }

    /// Current lock holder, if any
    pub fn lock_holder(&self) -> Result<Option<LockInfo>> {
        Ok(self.locks.holder()?)
    }

    /// Clear a lock left behind by a crashed run
    pub fn force_unlock(&self, token: u64) -> Result<LockInfo> {
        Ok(self.locks.force_release(token)?)
    }

    /// Run `f` holding the stack lock
    ///
    /// The lock is released afterwards unless `f` reports that it was lost,
    /// in which case it belongs to someone else now. A failed release is
    /// returned when `f` succeeded, since the lock may stay held until it
    /// expires.
    fn with_lock<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut LockGuard) -> Result<T>,
    ) -> Result<T> {
        let mut guard = with_retry(&self.settings.retry, Some(&LogCallback), || {
            self.locks.acquire(&self.settings.holder, operation)
        })?;
        log::debug!(
            "Holding lock on '{}' for {operation} (token {})",
            self.settings.stack,
            guard.token()
        );

        let token = guard.token();
        let result = f(&mut guard);
        if let Err(e) = &result
            && e.is_lock_loss()
        {
            log::warn!("Lock on '{}' was lost during {operation}", self.settings.stack);
            return result;
        }

        match self.locks.release(guard) {
            Ok(()) => result,
            Err(e) => {
                log::error!(
                    "Failed to release lock on '{}' (token {token}): {e}",
                    self.settings.stack
                );
                result.and(Err(e.into()))
            }
        }
    }
}
