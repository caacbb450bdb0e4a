//! Apply options and caller-facing callbacks
//!
//! These traits let the engine report progress and ask for confirmation
//! without depending on a particular terminal UI.

use crate::planner::{Plan, PlanEntry};
use crate::types::{ApplyOutcome, ApplySummary};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default number of provider calls in flight
pub const DEFAULT_JOBS: usize = 4;

/// Progress callback for apply operations
///
/// Callbacks are made from the coordinating thread only, in the order
/// events are observed.
pub trait ProgressCallback: Send {
    /// Called once with the number of entries that will be attempted
    fn on_apply_start(&mut self, total: usize);

    /// Called when an entry is handed to a worker
    fn on_resource_start(&mut self, entry: &PlanEntry);

    /// Called when an entry reaches a final status
    fn on_resource_complete(&mut self, outcome: &ApplyOutcome);

    /// Called after the last entry is accounted for
    fn on_apply_complete(&mut self, summary: &ApplySummary);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Decide whether to apply a plan that has changes
    fn confirm(&mut self, plan: &Plan) -> bool;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_apply_start(&mut self, _total: usize) {}
    fn on_resource_start(&mut self, _entry: &PlanEntry) {}
    fn on_resource_complete(&mut self, _outcome: &ApplyOutcome) {}
    fn on_apply_complete(&mut self, _summary: &ApplySummary) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _plan: &Plan) -> bool {
        true
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _plan: &Plan) -> bool {
        false
    }
}

/// Cooperative cancellation flag shared with a signal handler
///
/// Cancelling stops new provider calls from being dispatched. Calls already
/// in flight run to completion and their results are still recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for applying a plan
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum provider calls in flight
    pub jobs: usize,
    /// Read resources back through their providers before planning
    pub refresh: bool,
    pub cancel: CancelToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            jobs: DEFAULT_JOBS,
            refresh: false,
            cancel: CancelToken::new(),
        }
    }
}
