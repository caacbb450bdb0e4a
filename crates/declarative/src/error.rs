//! Error taxonomy for template resolution, planning and applying
//!
//! - [`ValidationError`]: bad input, raised before anything is read or written
//! - [`ResolutionError`]: references, conditions or placeholders that cannot
//!   be resolved, raised before planning
//! - Lock errors: contention or loss of the stack lock
//! - [`ProviderError`]: one resource's provider call failed
//! - Consistency errors: a state write was rejected as stale
//!
//! Validation and resolution errors abort with no side effects. Provider
//! errors are isolated to the failing resource's subtree by the executor.
//! Lock and consistency errors end the run.

use std::fmt;
use thiserror::Error;

/// Input that fails validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A parameter value violates a declared constraint
    #[error("parameter '{parameter}' violates {constraint}: {message}")]
    Parameter {
        parameter: String,
        constraint: String,
        message: String,
    },

    /// A parameter without a default was not supplied
    #[error("parameter '{0}' has no default and no value was supplied")]
    MissingParameter(String),

    /// A value was supplied for a parameter the template does not declare
    #[error("parameter '{0}' is not declared by the template")]
    UnknownParameter(String),

    /// The template document is malformed
    #[error("invalid template: {0}")]
    Template(String),

    /// No provider handles a declared resource type
    #[error("no provider for resource type '{resource_type}' (resource '{logical_id}')")]
    UnknownResourceType {
        logical_id: String,
        resource_type: String,
    },
}

/// Expression or graph that cannot be resolved
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// A reference names an id that is not declared (or was excluded by its condition)
    #[error("'{from}' references '{target}', which is not a declared parameter or included resource")]
    UnresolvedReference { from: String, target: String },

    /// Conditions refer to each other in a loop
    #[error("cyclic condition: {}", .chain.join(" -> "))]
    CyclicCondition { chain: Vec<String> },

    /// A `${...}` placeholder names nothing in scope
    #[error("unknown placeholder '${{{placeholder}}}' in '{from}'")]
    UnknownPlaceholder { from: String, placeholder: String },

    /// Resources depend on each other in a loop
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A condition name is not declared
    #[error("'{from}' uses undeclared condition '{condition}'")]
    UnknownCondition { from: String, condition: String },

    /// An expression evaluated to the wrong kind of value
    #[error("{from}: {message}")]
    InvalidExpression { from: String, message: String },

    /// An attribute was still unknown when a concrete value was required
    #[error("'{from}' needs attribute '{attribute}' of '{resource}', which is not available")]
    UnavailableAttribute {
        from: String,
        resource: String,
        attribute: String,
    },
}

/// Kinds of provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The physical resource does not exist
    NotFound,
    /// The provider refused the request (bad properties, conflict)
    Rejected,
    /// The call failed for another reason
    Failed,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Rejected => write!(f, "rejected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A resource provider call failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Failed,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

/// Top-level error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Resolution,
    Lock,
    Provider,
    Consistency,
    Storage,
    /// The engine could not set up its own machinery
    Internal,
}

impl ErrorCategory {
    /// Whether the error could only have happened before any mutation
    pub fn is_side_effect_free(&self) -> bool {
        matches!(self, Self::Validation | Self::Resolution)
    }
}

/// Errors returned by the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Lock contention or loss
    #[error("lock error: {0}")]
    Lock(statestore::Error),

    /// A state write was rejected as stale
    #[error("consistency error: {0}")]
    Consistency(statestore::Error),

    /// State storage failed
    #[error("state store error: {0}")]
    Store(statestore::Error),

    /// A provider call made outside the executor (e.g. drift refresh) failed
    #[error("provider error for '{logical_id}': {source}")]
    Provider {
        logical_id: String,
        #[source]
        source: ProviderError,
    },

    /// The apply worker pool could not be started
    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<statestore::Error> for Error {
    fn from(err: statestore::Error) -> Self {
        match err.category() {
            statestore::ErrorCategory::Lock => Error::Lock(err),
            statestore::ErrorCategory::Consistency => Error::Consistency(err),
            statestore::ErrorCategory::Storage => Error::Store(err),
        }
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) => ErrorCategory::Validation,
            Error::Resolution(_) => ErrorCategory::Resolution,
            Error::Lock(_) => ErrorCategory::Lock,
            Error::Consistency(_) => ErrorCategory::Consistency,
            Error::Store(_) => ErrorCategory::Storage,
            Error::Provider { .. } => ErrorCategory::Provider,
            Error::WorkerPool(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the run no longer owns its lock epoch
    pub fn is_lock_loss(&self) -> bool {
        match self {
            Error::Lock(e) | Error::Consistency(e) => e.is_lock_loss(),
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
