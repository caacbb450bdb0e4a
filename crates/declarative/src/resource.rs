//! Resource provider trait and registry
//!
//! A provider manages the physical resources of one resource type. The
//! engine never talks to infrastructure directly: every create, update,
//! delete and read-back goes through the provider registered for the
//! resource's type.

use crate::diff::PropertyChange;
use crate::error::ProviderError;
use crate::types::Properties;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifiers assigned by a provider on create
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatedResource {
    pub physical_id: String,
    /// Computed attributes exposed to other resources (e.g. `Arn`)
    pub attributes: Properties,
}

/// How a provider applies a change to one property
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// The property can be changed on the existing resource
    #[default]
    InPlace,
    /// Changing the property requires deleting and recreating the resource
    Replace,
}

/// Manages physical resources of one type
///
/// Providers are called from worker threads, one call per resource at a
/// time, so implementations must be `Send + Sync`.
///
/// # Example
///
/// ```ignore
/// use declarative::{CreatedResource, ProviderError, Properties, PropertyChange, ResourceProvider};
///
/// struct Noop;
///
/// impl ResourceProvider for Noop {
///     fn resource_type(&self) -> &str {
///         "Test::Noop"
///     }
///
///     fn describe(&self, physical_id: &str) -> Result<Properties, ProviderError> {
///         Err(ProviderError::not_found(physical_id))
///     }
///
///     fn create(&self, logical_id: &str, _: &Properties) -> Result<CreatedResource, ProviderError> {
///         Ok(CreatedResource { physical_id: logical_id.to_lowercase(), ..Default::default() })
///     }
///
///     fn update(&self, _: &str, _: &[PropertyChange], _: &Properties) -> Result<Properties, ProviderError> {
///         Ok(Properties::new())
///     }
///
///     fn delete(&self, _: &str) -> Result<(), ProviderError> {
///         Ok(())
///     }
/// }
/// ```
pub trait ResourceProvider: Send + Sync {
    /// Resource type this provider handles (e.g. "Storage::Bucket")
    fn resource_type(&self) -> &str;

    /// Read back the actual properties of a physical resource
    ///
    /// Returns a `NotFound` error if the resource no longer exists.
    fn describe(&self, physical_id: &str) -> Result<Properties, ProviderError>;

    /// Create a resource
    fn create(
        &self,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<CreatedResource, ProviderError>;

    /// Apply in-place changes, returning refreshed attributes
    ///
    /// `desired` is the full property set after the change.
    fn update(
        &self,
        physical_id: &str,
        changes: &[PropertyChange],
        desired: &Properties,
    ) -> Result<Properties, ProviderError>;

    /// Delete a resource
    fn delete(&self, physical_id: &str) -> Result<(), ProviderError>;

    /// Whether a change to `property` can be applied in place
    fn update_policy(&self, property: &str) -> UpdatePolicy {
        let _ = property;
        UpdatePolicy::InPlace
    }
}

/// Providers keyed by resource type
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its resource type, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        let resource_type = provider.resource_type().to_string();
        if self.providers.insert(resource_type.clone(), provider).is_some() {
            log::debug!("Replaced provider for {resource_type}");
        }
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(resource_type).cloned()
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }

    /// Registered resource types, sorted
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
