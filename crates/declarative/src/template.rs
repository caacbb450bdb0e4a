//! Template document model
//!
//! A template declares parameters, conditions, resources and outputs.
//! Property values and condition bodies are kept as raw JSON values here and
//! parsed into expressions by the graph builder.

use crate::error::ValidationError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use statestore::DeletionPolicy;
use std::collections::BTreeMap;
use std::path::Path;

/// Name of the stack, from engine configuration
pub const STACK_NAME: &str = "Stack::Name";
/// Region, from engine configuration
pub const STACK_REGION: &str = "Stack::Region";
/// Omit the enclosing property or list element
pub const NO_VALUE: &str = "Stack::NoValue";

/// On-disk template formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Json,
    Yaml,
    Toml,
}

impl TemplateFormat {
    /// Pick a format from a file extension (`.json`, `.yaml`/`.yml`, `.toml`)
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Declared type of a parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    #[default]
    String,
    Number,
    /// A string restricted to `AllowedValues`
    Enum,
}

/// A declared parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ParameterSpec {
    #[serde(rename = "Type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_pattern: Option<String>,
}

/// A declared resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ResourceSpec {
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Explicit ordering edges, as a single id or a list
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub depends_on: Vec<String>,
    /// Include the resource only when this condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

/// A declared output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct OutputSpec {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A template document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Template {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub conditions: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

impl Template {
    /// Parse a template and check its shape
    pub fn parse(content: &str, format: TemplateFormat) -> Result<Self, ValidationError> {
        let template: Self = match format {
            TemplateFormat::Json => {
                serde_json::from_str(content).map_err(|e| ValidationError::Template(e.to_string()))?
            }
            TemplateFormat::Yaml => {
                serde_yaml::from_str(content).map_err(|e| ValidationError::Template(e.to_string()))?
            }
            TemplateFormat::Toml => {
                toml::from_str(content).map_err(|e| ValidationError::Template(e.to_string()))?
            }
        };
        template.check()?;
        Ok(template)
    }

    /// Structural checks that do not need parameter values
    pub fn check(&self) -> Result<(), ValidationError> {
        for name in self.parameters.keys() {
            check_name("parameter", name)?;
        }
        for name in self.conditions.keys() {
            check_name("condition", name)?;
        }
        for name in self.outputs.keys() {
            check_name("output", name)?;
        }

        for (id, resource) in &self.resources {
            check_name("resource", id)?;
            if self.parameters.contains_key(id) {
                return Err(ValidationError::Template(format!(
                    "'{id}' is declared both as a parameter and as a resource"
                )));
            }
            if resource.resource_type.trim().is_empty() {
                return Err(ValidationError::Template(format!(
                    "resource '{id}' has an empty Type"
                )));
            }
        }

        for (name, spec) in &self.parameters {
            if spec.param_type == ParameterType::Enum && spec.allowed_values.is_empty() {
                return Err(ValidationError::Template(format!(
                    "Enum parameter '{name}' must declare AllowedValues"
                )));
            }
            if let (Some(min), Some(max)) = (spec.min_value, spec.max_value)
                && min > max
            {
                return Err(ValidationError::Template(format!(
                    "parameter '{name}' has MinValue {min} above MaxValue {max}"
                )));
            }
            if let (Some(min), Some(max)) = (spec.min_length, spec.max_length)
                && min > max
            {
                return Err(ValidationError::Template(format!(
                    "parameter '{name}' has MinLength {min} above MaxLength {max}"
                )));
            }
        }

        Ok(())
    }

    /// BLAKE3 digest of the template together with resolved parameter values
    ///
    /// Maps are ordered, so the same template and parameters always hash to
    /// the same digest regardless of source formatting.
    pub fn digest(&self, parameters: &BTreeMap<String, Value>) -> String {
        let mut hasher = blake3::Hasher::new();
        // Serializing plain data with string keys cannot fail.
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.update(&bytes);
        }
        hasher.update(b"\0");
        if let Ok(bytes) = serde_json::to_vec(parameters) {
            hasher.update(&bytes);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Logical names are ASCII alphanumerics; `::` is reserved for pseudo parameters
/// and `.` separates a resource from an attribute.
fn check_name(kind: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::Template(format!(
            "{kind} name '{name}' must be non-empty and alphanumeric"
        )));
    }
    Ok(())
}
