//! File-backed resource provider
//!
//! Each physical resource is one JSON document under
//! `<root>/<resource type>/<physical id>.json`. Useful for trying templates
//! end to end and for tests; nothing leaves the local machine.

use chrono::{DateTime, Utc};
use declarative::{
    CreatedResource, ProviderError, Properties, PropertyChange, ResourceProvider, UpdatePolicy,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Attribute every local resource exports
pub const ARN_ATTRIBUTE: &str = "Arn";

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    logical_id: String,
    resource_type: String,
    properties: Properties,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Stores resources of one type as JSON files
#[derive(Debug, Clone)]
pub struct LocalProvider {
    resource_type: String,
    stack: String,
    dir: PathBuf,
    replace_on: BTreeSet<String>,
    attributes: Vec<String>,
}

impl LocalProvider {
    pub fn new(resource_type: impl Into<String>, stack: impl Into<String>, root: &Path) -> Self {
        let resource_type = resource_type.into();
        let dir = root.join(type_dir(&resource_type));
        Self {
            resource_type,
            stack: stack.into(),
            dir,
            replace_on: BTreeSet::new(),
            attributes: Vec::new(),
        }
    }

    /// Properties whose change forces a replacement
    pub fn replace_on(mut self, properties: impl IntoIterator<Item = String>) -> Self {
        self.replace_on.extend(properties);
        self
    }

    /// Properties copied into the exported attributes
    pub fn export(mut self, properties: impl IntoIterator<Item = String>) -> Self {
        self.attributes.extend(properties);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, physical_id: &str) -> PathBuf {
        self.dir.join(format!("{physical_id}.json"))
    }

    fn physical_id(&self, logical_id: &str, properties: &Properties, now: DateTime<Utc>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.resource_type.as_bytes());
        hasher.update(logical_id.as_bytes());
        hasher.update(&serde_json::to_vec(properties).unwrap_or_default());
        hasher.update(&now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        let hash = hasher.finalize().to_hex();
        format!(
            "{}-{}-{}",
            self.stack.to_lowercase(),
            logical_id.to_lowercase(),
            &hash.as_str()[..8]
        )
    }

    fn attributes_for(&self, physical_id: &str, properties: &Properties) -> Properties {
        let mut attributes = Properties::new();
        attributes.insert(
            ARN_ATTRIBUTE.to_string(),
            Value::String(format!("local:{}:{physical_id}", self.resource_type)),
        );
        for name in &self.attributes {
            if let Some(value) = properties.get(name) {
                attributes.insert(name.clone(), value.clone());
            }
        }
        attributes
    }

    fn read(&self, physical_id: &str) -> Result<Document, ProviderError> {
        let path = self.path(physical_id);
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProviderError::not_found(format!(
                "{} {physical_id} does not exist",
                self.resource_type
            )),
            _ => ProviderError::failed(format!("could not read {}: {e}", path.display())),
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ProviderError::failed(format!("corrupt resource {}: {e}", path.display())))
    }

    fn write(&self, physical_id: &str, document: &Document) -> Result<(), ProviderError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            ProviderError::failed(format!("could not create {}: {e}", self.dir.display()))
        })?;
        let content = serde_json::to_string_pretty(document)
            .map_err(|e| ProviderError::failed(format!("could not encode resource: {e}")))?;

        // Write then rename so a crash never leaves half a document
        let path = self.path(physical_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| ProviderError::failed(format!("could not write {}: {e}", path.display())))
    }
}

impl ResourceProvider for LocalProvider {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn describe(&self, physical_id: &str) -> Result<Properties, ProviderError> {
        Ok(self.read(physical_id)?.properties)
    }

    fn create(
        &self,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<CreatedResource, ProviderError> {
        let now = Utc::now();
        let physical_id = self.physical_id(logical_id, properties, now);
        if self.path(&physical_id).exists() {
            return Err(ProviderError::rejected(format!(
                "{} {physical_id} already exists",
                self.resource_type
            )));
        }

        self.write(
            &physical_id,
            &Document {
                logical_id: logical_id.to_string(),
                resource_type: self.resource_type.clone(),
                properties: properties.clone(),
                created_at: now,
                updated_at: now,
            },
        )?;
        log::debug!("Created {} {physical_id}", self.resource_type);

        Ok(CreatedResource {
            attributes: self.attributes_for(&physical_id, properties),
            physical_id,
        })
    }

    fn update(
        &self,
        physical_id: &str,
        changes: &[PropertyChange],
        desired: &Properties,
    ) -> Result<Properties, ProviderError> {
        if let Some(change) = changes.iter().find(|c| self.replace_on.contains(&c.property)) {
            return Err(ProviderError::rejected(format!(
                "{} cannot be changed in place",
                change.property
            )));
        }

        let mut document = self.read(physical_id)?;
        document.properties = desired.clone();
        document.updated_at = Utc::now();
        self.write(physical_id, &document)?;
        log::debug!(
            "Updated {} {physical_id} ({} change(s))",
            self.resource_type,
            changes.len()
        );

        Ok(self.attributes_for(physical_id, desired))
    }

    fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        let path = self.path(physical_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Deleted {} {physical_id}", self.resource_type);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ProviderError::not_found(
                format!("{} {physical_id} does not exist", self.resource_type),
            )),
            Err(e) => Err(ProviderError::failed(format!(
                "could not delete {}: {e}",
                path.display()
            ))),
        }
    }

    fn update_policy(&self, property: &str) -> UpdatePolicy {
        if self.replace_on.contains(property) {
            UpdatePolicy::Replace
        } else {
            UpdatePolicy::InPlace
        }
    }
}

/// Directory name for a resource type (`Storage::Bucket` -> `storage-bucket`)
fn type_dir(resource_type: &str) -> String {
    resource_type
        .split("::")
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}
