//! Providers available to the command line

pub mod local;

use anyhow::Result;
use declarative::ProviderRegistry;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::Config;
pub use local::LocalProvider;

/// Build the provider registry for a stack
///
/// With no `[providers]` table in the config, every type in `seen` gets a
/// default local provider. Otherwise only the configured types are
/// registered, so a template using anything else fails validation.
pub fn registry(config: &Config, stack: &str, seen: &BTreeSet<String>) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if config.providers.is_empty() {
        for resource_type in seen {
            let root = config.provider_root(resource_type)?;
            registry.register(Arc::new(LocalProvider::new(resource_type, stack, &root)));
        }
        log::debug!("Registered {} default local provider(s)", registry.len());
        return Ok(registry);
    }

    for (resource_type, settings) in &config.providers {
        let root = config.provider_root(resource_type)?;
        let provider = LocalProvider::new(resource_type, stack, &root)
            .replace_on(settings.replace_on.iter().cloned())
            .export(settings.attributes.iter().cloned());
        log::debug!(
            "Local provider for {resource_type} at {}",
            provider.dir().display()
        );
        registry.register(Arc::new(provider));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use declarative::UpdatePolicy;

    fn seen(types: &[&str]) -> BTreeSet<String> {
        types.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_defaults_cover_seen_types() {
        // Nothing touches disk until a resource is created
        let config = Config::default();
        let registry = registry(&config, "demo", &seen(&["Storage::Bucket", "Access::Policy"])).unwrap();
        assert_eq!(
            registry.types().collect::<Vec<_>>(),
            vec!["Access::Policy", "Storage::Bucket"]
        );
    }

    #[test]
    fn test_configured_types_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.providers.insert(
            "Storage::Table".to_string(),
            ProviderConfig {
                replace_on: seen(&["KeySchema"]),
                attributes: vec![],
                root: Some(tmp.path().display().to_string()),
            },
        );

        let registry = registry(&config, "demo", &seen(&["Storage::Bucket"])).unwrap();
        assert!(!registry.contains("Storage::Bucket"));
        let table = registry.get("Storage::Table").unwrap();
        assert_eq!(table.update_policy("KeySchema"), UpdatePolicy::Replace);
    }

    #[test]
    fn test_engine_round_trip_on_disk() {
        use declarative::{
            ApplyOptions, AutoConfirm, DriftStatus, Engine, EngineSettings, NoProgress,
            ParameterInputs, Template, TemplateFormat,
        };
        use statestore::MemoryBackend;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        for resource_type in ["Storage::Bucket", "Access::Policy"] {
            config.providers.insert(
                resource_type.to_string(),
                ProviderConfig {
                    root: Some(tmp.path().display().to_string()),
                    ..Default::default()
                },
            );
        }
        let registry = registry(&config, "demo", &BTreeSet::new()).unwrap();
        let engine = Engine::new(
            Arc::new(MemoryBackend::new()),
            registry,
            EngineSettings::new("demo"),
        );

        let template = Template::parse(
            r#"{
                "Resources": {
                    "Logs": {"Type": "Storage::Bucket", "Properties": {"Name": "logs"}},
                    "Policy": {
                        "Type": "Access::Policy",
                        "Properties": {"Target": {"Fn::GetAtt": ["Logs", "Arn"]}}
                    }
                }
            }"#,
            TemplateFormat::Json,
        )
        .unwrap();
        let definition = engine.build(&template, &ParameterInputs::new()).unwrap();
        let run = engine
            .apply(&definition, &ApplyOptions::default(), &mut AutoConfirm, &mut NoProgress)
            .unwrap();
        assert!(run.report().unwrap().summary.is_success());

        let snapshot = engine.snapshot().unwrap();
        let logs = snapshot.get("Logs").unwrap();
        let policy = snapshot.get("Policy").unwrap();
        assert_eq!(
            policy.properties["Target"],
            serde_json::json!(format!("local:Storage::Bucket:{}", logs.physical_id))
        );

        // Delete the bucket behind the engine's back
        let bucket_file = tmp
            .path()
            .join("storage-bucket")
            .join(format!("{}.json", logs.physical_id));
        std::fs::remove_file(bucket_file).unwrap();
        let drift = engine.drift().unwrap();
        assert_eq!(drift.get("Logs").unwrap().status, DriftStatus::Deleted);
        assert_eq!(drift.get("Policy").unwrap().status, DriftStatus::InSync);

        engine
            .destroy(&ApplyOptions::default(), &mut AutoConfirm, &mut NoProgress)
            .unwrap();
        assert!(engine.snapshot().unwrap().is_empty());
    }
}
