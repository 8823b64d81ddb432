//! Plugin registry model
//!
//! The registry is the static list of known plugins loaded once at startup. Each entry
//! points at a remotely hosted manifest (`module.json`) whose fields are merged into the
//! cached [`PluginRecord`]. Field names on the wire keep the PascalCase shape that
//! existing clients expect.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Entry of `registry.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistryEntry {
    pub internal_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "Readme", default, skip_serializing_if = "Option::is_none")]
    pub readme_url: Option<String>,
    #[serde(rename = "Module")]
    pub module_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
}

/// Update section of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestUpdate {
    #[serde(default)]
    pub update_url: Option<String>,
    #[serde(default)]
    pub minimum_version: Option<String>,
}

/// Remote `module.json`. Every field is optional because the document is untrusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub update: Option<ManifestUpdate>,
}

pub const DEFAULT_VERSION: &str = "0.0";

/// Cached view of one registry entry enriched with manifest data and install count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginRecord {
    #[serde(flatten)]
    pub entry: RegistryEntry,
    pub display_name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub version: String,
    pub min_version: String,
    pub downloads: u64,
}

impl PluginRecord {
    /// Merge a fetched manifest over registry defaults.
    pub fn from_manifest(entry: &RegistryEntry, manifest: Manifest, downloads: u64) -> Self {
        let mut merged = entry.clone();
        if let Some(image_url) = non_empty(manifest.image_url) {
            merged.image_url = Some(image_url);
        }
        if let Some(release_date) = non_empty(manifest.release_date) {
            merged.release_date = Some(release_date);
        }

        let display_name = non_empty(manifest.display_name)
            .or_else(|| non_empty(manifest.name))
            .unwrap_or_else(|| entry.internal_name.clone());
        let min_version = manifest
            .update
            .and_then(|u| non_empty(u.minimum_version))
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        Self {
            entry: merged,
            display_name,
            description: non_empty(manifest.description),
            author: non_empty(manifest.author),
            version: non_empty(manifest.version).unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            min_version,
            downloads,
        }
    }

    /// Record built from registry data alone, used when the manifest is unavailable.
    pub fn degraded(entry: &RegistryEntry, downloads: u64) -> Self {
        Self {
            entry: entry.clone(),
            display_name: entry.internal_name.clone(),
            description: None,
            author: None,
            version: DEFAULT_VERSION.to_string(),
            min_version: DEFAULT_VERSION.to_string(),
            downloads,
        }
    }

    pub fn internal_name(&self) -> &str {
        &self.entry.internal_name
    }
}

/// [`PluginRecord`] whose intercepted asset URLs point back at this service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxiedPluginRecord(pub PluginRecord);

impl ProxiedPluginRecord {
    pub fn record(&self) -> &PluginRecord {
        &self.0
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Ordered, immutable set of registry entries with lookup by internal name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn from_entries(entries: Vec<RegistryEntry>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if entry.internal_name.is_empty() {
                return Err(ProxyError::Registry(format!(
                    "Entry #{} has an empty InternalName",
                    position
                )));
            }
            if entry.module_url.is_empty() {
                return Err(ProxyError::Registry(format!(
                    "Plugin '{}' has an empty Module url",
                    entry.internal_name
                )));
            }
            if index.insert(entry.internal_name.clone(), position).is_some() {
                return Err(ProxyError::Registry(format!(
                    "Duplicate plugin name '{}'",
                    entry.internal_name
                )));
            }
        }

        Ok(Self { entries, index })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<RegistryEntry> = serde_json::from_str(json)
            .map_err(|e| ProxyError::Registry(format!("Failed to parse registry: {}", e)))?;
        Self::from_entries(entries)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProxyError::Registry(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let registry = Self::from_json(&content)?;
        tracing::info!(
            "Loaded {} registry entries from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn get(&self, internal_name: &str) -> Option<&RegistryEntry> {
        self.index.get(internal_name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, internal_name: &str) -> bool {
        self.index.contains_key(internal_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> RegistryEntry {
        RegistryEntry {
            internal_name: "Plugin.Sync".to_string(),
            image_url: Some("https://h/registry.png".to_string()),
            readme_url: Some("https://h/docs/README.md".to_string()),
            module_url: "https://h/pkg/module.json".to_string(),
            release_date: Some("2021-01-01".to_string()),
        }
    }

    #[test]
    fn test_registry_parses_pascal_case() {
        let registry = Registry::from_json(
            r#"[
                {"InternalName": "a", "Module": "https://h/a/module.json"},
                {"InternalName": "b", "Module": "https://h/b/module.json", "Readme": "https://h/b/README.md"}
            ]"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert_eq!(
            registry.get("b").unwrap().readme_url.as_deref(),
            Some("https://h/b/README.md")
        );
        let names: Vec<_> = registry.iter().map(|e| e.internal_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_registry_rejects_missing_module() {
        let err = Registry::from_json(r#"[{"InternalName": "a"}]"#).unwrap_err();
        assert!(matches!(err, ProxyError::Registry(_)));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = Registry::from_json(
            r#"[
                {"InternalName": "a", "Module": "https://h/a/module.json"},
                {"InternalName": "a", "Module": "https://h/other/module.json"}
            ]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_record_prefers_manifest_fields() {
        let manifest = Manifest {
            name: Some("Sync".to_string()),
            display_name: Some("Sync Plugin".to_string()),
            description: Some("Keeps things in sync".to_string()),
            author: Some("someone".to_string()),
            version: Some("1.2".to_string()),
            image_url: Some("https://h/pkg/icon.png".to_string()),
            release_date: None,
            update: Some(ManifestUpdate {
                update_url: None,
                minimum_version: Some("1.0".to_string()),
            }),
        };

        let record = PluginRecord::from_manifest(&entry(), manifest, 7);
        assert_eq!(record.display_name, "Sync Plugin");
        assert_eq!(record.version, "1.2");
        assert_eq!(record.min_version, "1.0");
        assert_eq!(record.downloads, 7);
        assert_eq!(
            record.entry.image_url.as_deref(),
            Some("https://h/pkg/icon.png")
        );
        assert_eq!(record.entry.release_date.as_deref(), Some("2021-01-01"));
    }

    #[test]
    fn test_record_display_name_fallbacks() {
        let by_name = PluginRecord::from_manifest(
            &entry(),
            Manifest {
                name: Some("Sync".to_string()),
                display_name: Some(String::new()),
                ..Default::default()
            },
            0,
        );
        assert_eq!(by_name.display_name, "Sync");
        assert_eq!(by_name.version, DEFAULT_VERSION);

        let by_internal = PluginRecord::from_manifest(&entry(), Manifest::default(), 0);
        assert_eq!(by_internal.display_name, "Plugin.Sync");
        assert_eq!(by_internal.min_version, DEFAULT_VERSION);
    }

    #[test]
    fn test_degraded_record() {
        let record = PluginRecord::degraded(&entry(), 12);
        assert_eq!(record.display_name, "Plugin.Sync");
        assert_eq!(record.version, "0.0");
        assert_eq!(record.min_version, "0.0");
        assert_eq!(record.downloads, 12);
        assert!(record.description.is_none());
    }

    #[test]
    fn test_record_wire_shape() {
        let record = PluginRecord::degraded(&entry(), 3);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["InternalName"], "Plugin.Sync");
        assert_eq!(value["Module"], "https://h/pkg/module.json");
        assert_eq!(value["Readme"], "https://h/docs/README.md");
        assert_eq!(value["DisplayName"], "Plugin.Sync");
        assert_eq!(value["MinVersion"], "0.0");
        assert_eq!(value["Downloads"], 3);
        assert_eq!(value["Description"], json!(null));
    }
}
