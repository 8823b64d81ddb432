use crate::cache::{HttpManifestSource, ManifestSource};
use crate::config::Config;
use crate::error::{ConfigError, ProxyError, Result};
use crate::registry::Registry;
use crate::state::open_counter_store;
use tracing::{error, info, warn};

/// Result of fetching one plugin's manifest during `check --fetch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestCheck {
    pub plugin: String,
    pub error: Option<String>,
    /// Manifest `Name` differs from the registry key, so proxied manifests won't refresh it.
    pub name_mismatch: bool,
}

pub async fn run_config_check(config: Config, fetch: bool) -> Result<()> {
    info!("Checking configuration...");
    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");
    info!("  Listen address: {}:{}", config.server.host, config.server.port);
    info!("  Base address: {}", config.server.base_address());

    let registry = Registry::load(&config.registry.path).await?;
    info!(
        "✓ Registry {} has {} entries",
        config.registry.path.display(),
        registry.len()
    );

    let counters = open_counter_store(&config.counters)?;
    info!("✓ Counter store '{}' is available", counters.backend_name());

    if !fetch {
        return Ok(());
    }

    let client = reqwest::Client::builder()
        .connect_timeout(config.proxy.connect_timeout())
        .build()
        .map_err(|e| ProxyError::Origin(e.to_string()))?;
    let source = HttpManifestSource::new(client, config.registry.fetch_timeout());
    let results = check_manifests(&registry, &source).await;

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed == 0 {
        info!("\n✓ All {} manifests fetched", results.len());
        Ok(())
    } else {
        Err(ProxyError::Config(ConfigError::Validation(format!(
            "{} of {} manifests could not be fetched",
            failed,
            results.len()
        ))))
    }
}

pub async fn check_manifests(registry: &Registry, source: &dyn ManifestSource) -> Vec<ManifestCheck> {
    let mut results = Vec::with_capacity(registry.len());

    for entry in registry.iter() {
        let check = match source.fetch(&entry.module_url).await {
            Ok(manifest) => {
                let name_mismatch = manifest
                    .name
                    .as_deref()
                    .map_or(true, |name| name != entry.internal_name);
                if name_mismatch {
                    warn!(
                        "  ! {}: manifest Name is {:?}",
                        entry.internal_name, manifest.name
                    );
                } else {
                    info!("  ✓ {}", entry.internal_name);
                }
                ManifestCheck {
                    plugin: entry.internal_name.clone(),
                    error: None,
                    name_mismatch,
                }
            }
            Err(e) => {
                error!("  ✗ {}: {}", entry.internal_name, e);
                ManifestCheck {
                    plugin: entry.internal_name.clone(),
                    error: Some(e.to_string()),
                    name_mismatch: false,
                }
            }
        };
        results.push(check);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::registry::Manifest;
    use async_trait::async_trait;

    struct StaticSource;

    #[async_trait]
    impl ManifestSource for StaticSource {
        async fn fetch(&self, url: &str) -> std::result::Result<Manifest, FetchError> {
            match url {
                "https://h/good/module.json" => Ok(Manifest {
                    name: Some("good".to_string()),
                    ..Default::default()
                }),
                "https://h/renamed/module.json" => Ok(Manifest {
                    name: Some("Renamed".to_string()),
                    ..Default::default()
                }),
                _ => Err(FetchError::Status(404)),
            }
        }
    }

    #[tokio::test]
    async fn test_check_manifests_reports_each_entry() {
        let registry = Registry::from_json(
            r#"[
                {"InternalName": "good", "Module": "https://h/good/module.json"},
                {"InternalName": "renamed", "Module": "https://h/renamed/module.json"},
                {"InternalName": "gone", "Module": "https://h/gone/module.json"}
            ]"#,
        )
        .unwrap();

        let results = check_manifests(&registry, &StaticSource).await;
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0],
            ManifestCheck {
                plugin: "good".to_string(),
                error: None,
                name_mismatch: false,
            }
        );
        assert!(results[1].name_mismatch);
        assert!(results[2].error.as_deref().unwrap().contains("404"));
    }
}
