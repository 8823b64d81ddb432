//! Rewrites cached records for clients that reach origin assets through this service.
//!
//! Only the readme URL is redirected. The manifest URL stays at its origin so clients
//! keep the real update source when they persist it.

use crate::registry::{PluginRecord, ProxiedPluginRecord};
use crate::url_path::last_segment;

pub fn derive_proxied(record: &PluginRecord, base_address: &str) -> ProxiedPluginRecord {
    let readme_file = record
        .entry
        .readme_url
        .as_deref()
        .map(last_segment)
        .unwrap_or_default();

    let mut proxied = record.clone();
    proxied.entry.readme_url = Some(format!(
        "{}/plugin/{}/readme/{}",
        base_address.trim_end_matches('/'),
        record.internal_name(),
        readme_file
    ));
    ProxiedPluginRecord(proxied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryEntry;

    fn record(readme_url: Option<&str>) -> PluginRecord {
        PluginRecord::degraded(
            &RegistryEntry {
                internal_name: "foo".to_string(),
                image_url: None,
                readme_url: readme_url.map(str::to_string),
                module_url: "https://host/pkg/module.json".to_string(),
                release_date: None,
            },
            4,
        )
    }

    #[test]
    fn test_readme_points_at_service() {
        let proxied = derive_proxied(&record(Some("https://host/docs/readme.md")), "https://svc");

        assert_eq!(
            proxied.record().entry.readme_url.as_deref(),
            Some("https://svc/plugin/foo/readme/readme.md")
        );
        assert_eq!(
            proxied.record().entry.module_url,
            "https://host/pkg/module.json"
        );
        assert_eq!(proxied.record().downloads, 4);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let source = record(Some("https://host/docs/README.md"));
        assert_eq!(
            derive_proxied(&source, "https://svc"),
            derive_proxied(&source, "https://svc")
        );
    }

    #[test]
    fn test_missing_readme_yields_empty_segment() {
        let proxied = derive_proxied(&record(None), "http://localhost:5002/");
        assert_eq!(
            proxied.record().entry.readme_url.as_deref(),
            Some("http://localhost:5002/plugin/foo/readme/")
        );
    }
}
